//! Speculative decoding: a draft model proposes, the main model disposes.

pub mod config;
pub mod pipeline;

pub use config::SpeculativeConfig;
pub use pipeline::SpeculativeDecodingPipeline;
