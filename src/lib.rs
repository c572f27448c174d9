//! nano-batch: a minimalistic continuous-batching scheduler and paged
//! KV-cache manager for LLM serving.
//!
//! The crate covers the resource-management core of an autoregressive
//! token-generation runtime:
//! - Block-level KV allocation with reference-counted sharing and
//!   prefix-cache reuse
//! - A request scheduler with whole-prompt and dynamic split-fuse batching
//!   policies, including preemption and recomputation under cache pressure
//! - A speculative-decoding coordinator driving a draft and a main model
//!   over the same machinery
//!
//! The model itself is an external collaborator behind the
//! [`ModelRunner`](engine::ModelRunner) trait: the pipeline hands it
//! input ids, positions, a slot mapping and block tables, and consumes the
//! logits it returns.

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;
pub mod speculative;
pub mod testing;

pub use config::{GenerationConfig, SchedulerConfig, StopCriteria};
pub use engine::{
    ContinuousBatchingPipeline, GenerationHandle, GenerationOutput, GenerationResult,
    GenerationStatus, ModelRunner, PipelineMetrics,
};
pub use error::{Error, Result};
pub use scheduler::{Scheduler, SchedulerOutput};
pub use speculative::{SpeculativeConfig, SpeculativeDecodingPipeline};
