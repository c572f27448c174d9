//! Error types for nano-batch.

use thiserror::Error;

/// Result type alias for nano-batch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-batch.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// Sequence not found in the block table manager.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),

    /// Request not found in the pipeline.
    #[error("request {0} not found")]
    RequestNotFound(u64),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Generation or scheduler configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The model backend failed while executing a forward pass.
    #[error("model runtime error: {0}")]
    ModelRuntime(String),

    /// The generation handle was dropped and can no longer be read.
    #[error("generation handle was dropped")]
    HandleDropped,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
