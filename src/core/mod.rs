//! Core data structures: blocks, block tables, sequences.

pub mod block;
pub mod block_store;
pub mod block_table;
pub mod prefix_cache;
pub mod sequence;

pub use block::{Block, BlockId, DEFAULT_BLOCK_SIZE};
pub use block_store::BlockStore;
pub use block_table::{BlockCopy, BlockTable, BlockTableManager};
pub use prefix_cache::PrefixCache;
pub use sequence::{
    GenerationFinishReason, RequestId, Sequence, SequenceGroup, SequenceId, SequenceStatus,
};
