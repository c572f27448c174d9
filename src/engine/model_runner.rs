//! The contract between the scheduler and the model-execution backend.
//!
//! The engine behind this trait is opaque: it accepts flat input-id,
//! position-id, slot-mapping and block-table tensors, writes KV state into
//! the cache slots it is told about, and returns logits. It owns no
//! sequence state of its own; everything it needs to know about a step is
//! in the [`ForwardInput`].

use crate::core::block::BlockId;
use crate::error::Result;

/// Flattened inputs for one forward pass.
///
/// Token-level vectors (`input_ids`, `position_ids`, `slot_mapping`) hold
/// one entry per scheduled token, sequences concatenated in scheduling
/// order. Sequence-level vectors (`seq_lens`, `context_lens`,
/// `block_tables`) hold one entry per scheduled sequence, in the same
/// order; `seq_lens` gives the row boundaries within the token-level
/// vectors.
#[derive(Debug, Clone, Default)]
pub struct ForwardInput {
    /// Token ids to compute, length `total_num_scheduled_tokens`.
    pub input_ids: Vec<u32>,
    /// Absolute position of each token in its sequence.
    pub position_ids: Vec<usize>,
    /// Destination KV slot of each token
    /// (`block_id * block_size + offset`).
    pub slot_mapping: Vec<usize>,
    /// Tokens contributed by each sequence.
    pub seq_lens: Vec<usize>,
    /// Per-sequence committed context length after this step.
    pub context_lens: Vec<usize>,
    /// Per-sequence block tables for reading prior KV.
    pub block_tables: Vec<Vec<BlockId>>,
    /// Whole-prompt policy phase flag.
    pub is_prompt: bool,
}

/// Logits produced by a forward pass: one row per input token, in input
/// order.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    pub logits: Vec<Vec<f32>>,
}

/// Opaque inference engine consumed by the pipeline.
pub trait ModelRunner {
    /// Execute one forward pass, writing KV for every token in the input
    /// into its mapped slot and returning a logits row per token.
    fn forward(&mut self, input: &ForwardInput) -> Result<ForwardOutput>;

    /// Physically copy one block's KV content onto another. Issued for
    /// copy-on-write clones before the forward pass that reads them.
    fn copy_block(&mut self, src: BlockId, dst: BlockId) -> Result<()>;

    /// Size of the vocabulary the logits rows cover.
    fn vocab_size(&self) -> usize;
}
