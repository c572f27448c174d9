//! Deterministic model doubles for testing engine logic without a real
//! backend.
//!
//! [`StepModel`] implements a tiny Markov "language model": the logits row
//! for input token `t` is a one-hot at `(t * a + b) % vocab_size`. Because
//! the next token depends only on the previous one, recomputation after
//! preemption, prefix-cache restoration and speculative-decoding rollback
//! all reproduce the same stream, which is exactly what the equivalence
//! tests need.

use std::collections::HashSet;

use crate::core::block::BlockId;
use crate::engine::model_runner::{ForwardInput, ForwardOutput, ModelRunner};
use crate::error::{Error, Result};

/// Deterministic affine-successor model.
pub struct StepModel {
    vocab_size: usize,
    mul: u32,
    add: u32,
    /// Copy directives observed, for copy-on-write assertions.
    pub copied_blocks: Vec<(BlockId, BlockId)>,
    /// Distinct KV slots written across all forwards.
    pub slots_written: HashSet<usize>,
    pub forward_calls: usize,
}

impl StepModel {
    pub fn new(vocab_size: usize) -> Self {
        Self::with_rule(vocab_size, 1, 1)
    }

    /// Successor rule `next = (token * mul + add) % vocab_size`.
    pub fn with_rule(vocab_size: usize, mul: u32, add: u32) -> Self {
        Self {
            vocab_size,
            mul,
            add,
            copied_blocks: Vec::new(),
            slots_written: HashSet::new(),
            forward_calls: 0,
        }
    }

    pub fn successor(&self, token: u32) -> u32 {
        (token.wrapping_mul(self.mul).wrapping_add(self.add)) % self.vocab_size as u32
    }
}

impl ModelRunner for StepModel {
    fn forward(&mut self, input: &ForwardInput) -> Result<ForwardOutput> {
        self.forward_calls += 1;
        self.slots_written.extend(input.slot_mapping.iter().copied());
        let logits = input
            .input_ids
            .iter()
            .map(|&token| {
                let mut row = vec![0.0f32; self.vocab_size];
                row[self.successor(token) as usize] = 8.0;
                row
            })
            .collect();
        Ok(ForwardOutput { logits })
    }

    fn copy_block(&mut self, src: BlockId, dst: BlockId) -> Result<()> {
        self.copied_blocks.push((src, dst));
        Ok(())
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

/// Model double that fails on a chosen forward call, for error-path tests.
pub struct FailingModel {
    inner: StepModel,
    fail_on_call: usize,
    calls: usize,
}

impl FailingModel {
    pub fn new(vocab_size: usize, fail_on_call: usize) -> Self {
        Self {
            inner: StepModel::new(vocab_size),
            fail_on_call,
            calls: 0,
        }
    }
}

impl ModelRunner for FailingModel {
    fn forward(&mut self, input: &ForwardInput) -> Result<ForwardOutput> {
        self.calls += 1;
        if self.calls == self.fail_on_call {
            return Err(Error::ModelRuntime("injected failure".to_string()));
        }
        self.inner.forward(input)
    }

    fn copy_block(&mut self, src: BlockId, dst: BlockId) -> Result<()> {
        self.inner.copy_block(src, dst)
    }

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_chain_wraps() {
        let model = StepModel::new(10);
        assert_eq!(model.successor(3), 4);
        assert_eq!(model.successor(9), 0);
    }

    #[test]
    fn forward_is_one_hot_per_input() {
        let mut model = StepModel::new(8);
        let input = ForwardInput {
            input_ids: vec![1, 2, 3],
            position_ids: vec![0, 1, 2],
            slot_mapping: vec![0, 1, 2],
            seq_lens: vec![3],
            context_lens: vec![3],
            block_tables: vec![vec![0]],
            is_prompt: true,
        };
        let out = model.forward(&input).unwrap();
        assert_eq!(out.logits.len(), 3);
        assert_eq!(crate::engine::sampler::argmax(&out.logits[2]), 4);
    }
}
