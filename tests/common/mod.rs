//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use nano_batch::core::block::BlockId;
use nano_batch::core::sequence::SequenceGroup;
use nano_batch::engine::{ForwardInput, ForwardOutput, ModelRunner};
use nano_batch::scheduler::SchedulerOutput;
use nano_batch::testing::StepModel;
use nano_batch::Result;

/// Close one scheduler iteration for a group, committing the scheduled
/// token positions. Mirrors what the pipeline does after a forward pass.
pub fn finish_iteration(group: &mut SequenceGroup) {
    let scheduled = group.num_scheduled_tokens();
    group.advance_processed(scheduled);
}

/// Append a sampled token to every running sequence of the scheduled
/// groups, then close their iterations.
pub fn append_and_finish(requests: &mut [SequenceGroup], out: &SchedulerOutput, token: u32) {
    for group in requests.iter_mut() {
        if out.scheduled_group_ids.contains(&group.request_id()) {
            for seq in group.running_sequences_mut() {
                seq.append_token(token, -0.1);
            }
            finish_iteration(group);
        }
    }
}

/// Per-forward log kept outside the pipeline, since the pipeline owns its
/// model box.
#[derive(Debug, Default)]
pub struct ForwardLog {
    /// Number of input tokens per forward call.
    pub tokens_per_call: Vec<usize>,
    /// Copy directives seen, in order.
    pub copies: Vec<(BlockId, BlockId)>,
}

/// Model double that records every forward through a shared log.
pub struct RecordingModel {
    inner: StepModel,
    log: Arc<Mutex<ForwardLog>>,
}

impl RecordingModel {
    pub fn new(vocab_size: usize) -> (Self, Arc<Mutex<ForwardLog>>) {
        let log = Arc::new(Mutex::new(ForwardLog::default()));
        (
            Self {
                inner: StepModel::new(vocab_size),
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl ModelRunner for RecordingModel {
    fn forward(&mut self, input: &ForwardInput) -> Result<ForwardOutput> {
        self.log
            .lock()
            .unwrap()
            .tokens_per_call
            .push(input.input_ids.len());
        self.inner.forward(input)
    }

    fn copy_block(&mut self, src: BlockId, dst: BlockId) -> Result<()> {
        self.log.lock().unwrap().copies.push((src, dst));
        self.inner.copy_block(src, dst)
    }

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }
}

/// The token stream `StepModel::new` produces from the last prompt token.
pub fn expected_chain(last_prompt_token: u32, vocab_size: u32, len: usize) -> Vec<u32> {
    let mut tokens = Vec::with_capacity(len);
    let mut current = last_prompt_token;
    for _ in 0..len {
        current = (current + 1) % vocab_size;
        tokens.push(current);
    }
    tokens
}
