//! Sequences and sequence groups.
//!
//! A [`SequenceGroup`] is one user request: the prompt, the sampling
//! parameters and one or more [`Sequence`]s (beam search and multinomial
//! sampling fork children). Sequences within a group advance in lockstep,
//! so the number of KV-committed tokens is tracked at the group level.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::GenerationConfig;
use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Identifier of a user request (one per sequence group).
pub type RequestId = u64;

static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_sequence_id() -> SequenceId {
    SEQUENCE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Status of a sequence in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting in queue to be scheduled.
    Waiting,
    /// Actively generating tokens.
    Running,
    /// Finished generation (EOS or length limit).
    Finished,
    /// Removed before finishing (handle drop, pipeline drop, or beam kill).
    Dropped,
}

impl SequenceStatus {
    /// Terminal states accept no further tokens.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Dropped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Finished => "Finished",
            Self::Dropped => "Dropped",
        }
    }
}

/// Why a streamed token sequence stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationFinishReason {
    /// Still running, or dropped before a stop condition.
    #[default]
    None,
    /// End-of-sequence token was generated.
    Stop,
    /// `max_new_tokens` or `max_length` was reached.
    Length,
}

/// A single token stream belonging to a [`SequenceGroup`].
#[derive(Debug, Clone)]
pub struct Sequence {
    seq_id: SequenceId,
    generated_ids: Vec<u32>,
    generated_log_probs: Vec<f32>,
    cumulative_log_prob: f32,
    status: SequenceStatus,
    finish_reason: GenerationFinishReason,
}

impl Sequence {
    /// Create a waiting sequence with a globally unique id.
    pub fn new() -> Self {
        Self {
            seq_id: next_sequence_id(),
            generated_ids: Vec::new(),
            generated_log_probs: Vec::new(),
            cumulative_log_prob: 0.0,
            status: SequenceStatus::Waiting,
            finish_reason: GenerationFinishReason::None,
        }
    }

    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn finish_reason(&self) -> GenerationFinishReason {
        self.finish_reason
    }

    /// Generated token ids, prompt excluded.
    pub fn get_generated_ids(&self) -> &[u32] {
        &self.generated_ids
    }

    /// Log-probabilities of the generated tokens, index-aligned with
    /// [`get_generated_ids`](Self::get_generated_ids).
    pub fn get_generated_log_probs(&self) -> &[f32] {
        &self.generated_log_probs
    }

    /// Sum of the generated tokens' log-probabilities.
    pub fn cumulative_log_prob(&self) -> f32 {
        self.cumulative_log_prob
    }

    pub fn num_generated(&self) -> usize {
        self.generated_ids.len()
    }

    /// Append a generated token with its log-probability.
    pub fn append_token(&mut self, token_id: u32, log_prob: f32) {
        self.generated_ids.push(token_id);
        self.generated_log_probs.push(log_prob);
        self.cumulative_log_prob += log_prob;
    }

    /// Truncate the generated tail down to `len` tokens.
    ///
    /// Used by speculative-decoding rollback and validation: the removed
    /// tokens never happened as far as the caller is concerned.
    pub fn truncate_generated(&mut self, len: usize) {
        if len >= self.generated_ids.len() {
            return;
        }
        for &lp in &self.generated_log_probs[len..] {
            self.cumulative_log_prob -= lp;
        }
        self.generated_ids.truncate(len);
        self.generated_log_probs.truncate(len);
    }

    pub fn is_running(&self) -> bool {
        self.status == SequenceStatus::Running
    }

    /// Transition to running.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting | SequenceStatus::Running => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition back to waiting (full preemption).
    pub fn set_waiting(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running | SequenceStatus::Waiting => {
                self.status = SequenceStatus::Waiting;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Waiting",
            }),
        }
    }

    /// Mark the sequence finished with the given reason.
    pub fn set_finished(&mut self, reason: GenerationFinishReason) {
        self.status = SequenceStatus::Finished;
        self.finish_reason = reason;
    }

    /// Mark the sequence dropped. Generated tokens stay readable.
    pub fn set_dropped(&mut self) {
        self.status = SequenceStatus::Dropped;
    }

    /// Reset a terminal sequence back to waiting. Used when a chat turn's
    /// hidden group is parked between turns.
    pub(crate) fn reset_to_waiting(&mut self) {
        self.status = SequenceStatus::Waiting;
        self.finish_reason = GenerationFinishReason::None;
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

/// A single generation request and its child sequences.
#[derive(Debug)]
pub struct SequenceGroup {
    request_id: RequestId,
    prompt_ids: Vec<u32>,
    sequences: Vec<Sequence>,
    sampling_params: GenerationConfig,
    block_size: usize,
    /// Admission ordinal assigned by the pipeline; ties follow list order.
    arrival: u64,
    /// Tokens whose KV has been committed, shared by all child sequences.
    num_processed_tokens: usize,
    /// Tokens scheduled for the in-flight iteration, per sequence.
    num_scheduled_tokens: usize,
    /// Set when the prompt can never fit the cache.
    ignored: bool,
    /// Parked between chat turns: keeps its blocks but is not scheduled.
    on_hold: bool,
}

impl SequenceGroup {
    /// Create a group with a single waiting sequence.
    pub fn new(
        request_id: RequestId,
        prompt_ids: Vec<u32>,
        sampling_params: GenerationConfig,
        block_size: usize,
    ) -> Self {
        Self {
            request_id,
            prompt_ids,
            sequences: vec![Sequence::new()],
            sampling_params,
            block_size,
            arrival: 0,
            num_processed_tokens: 0,
            num_scheduled_tokens: 0,
            ignored: false,
            on_hold: false,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn prompt_ids(&self) -> &[u32] {
        &self.prompt_ids
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_ids.len()
    }

    /// Extend the prompt in place. Used by chat mode between turns, where
    /// the previous turn's tokens become history for the next one.
    pub fn extend_prompt(&mut self, token_ids: &[u32]) {
        self.prompt_ids.extend_from_slice(token_ids);
    }

    /// Fold a sequence's generated tokens into the prompt.
    ///
    /// Chat mode parks its hidden group this way at the end of a turn: the
    /// KV stays committed and the next turn appends on top of it.
    pub fn absorb_generated_into_prompt(&mut self) {
        let generated: Vec<u32> = self.sequences[0].get_generated_ids().to_vec();
        self.prompt_ids.extend_from_slice(&generated);
        self.sequences[0].generated_ids.clear();
        self.sequences[0].generated_log_probs.clear();
        self.sequences[0].cumulative_log_prob = 0.0;
    }

    pub fn sampling_params(&self) -> &GenerationConfig {
        &self.sampling_params
    }

    /// Replace the sampling parameters; chat turns may change them.
    pub fn set_sampling_params(&mut self, params: GenerationConfig) {
        self.sampling_params = params;
    }

    /// A parked group keeps its blocks but is skipped by the scheduler.
    pub fn is_on_hold(&self) -> bool {
        self.on_hold
    }

    pub fn set_on_hold(&mut self, on_hold: bool) {
        self.on_hold = on_hold;
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    pub fn set_arrival(&mut self, arrival: u64) {
        self.arrival = arrival;
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn sequences_mut(&mut self) -> &mut [Sequence] {
        &mut self.sequences
    }

    pub fn get_sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.seq_id() == seq_id)
    }

    pub fn get_sequence_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        self.sequences.iter_mut().find(|s| s.seq_id() == seq_id)
    }

    /// Sequences currently in the running state.
    pub fn running_sequences(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter().filter(|s| s.is_running())
    }

    pub fn running_sequences_mut(&mut self) -> impl Iterator<Item = &mut Sequence> {
        self.sequences.iter_mut().filter(|s| s.is_running())
    }

    pub fn num_running_seqs(&self) -> usize {
        self.running_sequences().count()
    }

    pub fn running_seq_ids(&self) -> Vec<SequenceId> {
        self.running_sequences().map(|s| s.seq_id()).collect()
    }

    /// Sequences whose KV is scheduled this step: running ones, or the
    /// waiting ones about to be admitted.
    pub fn schedulable_seq_ids(&self) -> Vec<SequenceId> {
        self.sequences
            .iter()
            .filter(|s| !s.status().is_terminal())
            .map(|s| s.seq_id())
            .collect()
    }

    /// The group sits in the admission queue: nothing runs, something waits.
    pub fn is_waiting(&self) -> bool {
        self.sequences.iter().all(|s| !s.is_running())
            && self
                .sequences
                .iter()
                .any(|s| s.status() == SequenceStatus::Waiting)
    }

    pub fn is_running(&self) -> bool {
        self.sequences.iter().any(|s| s.is_running())
    }

    /// All child sequences reached a terminal state.
    pub fn has_finished(&self) -> bool {
        self.sequences.iter().all(|s| s.status().is_terminal())
    }

    /// Marked unschedulable because the prompt exceeds the whole cache.
    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    /// Drop the group as too large for the cache. Any tokens generated so
    /// far stay readable on the sequences.
    pub fn set_ignored(&mut self) {
        self.ignored = true;
        for seq in &mut self.sequences {
            if !seq.status().is_terminal() {
                seq.set_dropped();
            }
        }
    }

    /// Drop every live sequence (handle drop or pipeline drop).
    pub fn drop_sequences(&mut self) {
        for seq in &mut self.sequences {
            if !seq.status().is_terminal() {
                seq.set_dropped();
            }
        }
    }

    /// Prompt plus the longest live generated tail.
    pub fn context_len(&self) -> usize {
        let generated = self
            .sequences
            .iter()
            .filter(|s| !s.status().is_terminal())
            .map(|s| s.num_generated())
            .max()
            .unwrap_or(0);
        self.prompt_ids.len() + generated
    }

    /// Full token stream of one sequence: prompt followed by its tail.
    pub fn all_token_ids(&self, seq_id: SequenceId) -> Option<Vec<u32>> {
        let seq = self.get_sequence(seq_id)?;
        let mut tokens = self.prompt_ids.clone();
        tokens.extend_from_slice(seq.get_generated_ids());
        Some(tokens)
    }

    pub fn num_processed_tokens(&self) -> usize {
        self.num_processed_tokens
    }

    pub fn num_scheduled_tokens(&self) -> usize {
        self.num_scheduled_tokens
    }

    /// Per-sequence token count the scheduler should plan for the next step.
    ///
    /// For a waiting group this is the uncomputed context (the whole prompt,
    /// or its remainder after chunking or preemption). For a running group
    /// the step normally covers one fresh token; after a partial preemption
    /// the rewound suffix is re-streamed as well. The count never drops to
    /// zero for a running group: the upcoming token always needs a slot.
    pub fn num_tokens_to_schedule(&self) -> usize {
        let remaining = self.context_len().saturating_sub(self.num_processed_tokens);
        if self.is_running() {
            remaining.max(1)
        } else {
            remaining
        }
    }

    /// Record the per-sequence token count planned for this iteration.
    pub fn schedule_tokens(&mut self, num_tokens: usize) {
        self.num_scheduled_tokens = num_tokens;
    }

    /// Forget the planned tokens without committing them. Used when a step
    /// is abandoned after a model failure.
    pub fn clear_scheduled_tokens(&mut self) {
        self.num_scheduled_tokens = 0;
    }

    /// Commit `num_tokens` processed positions and close the iteration.
    pub fn advance_processed(&mut self, num_tokens: usize) {
        self.num_processed_tokens += num_tokens;
        self.num_scheduled_tokens = 0;
    }

    /// Rewind the committed-token count after a preemption or rollback.
    pub fn rewind_processed_to(&mut self, num_tokens: usize) {
        self.num_processed_tokens = self.num_processed_tokens.min(num_tokens);
    }

    /// Fork a child sequence from a running parent.
    ///
    /// The child copies the parent's generated tokens and score; its block
    /// table must be forked separately through the scheduler so the shared
    /// blocks are reference counted.
    pub fn fork_sequence(&mut self, parent_id: SequenceId) -> Result<SequenceId> {
        let parent = self
            .get_sequence(parent_id)
            .ok_or(Error::SequenceNotFound(parent_id))?;
        let mut child = parent.clone();
        child.seq_id = next_sequence_id();
        let child_id = child.seq_id;
        self.sequences.push(child);
        Ok(child_id)
    }
}
