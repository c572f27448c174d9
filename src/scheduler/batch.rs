//! Continuous-batching scheduler.
//!
//! Every call to [`Scheduler::schedule`] decides, for one model-forward
//! step, which sequence groups make progress and how many token positions
//! of each are computed, while keeping the block pool fully accounted for.
//!
//! Two batching policies are supported:
//!
//! - **Whole-prompt** (`dynamic_split_fuse = false`): a step is either a
//!   prompt step, admitting as many complete waiting prompts as fit the
//!   budgets, or a generation step advancing every running sequence by one
//!   token. The two are never mixed.
//! - **Dynamic split-fuse** (`dynamic_split_fuse = true`): every step is a
//!   free mixture; waiting prompts are chunked into whatever share of the
//!   token budget the generation tokens leave over.
//!
//! Both policies share the block accounting and the preemption path: when
//! the pool runs short, the latest-arrived running group loses trailing
//! blocks (or everything) until the planned step fits.
//!
//! The `requests` slice passed to [`Scheduler::schedule`] is ordered by
//! priority; the pipeline keeps it in FIFO arrival order.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::core::block::{compute_num_blocks, BlockId};
use crate::core::block_table::{BlockCopy, BlockTableManager};
use crate::core::sequence::{RequestId, SequenceGroup, SequenceId};

/// Work selected for one forward step.
#[derive(Debug, Default)]
pub struct SchedulerOutput {
    /// Request ids of the scheduled groups, in scheduling order.
    pub scheduled_group_ids: Vec<RequestId>,
    /// Per-sequence physical block tables of the scheduled groups.
    pub block_tables: HashMap<SequenceId, Vec<BlockId>>,
    /// Tokens scheduled per sequence, keyed by request id.
    pub num_scheduled_tokens: HashMap<RequestId, usize>,
    /// Sum of scheduled tokens across all sequences.
    pub total_num_scheduled_tokens: usize,
    /// Whole-prompt policy only: whether this is a prompt step.
    pub is_prompt: bool,
    /// Copy-on-write directives the model runner must apply before reading.
    pub blocks_to_copy: Vec<BlockCopy>,
    /// Groups preempted while building this step.
    pub preempted_group_ids: Vec<RequestId>,
}

impl SchedulerOutput {
    pub fn is_empty(&self) -> bool {
        self.scheduled_group_ids.is_empty()
    }
}

/// Chooses per-step work and owns the KV block pool.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    manager: BlockTableManager,
    can_use_partial_preemption: bool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_partial_preemption(config, true)
    }

    /// `can_use_partial_preemption = false` forces every preemption to
    /// release the victim's blocks entirely.
    pub fn with_partial_preemption(config: SchedulerConfig, can_use_partial_preemption: bool) -> Self {
        let manager = BlockTableManager::new(
            config.num_kv_blocks,
            config.block_size,
            config.enable_prefix_caching,
        );
        Self {
            config,
            manager,
            can_use_partial_preemption,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn num_free_blocks(&self) -> usize {
        self.manager.num_free_blocks()
    }

    pub fn num_total_blocks(&self) -> usize {
        self.manager.num_total_blocks()
    }

    pub fn cache_usage(&self) -> f32 {
        self.manager.cache_usage()
    }

    pub fn has_block_table(&self, seq_id: SequenceId) -> bool {
        self.manager.has_block_table(seq_id)
    }

    pub fn get_block_table(&self, seq_id: SequenceId) -> Option<Vec<BlockId>> {
        self.manager.block_ids(seq_id)
    }

    pub fn block_ref_count(&self, block_id: BlockId) -> usize {
        self.manager.ref_count(block_id)
    }

    /// Release a finished or dropped sequence's blocks.
    pub fn free_sequence(&mut self, seq_id: SequenceId) {
        self.manager.free_sequence(seq_id);
    }

    /// Release every block a group's sequences still hold.
    pub fn free_group(&mut self, group: &SequenceGroup) {
        for seq in group.sequences() {
            self.manager.free_sequence(seq.seq_id());
        }
    }

    /// Register a forked child's block table (copy-on-write sharing).
    pub fn fork_sequence(&mut self, parent_id: SequenceId, child_id: SequenceId) {
        if let Err(err) = self.manager.fork_sequence(parent_id, child_id) {
            warn!(parent_id, child_id, %err, "fork of unknown sequence");
        }
    }

    /// Attach prefix-cached blocks to a newly admitted group.
    pub fn restore_cached_blocks(&mut self, group: &mut SequenceGroup) {
        self.manager.restore_cached_blocks(group);
    }

    /// Rewind a sequence's block table to cover `target_tokens` positions.
    /// Trailing blocks are released; the speculative-decoding rollback path.
    pub fn trim_sequence(&mut self, seq_id: SequenceId, target_tokens: usize) {
        self.manager.trim_sequence(seq_id, target_tokens);
    }

    /// Select and commit the next step's work.
    pub fn schedule(&mut self, requests: &mut [SequenceGroup]) -> SchedulerOutput {
        let mut out = SchedulerOutput::default();
        if self.config.dynamic_split_fuse {
            self.schedule_split_fuse(requests, &mut out);
        } else {
            self.schedule_whole_prompt(requests, &mut out);
        }
        out
    }

    fn running_seq_count(&self, requests: &[SequenceGroup]) -> usize {
        requests.iter().map(|g| g.num_running_seqs()).sum()
    }

    /// Whole-prompt policy: a prompt step if any waiting group fits,
    /// otherwise a generation step.
    fn schedule_whole_prompt(&mut self, requests: &mut [SequenceGroup], out: &mut SchedulerOutput) {
        let mut running_seqs = self.running_seq_count(requests);

        for i in 0..requests.len() {
            let group = &requests[i];
            if !group.is_waiting() || group.has_finished() || group.is_on_hold() {
                continue;
            }
            let k = group.num_tokens_to_schedule();
            if k == 0 {
                continue;
            }
            let num_seqs = group.schedulable_seq_ids().len();
            if out.total_num_scheduled_tokens + k * num_seqs > self.config.max_num_batched_tokens {
                // Whole prompts only: a prompt that exceeds the entire step
                // budget can never be scheduled under this policy.
                if k * num_seqs > self.config.max_num_batched_tokens {
                    warn!(
                        request_id = group.request_id(),
                        prompt_tokens = k * num_seqs,
                        max_num_batched_tokens = self.config.max_num_batched_tokens,
                        "prompt exceeds the step token budget, ignoring request"
                    );
                    self.free_group(&requests[i]);
                    requests[i].set_ignored();
                    continue;
                }
                break;
            }
            // Reserve seats for the sequences this group will fork into.
            let peak_seqs = Self::peak_seqs(group, num_seqs);
            if running_seqs + peak_seqs > self.config.max_num_seqs {
                break;
            }
            if self.ignore_if_oversized(&mut requests[i]) {
                continue;
            }
            let needed = self.manager.blocks_needed_for_group(&requests[i], k);
            if needed > self.manager.num_free_blocks() {
                break;
            }
            if self.commit_group(&mut requests[i], k, out).is_err() {
                break;
            }
            running_seqs += peak_seqs;
        }
        if !out.is_empty() {
            out.is_prompt = true;
            return;
        }

        // Generation step: one token per running sequence, plus whatever
        // suffix a partial preemption left to re-stream.
        for i in 0..requests.len() {
            let group = &requests[i];
            if !group.is_running()
                || group.has_finished()
                || out.preempted_group_ids.contains(&group.request_id())
            {
                continue;
            }
            let k = group.num_tokens_to_schedule();
            let num_seqs = group.num_running_seqs();
            if out.total_num_scheduled_tokens + k * num_seqs > self.config.max_num_batched_tokens {
                break;
            }
            if !self.ensure_blocks(requests, i, k, out) {
                self.ignore_if_unschedulable(&mut requests[i], k);
                continue;
            }
            if self.commit_group(&mut requests[i], k, out).is_err() {
                break;
            }
        }
    }

    /// Split-fuse policy: running groups first, then waiting prompts chunked
    /// into the remaining token budget.
    fn schedule_split_fuse(&mut self, requests: &mut [SequenceGroup], out: &mut SchedulerOutput) {
        for i in 0..requests.len() {
            let group = &requests[i];
            if !group.is_running()
                || group.has_finished()
                || out.preempted_group_ids.contains(&group.request_id())
            {
                continue;
            }
            let budget = self
                .config
                .max_num_batched_tokens
                .saturating_sub(out.total_num_scheduled_tokens);
            if budget == 0 {
                break;
            }
            let num_seqs = group.num_running_seqs();
            let mut k = group.num_tokens_to_schedule();
            if k * num_seqs > budget {
                if num_seqs > 1 {
                    break;
                }
                k = budget;
            }
            if !self.ensure_blocks(requests, i, k, out) {
                self.ignore_if_unschedulable(&mut requests[i], k);
                continue;
            }
            if self.commit_group(&mut requests[i], k, out).is_err() {
                break;
            }
        }

        let mut running_seqs = self.running_seq_count(requests);
        for i in 0..requests.len() {
            let group = &requests[i];
            if !group.is_waiting() || group.has_finished() || group.is_on_hold() {
                continue;
            }
            let budget = self
                .config
                .max_num_batched_tokens
                .saturating_sub(out.total_num_scheduled_tokens);
            if budget == 0 {
                break;
            }
            let num_seqs = group.schedulable_seq_ids().len();
            let mut k = group.num_tokens_to_schedule();
            if k == 0 {
                continue;
            }
            if k * num_seqs > budget {
                // Chunk into the leftover budget, evenly across sequences.
                let per_seq = budget / num_seqs;
                if per_seq == 0 {
                    break;
                }
                k = per_seq;
            }
            let peak_seqs = Self::peak_seqs(group, num_seqs);
            if running_seqs + peak_seqs > self.config.max_num_seqs {
                break;
            }
            if self.ignore_if_oversized(&mut requests[i]) {
                continue;
            }
            // Admission never preempts: shrink the chunk to the free blocks.
            let needed = self.manager.blocks_needed_for_group(&requests[i], k);
            if needed > self.manager.num_free_blocks() {
                if num_seqs > 1 {
                    break;
                }
                k = self.max_chunk_for_free_blocks(&requests[i]);
                if k == 0 {
                    break;
                }
            }
            if self.commit_group(&mut requests[i], k, out).is_err() {
                break;
            }
            running_seqs += peak_seqs;
        }
    }

    /// Sequences a group will occupy once admitted: beams and multinomial
    /// return sequences fork after the prompt.
    fn peak_seqs(group: &SequenceGroup, current: usize) -> usize {
        let params = group.sampling_params();
        current
            .max(params.num_beams)
            .max(params.num_return_sequences)
    }

    /// Largest prompt chunk of a single-sequence group that fits the free
    /// blocks, counting slots already assigned to its table.
    fn max_chunk_for_free_blocks(&self, group: &SequenceGroup) -> usize {
        let seq_ids = group.schedulable_seq_ids();
        let assigned = seq_ids
            .first()
            .and_then(|&s| self.manager.block_table(s))
            .map(|t| t.num_tokens())
            .unwrap_or(0);
        let capacity = assigned.max(group.num_processed_tokens())
            + self.manager.num_free_blocks() * self.config.block_size;
        let max_fit = capacity.saturating_sub(group.num_processed_tokens());
        max_fit.min(group.num_tokens_to_schedule())
    }

    /// A running group that still cannot fit after every other candidate
    /// was preempted is stuck; when its own footprint plus the next step
    /// exceeds the whole pool it can never proceed and is dropped.
    fn ignore_if_unschedulable(&mut self, group: &mut SequenceGroup, k: usize) {
        let needed = self.manager.blocks_needed_for_group(group, k);
        let held: HashSet<BlockId> = group
            .running_seq_ids()
            .iter()
            .filter_map(|&seq_id| self.manager.block_ids(seq_id))
            .flatten()
            .collect();
        if held.len() + needed > self.manager.num_total_blocks() {
            warn!(
                request_id = group.request_id(),
                "context exceeds the whole KV cache, ignoring request"
            );
            self.free_group(group);
            group.set_ignored();
        }
    }

    /// Waiting groups whose full context cannot fit the whole cache are
    /// terminal before they ever run.
    fn ignore_if_oversized(&mut self, group: &mut SequenceGroup) -> bool {
        let num_seqs = group.schedulable_seq_ids().len().max(1);
        let demand = compute_num_blocks(group.context_len(), self.config.block_size) * num_seqs;
        if demand <= self.manager.num_total_blocks() {
            return false;
        }
        warn!(
            request_id = group.request_id(),
            demand,
            num_kv_blocks = self.manager.num_total_blocks(),
            "request exceeds the whole KV cache, ignoring"
        );
        self.free_group(group);
        group.set_ignored();
        true
    }

    /// Make room for the current group's `k`-token advance, preempting
    /// later-arrived running groups one at a time. Returns `false` when the
    /// shortfall cannot be covered; the current group then sits out the step.
    fn ensure_blocks(
        &mut self,
        requests: &mut [SequenceGroup],
        current: usize,
        k: usize,
        out: &mut SchedulerOutput,
    ) -> bool {
        loop {
            let needed = self.manager.blocks_needed_for_group(&requests[current], k);
            if needed <= self.manager.num_free_blocks() {
                return true;
            }
            let scheduled: HashSet<RequestId> = out.scheduled_group_ids.iter().copied().collect();
            let victim = requests
                .iter()
                .enumerate()
                .rev()
                .find(|(idx, g)| {
                    *idx != current && g.is_running() && !scheduled.contains(&g.request_id())
                })
                .map(|(idx, _)| idx);
            match victim {
                Some(idx) => self.preempt_group(&mut requests[idx], needed, out),
                None => {
                    debug!(
                        request_id = requests[current].request_id(),
                        "no preemption victim left, dropping group from this step"
                    );
                    return false;
                }
            }
        }
    }

    /// Release blocks from a victim until `needed` are free or the victim
    /// has nothing left.
    ///
    /// Partial preemption trims one trailing block from every running
    /// sequence per round (beams stay even) and rewinds the processed-token
    /// count to the first position of the released blocks. Under the
    /// whole-prompt policy a rewind landing inside the prompt escalates to
    /// full preemption, as does exhausting the partial path.
    fn preempt_group(
        &mut self,
        group: &mut SequenceGroup,
        needed: usize,
        out: &mut SchedulerOutput,
    ) {
        if !out.preempted_group_ids.contains(&group.request_id()) {
            out.preempted_group_ids.push(group.request_id());
        }
        while self.manager.num_free_blocks() < needed {
            let seq_ids = group.running_seq_ids();
            if seq_ids.is_empty() {
                return;
            }
            if !self.can_use_partial_preemption {
                self.full_preempt(group);
                return;
            }
            let min_blocks = seq_ids
                .iter()
                .filter_map(|&s| self.manager.block_table(s).map(|t| t.num_blocks()))
                .min()
                .unwrap_or(0);
            if min_blocks <= 1 {
                self.full_preempt(group);
                return;
            }
            let new_processed = (min_blocks - 1) * self.config.block_size;
            if !self.config.dynamic_split_fuse && new_processed < group.prompt_len() {
                self.full_preempt(group);
                return;
            }
            for &seq_id in &seq_ids {
                self.manager.trim_sequence(seq_id, new_processed);
            }
            group.rewind_processed_to(new_processed);
            debug!(
                request_id = group.request_id(),
                new_processed, "partial preemption"
            );
        }
    }

    fn full_preempt(&mut self, group: &mut SequenceGroup) {
        for seq_id in group.running_seq_ids() {
            self.manager.free_sequence(seq_id);
        }
        for seq in group.sequences_mut() {
            if seq.is_running() {
                let _ = seq.set_waiting();
            }
        }
        group.rewind_processed_to(0);
        debug!(request_id = group.request_id(), "full preemption");
    }

    /// Commit a group into the step: mark it running, assign slots, record
    /// its tables and token counts in the output.
    fn commit_group(
        &mut self,
        group: &mut SequenceGroup,
        k: usize,
        out: &mut SchedulerOutput,
    ) -> crate::error::Result<()> {
        for seq in group.sequences_mut() {
            if seq.status() == crate::core::sequence::SequenceStatus::Waiting {
                seq.set_running()?;
            }
        }
        group.schedule_tokens(k);
        let copies = self.manager.append_slots(group)?;
        out.blocks_to_copy.extend(copies);
        for seq_id in group.schedulable_seq_ids() {
            if let Some(ids) = self.manager.block_ids(seq_id) {
                out.block_tables.insert(seq_id, ids);
            }
        }
        out.scheduled_group_ids.push(group.request_id());
        out.num_scheduled_tokens.insert(group.request_id(), k);
        out.total_num_scheduled_tokens += k * group.num_running_seqs();
        Ok(())
    }
}
