//! The continuous-batching pipeline.
//!
//! A thin single-threaded driver around the [`Scheduler`] and an opaque
//! [`ModelRunner`]: requests enter through a coarse-locked admission queue,
//! every [`step`](ContinuousBatchingPipeline::step) runs one schedule +
//! forward + sample cycle, and tokens flow out through per-request
//! [`GenerationStream`]s. Admission and handle reads are the only entry
//! points safe to call from other threads; they never touch block tables
//! or the block store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::{GenerationConfig, SchedulerConfig, StopCriteria};
use crate::core::sequence::{
    GenerationFinishReason, RequestId, SequenceGroup, SequenceId, SequenceStatus,
};
use crate::engine::handle::{
    GenerationHandle, GenerationOutput, GenerationResult, GenerationStatus, GenerationStream,
};
use crate::engine::model_runner::{ForwardInput, ForwardOutput, ModelRunner};
use crate::engine::sampler::{argmax, log_softmax, Sampler};
use crate::error::{Error, Result};
use crate::scheduler::batch::{Scheduler, SchedulerOutput};

/// Committed token stream of one sequence, used by the speculative
/// decoding coordinator to move candidates between pipelines.
#[derive(Debug, Clone)]
pub struct GeneratedSequence {
    pub request_id: RequestId,
    pub sequence_id: SequenceId,
    pub token_ids: Vec<u32>,
    pub log_probs: Vec<f32>,
}

/// Outcome of [`ContinuousBatchingPipeline::update_generated_sequence`]:
/// how many tokens were grafted on and how many were rolled back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSequenceResult {
    pub to_insert: usize,
    pub to_remove: usize,
}

/// Coarse pipeline statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineMetrics {
    /// Requests currently known to the pipeline, queued included.
    pub requests: usize,
    /// Requests scheduled in the most recent step.
    pub scheduled_requests: usize,
    /// Fraction of the KV cache in use.
    pub cache_usage: f32,
}

#[derive(Default)]
struct AdmissionQueue {
    pending: Vec<(SequenceGroup, Arc<GenerationStream>)>,
    arrival_counter: u64,
}

/// Cloneable admission endpoint, safe to use from other threads while the
/// owning thread drives [`ContinuousBatchingPipeline::step`]. Requests
/// become visible at the next step boundary.
#[derive(Clone)]
pub struct RequestInjector {
    queue: Arc<Mutex<AdmissionQueue>>,
    block_size: usize,
}

impl RequestInjector {
    /// Queue a tokenized request. Validates the generation config before
    /// anything is admitted.
    pub fn add_request(
        &self,
        request_id: RequestId,
        prompt_tokens: Vec<u32>,
        params: GenerationConfig,
    ) -> Result<GenerationHandle> {
        params.validate()?;
        if prompt_tokens.is_empty() {
            return Err(Error::Config("prompt must not be empty".to_string()));
        }
        let mut group = SequenceGroup::new(request_id, prompt_tokens, params, self.block_size);
        let stream = GenerationStream::new();
        let mut queue = self.queue.lock().expect("admission queue lock");
        group.set_arrival(queue.arrival_counter);
        queue.arrival_counter += 1;
        queue.pending.push((group, Arc::clone(&stream)));
        Ok(GenerationHandle::new(request_id, stream))
    }
}

#[derive(Debug, Clone)]
struct BeamHypothesis {
    token_ids: Vec<u32>,
    log_probs: Vec<f32>,
    /// Length-penalized cumulative log-probability.
    score: f32,
}

#[derive(Debug, Default)]
struct BeamGroupState {
    beams: Vec<SequenceId>,
    finished: Vec<BeamHypothesis>,
    done: bool,
}

#[derive(Debug, Default)]
struct BeamState {
    groups: Vec<BeamGroupState>,
    final_outputs: Vec<GenerationOutput>,
    finalized: bool,
}

struct ChatState {
    request_id: Option<RequestId>,
    history: Vec<u32>,
}

/// Continuous-batching pipeline over one model.
pub struct ContinuousBatchingPipeline {
    scheduler: Scheduler,
    model: Box<dyn ModelRunner>,
    sampler: Sampler,
    requests: Vec<SequenceGroup>,
    streams: HashMap<RequestId, Arc<GenerationStream>>,
    /// Tokens already pushed to each sequence's stream.
    streamed: HashMap<SequenceId, usize>,
    beam_states: HashMap<RequestId, BeamState>,
    admission: Arc<Mutex<AdmissionQueue>>,
    /// Score-and-correct mode for speculative decoding: pre-inserted
    /// generated tokens are validated against the model's argmax instead
    /// of being re-streamed untouched.
    validation_mode: bool,
    chat: Option<ChatState>,
    next_request_id: RequestId,
    last_scheduled_requests: usize,
}

impl ContinuousBatchingPipeline {
    pub fn new(model: Box<dyn ModelRunner>, config: SchedulerConfig) -> Self {
        Self::with_options(model, config, None, false)
    }

    /// Full-control constructor: a sampling seed for reproducible runs and
    /// the validation mode used by the speculative-decoding coordinator.
    pub fn with_options(
        model: Box<dyn ModelRunner>,
        config: SchedulerConfig,
        seed: Option<u64>,
        validation_mode: bool,
    ) -> Self {
        let sampler = match seed {
            Some(seed) => Sampler::with_seed(seed),
            None => Sampler::new(),
        };
        Self {
            scheduler: Scheduler::new(config),
            model,
            sampler,
            requests: Vec::new(),
            streams: HashMap::new(),
            streamed: HashMap::new(),
            beam_states: HashMap::new(),
            admission: Arc::new(Mutex::new(AdmissionQueue::default())),
            validation_mode,
            chat: None,
            next_request_id: 0,
            last_scheduled_requests: 0,
        }
    }

    /// Thread-safe admission endpoint.
    pub fn injector(&self) -> RequestInjector {
        RequestInjector {
            queue: Arc::clone(&self.admission),
            block_size: self.scheduler.block_size(),
        }
    }

    /// Queue a tokenized request; it joins the batch at the next step.
    pub fn add_request(
        &self,
        request_id: RequestId,
        prompt_tokens: Vec<u32>,
        params: GenerationConfig,
    ) -> Result<GenerationHandle> {
        self.injector().add_request(request_id, prompt_tokens, params)
    }

    pub fn metrics(&self) -> PipelineMetrics {
        let queued = self.admission.lock().expect("admission queue lock").pending.len();
        PipelineMetrics {
            requests: self.requests.len() + queued,
            scheduled_requests: self.last_scheduled_requests,
            cache_usage: self.scheduler.cache_usage(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Anything left to do: queued, running, or unread-terminal requests.
    pub fn has_non_finished_requests(&self) -> bool {
        let queued = !self
            .admission
            .lock()
            .expect("admission queue lock")
            .pending
            .is_empty();
        queued
            || self
                .requests
                .iter()
                .any(|g| !g.has_finished() && !g.is_on_hold())
    }

    /// One schedule + forward + sample cycle.
    ///
    /// A model failure abandons the step: scheduled groups keep their
    /// blocks but their processed-token counts are unchanged, and the error
    /// propagates. Later steps may be attempted.
    pub fn step(&mut self) -> Result<()> {
        self.drain_admission_queue();
        self.observe_handle_drops();
        if self.requests.is_empty() {
            return Ok(());
        }

        let out = self.scheduler.schedule(&mut self.requests);
        self.last_scheduled_requests = out.scheduled_group_ids.len();
        if out.is_empty() {
            self.park_finished_chat_turn();
            self.reap_terminal_groups();
            return Ok(());
        }
        debug!(
            scheduled = out.scheduled_group_ids.len(),
            tokens = out.total_num_scheduled_tokens,
            is_prompt = out.is_prompt,
            "scheduled step"
        );

        let input = self.build_forward_input(&out);
        for &(src, dst) in &out.blocks_to_copy {
            if let Err(err) = self.model.copy_block(src, dst) {
                self.abandon_step(&out);
                return Err(err);
            }
        }
        let fwd = match self.model.forward(&input) {
            Ok(fwd) => fwd,
            Err(err) => {
                warn!(%err, "forward pass failed, abandoning step");
                self.abandon_step(&out);
                return Err(err);
            }
        };
        self.apply_forward_output(&out, &fwd)?;
        self.stream_step_outputs(&out);
        self.park_finished_chat_turn();
        self.reap_terminal_groups();
        Ok(())
    }

    /// Blocking convenience: admit every prompt, loop `step` until all of
    /// them are terminal, return the results in input order. The optional
    /// streamer receives tokens as they are produced when a single
    /// single-sequence request is in flight.
    pub fn generate(
        &mut self,
        prompts: &[Vec<u32>],
        params: &[GenerationConfig],
        mut streamer: Option<&mut dyn FnMut(u32)>,
    ) -> Result<Vec<GenerationResult>> {
        if prompts.len() != params.len() {
            return Err(Error::Config(
                "prompts and sampling params must have equal length".to_string(),
            ));
        }
        if self.chat.is_some() {
            let [prompt] = prompts else {
                return Err(Error::Config(
                    "chat mode generates one prompt per turn".to_string(),
                ));
            };
            let result = self.generate_chat_turn(prompt, &params[0], streamer)?;
            return Ok(vec![result]);
        }

        let mut handles = Vec::with_capacity(prompts.len());
        for (prompt, config) in prompts.iter().zip(params) {
            let request_id = self.alloc_request_id();
            handles.push(self.add_request(request_id, prompt.clone(), config.clone())?);
        }
        while self.has_non_finished_requests() {
            self.step()?;
            if let (Some(callback), [handle]) = (streamer.as_deref_mut(), handles.as_slice()) {
                while let Some(chunk) = handle.try_read() {
                    if chunk.len() == 1 {
                        for output in chunk.values() {
                            for &token in &output.generated_ids {
                                callback(token);
                            }
                        }
                    }
                }
            }
        }
        Ok(handles.iter().map(|h| h.result()).collect())
    }

    // ---------- chat mode ----------

    /// Begin a chat session: the history (system prompt and prior turns)
    /// is retained in a hidden, never-finishing group whose block table is
    /// reused between turns.
    pub fn start_chat(&mut self, history_tokens: Vec<u32>) {
        self.finish_chat();
        self.chat = Some(ChatState {
            request_id: None,
            history: history_tokens,
        });
    }

    /// End the chat session and release the retained KV.
    pub fn finish_chat(&mut self) {
        let Some(chat) = self.chat.take() else {
            return;
        };
        let Some(request_id) = chat.request_id else {
            return;
        };
        if let Some(pos) = self.position_of(request_id) {
            let group = self.requests.remove(pos);
            self.scheduler.free_group(&group);
            for seq in group.sequences() {
                self.streamed.remove(&seq.seq_id());
            }
        }
        self.streams.remove(&request_id);
        info!(request_id, "chat session finished, KV released");
    }

    fn generate_chat_turn(
        &mut self,
        prompt: &[u32],
        params: &GenerationConfig,
        mut streamer: Option<&mut dyn FnMut(u32)>,
    ) -> Result<GenerationResult> {
        params.validate()?;
        if params.is_beam_search() || params.num_return_sequences > 1 {
            return Err(Error::Config(
                "chat mode supports single-sequence decoding only".to_string(),
            ));
        }
        let stream = GenerationStream::new();
        let existing = self.chat.as_ref().and_then(|c| c.request_id);
        let request_id = match existing {
            Some(request_id) => {
                // Unpark the hidden group and append the new turn on top of
                // its retained context. A retried turn is already unparked.
                let pos = self
                    .position_of(request_id)
                    .ok_or(Error::RequestNotFound(request_id))?;
                let group = &mut self.requests[pos];
                if group.is_on_hold() {
                    group.extend_prompt(prompt);
                    group.set_sampling_params(params.clone());
                    group.set_on_hold(false);
                }
                request_id
            }
            None => {
                let request_id = self.alloc_request_id();
                let mut full = self.chat.as_ref().expect("chat state").history.clone();
                full.extend_from_slice(prompt);
                let mut group = SequenceGroup::new(
                    request_id,
                    full,
                    params.clone(),
                    self.scheduler.block_size(),
                );
                {
                    let mut queue = self.admission.lock().expect("admission queue lock");
                    group.set_arrival(queue.arrival_counter);
                    queue.arrival_counter += 1;
                }
                self.scheduler.restore_cached_blocks(&mut group);
                self.requests.push(group);
                self.chat.as_mut().expect("chat state").request_id = Some(request_id);
                request_id
            }
        };
        self.streams.insert(request_id, Arc::clone(&stream));

        while stream.status() == GenerationStatus::Running {
            self.step()?;
            if let Some(callback) = streamer.as_deref_mut() {
                while let Some(chunk) = stream.try_read() {
                    for output in chunk.values() {
                        for &token in &output.generated_ids {
                            callback(token);
                        }
                    }
                }
            }
        }
        let outputs = stream.read_all();
        Ok(GenerationResult {
            request_id,
            generation_ids: outputs.iter().map(|o| o.generated_ids.clone()).collect(),
            scores: outputs.iter().map(|o| o.score).collect(),
            status: stream.status(),
        })
    }

    /// At the end of a chat turn, deliver the result and park the hidden
    /// group: its tokens fold into the prompt and its KV stays resident.
    fn park_finished_chat_turn(&mut self) {
        let Some(request_id) = self.chat.as_ref().and_then(|c| c.request_id) else {
            return;
        };
        let Some(pos) = self.position_of(request_id) else {
            return;
        };
        if self.requests[pos].is_ignored() || !self.requests[pos].has_finished() {
            return;
        }
        let finals = Self::final_outputs_of(&self.requests[pos]);
        if let Some(stream) = self.streams.remove(&request_id) {
            stream.finish(GenerationStatus::Finished, finals);
        }
        let group = &mut self.requests[pos];
        for seq in group.sequences() {
            self.streamed.remove(&seq.seq_id());
        }
        group.absorb_generated_into_prompt();
        group.sequences_mut()[0].reset_to_waiting();
        group.set_on_hold(true);
        debug!(request_id, context = group.prompt_len(), "chat turn parked");
    }

    // ---------- speculative-decoding hooks ----------

    /// Committed token streams of every live sequence.
    pub fn get_generated_sequences(&self) -> Vec<GeneratedSequence> {
        let mut sequences = Vec::new();
        for group in &self.requests {
            for seq in group.sequences() {
                if seq.status() == SequenceStatus::Dropped {
                    continue;
                }
                sequences.push(GeneratedSequence {
                    request_id: group.request_id(),
                    sequence_id: seq.seq_id(),
                    token_ids: seq.get_generated_ids().to_vec(),
                    log_probs: seq.get_generated_log_probs().to_vec(),
                });
            }
        }
        sequences
    }

    /// Targeted rewind: make a sequence's committed tokens match the given
    /// authoritative list.
    ///
    /// The common prefix is kept; a diverging tail is rolled back through
    /// the partial-preemption path (trailing blocks released, processed
    /// count rewound) and the new tokens are grafted on for the next
    /// forward pass to commit.
    pub fn update_generated_sequence(
        &mut self,
        new_sequence: &GeneratedSequence,
    ) -> Result<UpdateSequenceResult> {
        let pos = self
            .position_of(new_sequence.request_id)
            .ok_or(Error::RequestNotFound(new_sequence.request_id))?;
        let group = &mut self.requests[pos];
        let prompt_len = group.prompt_len();
        let processed = group.num_processed_tokens();
        let seq = group
            .get_sequence_mut(new_sequence.sequence_id)
            .ok_or(Error::SequenceNotFound(new_sequence.sequence_id))?;

        let current = seq.get_generated_ids().to_vec();
        let common = current
            .iter()
            .zip(&new_sequence.token_ids)
            .take_while(|(a, b)| a == b)
            .count();
        let to_remove = current.len() - common;
        let to_insert = new_sequence.token_ids.len() - common;

        seq.truncate_generated(common);
        for (i, &token) in new_sequence.token_ids[common..].iter().enumerate() {
            let log_prob = new_sequence
                .log_probs
                .get(common + i)
                .copied()
                .unwrap_or(0.0);
            seq.append_token(token, log_prob);
        }
        let seq_id = seq.seq_id();

        if to_remove > 0 {
            group.rewind_processed_to(prompt_len + common);
            let target = group.num_processed_tokens();
            self.scheduler.trim_sequence(seq_id, target);
            debug!(
                request_id = new_sequence.request_id,
                rolled_back = to_remove,
                processed_before = processed,
                processed_after = target,
                "sequence rolled back"
            );
        }
        // The streamed-token counter must not run ahead of a rollback.
        if let Some(seen) = self.streamed.get_mut(&seq_id) {
            *seen = (*seen).min(common);
        }
        Ok(UpdateSequenceResult {
            to_insert,
            to_remove,
        })
    }

    /// Drop one request (or all of them) from the pipeline side.
    pub fn finish_request(&mut self, request_id: Option<RequestId>) {
        let ids: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|g| request_id.is_none() || request_id == Some(g.request_id()))
            .map(|g| g.request_id())
            .collect();
        for id in ids {
            if let Some(pos) = self.position_of(id) {
                let mut group = self.requests.remove(pos);
                self.scheduler.free_group(&group);
                group.drop_sequences();
                let finals = Self::final_outputs_of(&group);
                if let Some(stream) = self.streams.remove(&id) {
                    stream.finish(GenerationStatus::DroppedByPipeline, finals);
                }
                for seq in group.sequences() {
                    self.streamed.remove(&seq.seq_id());
                }
                self.beam_states.remove(&id);
                if self.chat.as_ref().and_then(|c| c.request_id) == Some(id) {
                    self.chat = None;
                }
            }
        }
    }

    // ---------- step internals ----------

    fn alloc_request_id(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn position_of(&self, request_id: RequestId) -> Option<usize> {
        self.requests.iter().position(|g| g.request_id() == request_id)
    }

    fn drain_admission_queue(&mut self) {
        let pending = {
            let mut queue = self.admission.lock().expect("admission queue lock");
            std::mem::take(&mut queue.pending)
        };
        for (mut group, stream) in pending {
            self.streams.insert(group.request_id(), stream);
            self.scheduler.restore_cached_blocks(&mut group);
            self.requests.push(group);
        }
    }

    /// Handle drops are observed at step boundaries only.
    fn observe_handle_drops(&mut self) {
        let dropped: Vec<RequestId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.status() == GenerationStatus::DroppedByHandle)
            .map(|(&id, _)| id)
            .collect();
        for id in dropped {
            if let Some(pos) = self.position_of(id) {
                let mut group = self.requests.remove(pos);
                self.scheduler.free_group(&group);
                group.drop_sequences();
                let finals = Self::final_outputs_of(&group);
                if let Some(stream) = self.streams.remove(&id) {
                    stream.finish(GenerationStatus::DroppedByHandle, finals);
                }
                for seq in group.sequences() {
                    self.streamed.remove(&seq.seq_id());
                }
                self.beam_states.remove(&id);
                if self.chat.as_ref().and_then(|c| c.request_id) == Some(id) {
                    self.chat = None;
                }
                debug!(request_id = id, "request dropped by handle");
            } else {
                self.streams.remove(&id);
            }
        }
    }

    fn build_forward_input(&self, out: &SchedulerOutput) -> ForwardInput {
        let block_size = self.scheduler.block_size();
        let mut input = ForwardInput {
            is_prompt: out.is_prompt,
            ..ForwardInput::default()
        };
        for &request_id in &out.scheduled_group_ids {
            let group = &self.requests[self.position_of(request_id).expect("scheduled group")];
            let k = out.num_scheduled_tokens[&request_id];
            let start = group.num_processed_tokens();
            for seq_id in group.running_seq_ids() {
                let tokens = group.all_token_ids(seq_id).expect("running sequence");
                let table = &out.block_tables[&seq_id];
                for pos in start..start + k {
                    debug_assert!(pos < tokens.len(), "scheduled past known tokens");
                    input.input_ids.push(tokens[pos]);
                    input.position_ids.push(pos);
                    input
                        .slot_mapping
                        .push(table[pos / block_size] * block_size + pos % block_size);
                }
                input.seq_lens.push(k);
                input.context_lens.push(start + k);
                input.block_tables.push(table.clone());
            }
        }
        input
    }

    /// Roll a failed step back: planned counts are forgotten, blocks stay,
    /// processed-token counts never advanced.
    fn abandon_step(&mut self, out: &SchedulerOutput) {
        for &request_id in &out.scheduled_group_ids {
            if let Some(pos) = self.position_of(request_id) {
                self.requests[pos].clear_scheduled_tokens();
            }
        }
    }

    fn apply_forward_output(&mut self, out: &SchedulerOutput, fwd: &ForwardOutput) -> Result<()> {
        let mut row_offset = 0usize;
        for &request_id in &out.scheduled_group_ids {
            let pos = self.position_of(request_id).expect("scheduled group");
            let k = out.num_scheduled_tokens[&request_id];
            let seq_ids = self.requests[pos].running_seq_ids();
            let num_seqs = seq_ids.len();
            let rows_for_group = num_seqs * k;

            if self.requests[pos].sampling_params().is_beam_search() {
                let group = &mut self.requests[pos];
                let start = group.num_processed_tokens();
                let at_sample_point =
                    start + k == group.context_len() && start + k >= group.prompt_len();
                if at_sample_point {
                    let rows: HashMap<SequenceId, Vec<f32>> = seq_ids
                        .iter()
                        .enumerate()
                        .map(|(si, &seq_id)| {
                            (seq_id, fwd.logits[row_offset + si * k + (k - 1)].clone())
                        })
                        .collect();
                    group.advance_processed(k);
                    let state = self.beam_states.entry(request_id).or_default();
                    Self::beam_search_step(
                        &mut self.scheduler,
                        &self.sampler,
                        state,
                        &mut self.requests[pos],
                        &rows,
                    )?;
                } else {
                    group.advance_processed(k);
                }
                row_offset += rows_for_group;
                continue;
            }

            let mut consumed = k;
            for (si, &seq_id) in seq_ids.iter().enumerate() {
                let rows = &fwd.logits[row_offset + si * k..row_offset + (si + 1) * k];
                let used = Self::process_sequence_rows(
                    &mut self.sampler,
                    &mut self.scheduler,
                    &mut self.requests[pos],
                    seq_id,
                    rows,
                    self.validation_mode,
                )?;
                consumed = consumed.min(used);
            }
            row_offset += rows_for_group;

            let group = &mut self.requests[pos];
            group.advance_processed(consumed);
            if consumed < k {
                let target = group.num_processed_tokens();
                for &seq_id in &seq_ids {
                    self.scheduler.trim_sequence(seq_id, target);
                }
            }
        }
        Ok(())
    }

    /// Walk one sequence's logits rows: skip prefill positions, re-stream
    /// (or validate) pre-existing tokens, and sample at the final position.
    /// Returns how many rows were actually consumed.
    fn process_sequence_rows(
        sampler: &mut Sampler,
        scheduler: &mut Scheduler,
        group: &mut SequenceGroup,
        seq_id: SequenceId,
        rows: &[Vec<f32>],
        validation_mode: bool,
    ) -> Result<usize> {
        let k = rows.len();
        let prompt_len = group.prompt_len();
        let start = group.num_processed_tokens();
        let params = group.sampling_params().clone();
        let max_new = params.get_max_new_tokens(prompt_len);
        let prompt = group.prompt_ids().to_vec();

        for r in 0..k {
            let pos = start + r;
            if pos + 1 < prompt_len {
                continue;
            }
            let seq = group.get_sequence(seq_id).ok_or(Error::SequenceNotFound(seq_id))?;
            if !seq.is_running() {
                return Ok(k);
            }
            let total = prompt_len + seq.num_generated();

            if pos + 1 < total {
                if !validation_mode {
                    continue;
                }
                // Score-and-correct: compare the model's choice with the
                // pre-inserted candidate at this position.
                let idx = pos + 1 - prompt_len;
                let candidate = seq.get_generated_ids()[idx];
                let predicted = argmax(&rows[r]);
                if predicted != candidate {
                    let log_probs = log_softmax(&rows[r]);
                    let seq = group.get_sequence_mut(seq_id).expect("sequence");
                    seq.truncate_generated(idx);
                    seq.append_token(predicted, log_probs[predicted as usize]);
                    Self::apply_finish_rules(group, seq_id, &params, max_new);
                    return Ok(r + 1);
                }
                if let Some(reason) = Self::stop_reason(&params, candidate, idx + 1, max_new) {
                    let seq = group.get_sequence_mut(seq_id).expect("sequence");
                    seq.truncate_generated(idx + 1);
                    seq.set_finished(reason);
                    return Ok(r + 1);
                }
                continue;
            }

            // Sample point: the row of the last known token.
            debug_assert_eq!(r, k - 1, "sample point must be the final row");
            let fork_fanout = params.num_return_sequences;
            if fork_fanout > 1 && seq.num_generated() == 0 && group.num_running_seqs() == 1 {
                // Multinomial with several return sequences: fork before the
                // streams diverge at the first sampled token.
                let mut targets = vec![seq_id];
                for _ in 1..fork_fanout {
                    let child = group.fork_sequence(seq_id)?;
                    scheduler.fork_sequence(seq_id, child);
                    targets.push(child);
                }
                for target in targets {
                    let generated = group
                        .get_sequence(target)
                        .expect("forked sequence")
                        .get_generated_ids()
                        .to_vec();
                    let (token, log_prob) = sampler.sample(&rows[r], &params, &prompt, &generated);
                    group
                        .get_sequence_mut(target)
                        .expect("forked sequence")
                        .append_token(token, log_prob);
                    Self::apply_finish_rules(group, target, &params, max_new);
                }
            } else {
                let generated = seq.get_generated_ids().to_vec();
                let (token, log_prob) = sampler.sample(&rows[r], &params, &prompt, &generated);
                let seq = group.get_sequence_mut(seq_id).expect("sequence");
                seq.append_token(token, log_prob);
                Self::apply_finish_rules(group, seq_id, &params, max_new);
            }
        }
        Ok(k)
    }

    fn stop_reason(
        params: &GenerationConfig,
        token: u32,
        generated_len: usize,
        max_new: usize,
    ) -> Option<GenerationFinishReason> {
        if !params.ignore_eos && params.eos_token_id == Some(token) {
            return Some(GenerationFinishReason::Stop);
        }
        if generated_len >= max_new {
            return Some(GenerationFinishReason::Length);
        }
        None
    }

    fn apply_finish_rules(
        group: &mut SequenceGroup,
        seq_id: SequenceId,
        params: &GenerationConfig,
        max_new: usize,
    ) {
        let seq = match group.get_sequence(seq_id) {
            Some(seq) => seq,
            None => return,
        };
        let Some(&last) = seq.get_generated_ids().last() else {
            return;
        };
        if let Some(reason) = Self::stop_reason(params, last, seq.num_generated(), max_new) {
            if let Some(seq) = group.get_sequence_mut(seq_id) {
                seq.set_finished(reason);
            }
        }
    }

    // ---------- beam search ----------

    fn beam_search_step(
        scheduler: &mut Scheduler,
        sampler: &Sampler,
        state: &mut BeamState,
        group: &mut SequenceGroup,
        rows: &HashMap<SequenceId, Vec<f32>>,
    ) -> Result<()> {
        let params = group.sampling_params().clone();
        let group_size = params.num_beams / params.num_beam_groups;
        let prompt = group.prompt_ids().to_vec();
        let max_new = params.get_max_new_tokens(prompt.len());

        if state.groups.is_empty() {
            let seed = group.running_seq_ids()[0];
            state.groups = (0..params.num_beam_groups)
                .map(|_| BeamGroupState {
                    beams: vec![seed],
                    finished: Vec::new(),
                    done: false,
                })
                .collect();
        }

        let old_beams: Vec<SequenceId> = state
            .groups
            .iter()
            .flat_map(|g| g.beams.iter().copied())
            .collect();
        // Tokens picked by earlier diversity groups within this step.
        let mut step_tokens: Vec<u32> = Vec::new();
        // (group_idx, parent, token, log_prob), in selection order.
        let mut planned: Vec<(usize, SequenceId, u32, f32)> = Vec::new();

        for gi in 0..state.groups.len() {
            if state.groups[gi].done {
                state.groups[gi].beams.clear();
                continue;
            }
            let hyp_len = state.groups[gi]
                .beams
                .first()
                .and_then(|&b| group.get_sequence(b))
                .map(|s| s.num_generated() + 1)
                .unwrap_or(1);
            let mut candidates: Vec<(SequenceId, u32, f32, f32)> = Vec::new();
            for &beam in &state.groups[gi].beams {
                let Some(row) = rows.get(&beam) else { continue };
                let seq = group
                    .get_sequence(beam)
                    .ok_or(Error::SequenceNotFound(beam))?;
                let mut log_probs =
                    sampler.penalized_log_probs(row, &params, &prompt, seq.get_generated_ids());
                for &token in &step_tokens {
                    if let Some(lp) = log_probs.get_mut(token as usize) {
                        *lp -= params.diversity_penalty;
                    }
                }
                let mut order: Vec<usize> = (0..log_probs.len()).collect();
                order.sort_by(|&a, &b| {
                    log_probs[b]
                        .partial_cmp(&log_probs[a])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                for &token in order.iter().take(2 * group_size) {
                    candidates.push((
                        beam,
                        token as u32,
                        log_probs[token],
                        seq.cumulative_log_prob() + log_probs[token],
                    ));
                }
            }
            candidates.sort_by(|a, b| b.3.partial_cmp(&a.3).unwrap_or(std::cmp::Ordering::Equal));

            let mut chosen = 0usize;
            let mut best_running_cum = f32::NEG_INFINITY;
            for (parent, token, log_prob, cum) in candidates {
                if chosen == group_size {
                    break;
                }
                if !params.ignore_eos && params.eos_token_id == Some(token) {
                    let seq = group.get_sequence(parent).expect("beam sequence");
                    let mut token_ids = seq.get_generated_ids().to_vec();
                    token_ids.push(token);
                    let mut log_probs = seq.get_generated_log_probs().to_vec();
                    log_probs.push(log_prob);
                    let score = cum / (hyp_len as f32).powf(params.length_penalty);
                    state.groups[gi].finished.push(BeamHypothesis {
                        token_ids,
                        log_probs,
                        score,
                    });
                    continue;
                }
                planned.push((gi, parent, token, log_prob));
                step_tokens.push(token);
                best_running_cum = best_running_cum.max(cum);
                chosen += 1;
            }

            let bg = &mut state.groups[gi];
            if chosen == 0 {
                bg.done = true;
                continue;
            }
            if bg.finished.len() >= group_size {
                let worst_finished = bg
                    .finished
                    .iter()
                    .map(|h| h.score)
                    .fold(f32::INFINITY, f32::min);
                let best_running =
                    best_running_cum / (hyp_len as f32).powf(params.length_penalty);
                match params.stop_criteria {
                    StopCriteria::Early => bg.done = true,
                    StopCriteria::Heuristic => {
                        if best_running < worst_finished {
                            bg.done = true;
                        }
                    }
                    StopCriteria::Never => {}
                }
            }
        }

        // Apply continuations: fork before appending so children copy the
        // parent's state from before this step's token.
        let mut by_parent: Vec<(SequenceId, Vec<(usize, u32, f32)>)> = Vec::new();
        for (gi, parent, token, log_prob) in planned {
            match by_parent.iter_mut().find(|(p, _)| *p == parent) {
                Some((_, list)) => list.push((gi, token, log_prob)),
                None => by_parent.push((parent, vec![(gi, token, log_prob)])),
            }
        }
        let mut new_beams: Vec<Vec<SequenceId>> = vec![Vec::new(); state.groups.len()];
        let mut continued: Vec<SequenceId> = Vec::new();
        for (parent, list) in by_parent {
            let mut targets = vec![parent];
            for _ in 1..list.len() {
                let child = group.fork_sequence(parent)?;
                scheduler.fork_sequence(parent, child);
                targets.push(child);
            }
            for ((gi, token, log_prob), target) in list.into_iter().zip(targets) {
                group
                    .get_sequence_mut(target)
                    .expect("beam target")
                    .append_token(token, log_prob);
                new_beams[gi].push(target);
                continued.push(target);
            }
        }
        for beam in old_beams {
            if !continued.contains(&beam) {
                if let Some(seq) = group.get_sequence_mut(beam) {
                    if seq.is_running() {
                        seq.set_dropped();
                    }
                }
                scheduler.free_sequence(beam);
            }
        }
        for (gi, beams) in new_beams.into_iter().enumerate() {
            if state.groups[gi].done {
                // The group stopped right as these continuations were
                // planned; they are not part of any result.
                for beam in beams {
                    if let Some(seq) = group.get_sequence_mut(beam) {
                        if seq.is_running() {
                            seq.set_dropped();
                        }
                    }
                    scheduler.free_sequence(beam);
                }
            } else {
                state.groups[gi].beams = beams;
            }
        }

        let reached_limit = group
            .running_sequences()
            .next()
            .map(|s| s.num_generated() >= max_new)
            .unwrap_or(false);
        let all_done = state.groups.iter().all(|g| g.done);
        if reached_limit || all_done || group.num_running_seqs() == 0 {
            Self::finalize_beam_search(scheduler, state, group, &params);
        }
        Ok(())
    }

    /// Close out a beam-search group: surviving beams become hypotheses,
    /// every sequence terminates, the best hypotheses become the result.
    fn finalize_beam_search(
        scheduler: &mut Scheduler,
        state: &mut BeamState,
        group: &mut SequenceGroup,
        params: &GenerationConfig,
    ) {
        if state.finalized {
            return;
        }
        for bg in &mut state.groups {
            for &beam in &bg.beams.clone() {
                let Some(seq) = group.get_sequence(beam) else {
                    continue;
                };
                if !seq.is_running() {
                    continue;
                }
                let len = seq.num_generated().max(1);
                bg.finished.push(BeamHypothesis {
                    token_ids: seq.get_generated_ids().to_vec(),
                    log_probs: seq.get_generated_log_probs().to_vec(),
                    score: seq.cumulative_log_prob() / (len as f32).powf(params.length_penalty),
                });
            }
            bg.beams.clear();
            bg.done = true;
        }
        for seq in group.sequences_mut() {
            if seq.is_running() {
                seq.set_finished(GenerationFinishReason::Length);
            }
        }
        for seq in group.sequences() {
            scheduler.free_sequence(seq.seq_id());
        }

        let mut hypotheses: Vec<BeamHypothesis> = state
            .groups
            .iter()
            .flat_map(|g| g.finished.iter().cloned())
            .collect();
        hypotheses.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hypotheses.truncate(params.num_return_sequences);
        state.final_outputs = hypotheses
            .into_iter()
            .map(|h| GenerationOutput {
                generated_ids: h.token_ids,
                generated_log_probs: h.log_probs,
                score: h.score,
                finish_reason: GenerationFinishReason::Stop,
            })
            .collect();
        state.finalized = true;
    }

    // ---------- output streaming ----------

    fn stream_step_outputs(&mut self, out: &SchedulerOutput) {
        for &request_id in &out.scheduled_group_ids {
            let Some(pos) = self.position_of(request_id) else {
                continue;
            };
            let group = &self.requests[pos];
            if group.sampling_params().is_beam_search() {
                // Beam groups deliver once, at finalization.
                continue;
            }
            let mut chunk = HashMap::new();
            for seq in group.sequences() {
                if seq.status() == SequenceStatus::Dropped {
                    continue;
                }
                let seen = self.streamed.entry(seq.seq_id()).or_insert(0);
                let generated = seq.get_generated_ids();
                if generated.len() > *seen {
                    chunk.insert(
                        seq.seq_id(),
                        GenerationOutput {
                            generated_ids: generated[*seen..].to_vec(),
                            generated_log_probs: seq.get_generated_log_probs()[*seen..].to_vec(),
                            score: seq.cumulative_log_prob(),
                            finish_reason: seq.finish_reason(),
                        },
                    );
                    *seen = generated.len();
                }
            }
            if let Some(stream) = self.streams.get(&request_id) {
                stream.push(chunk);
            }
        }
    }

    fn final_outputs_of(group: &SequenceGroup) -> Vec<GenerationOutput> {
        group
            .sequences()
            .iter()
            .map(|seq| GenerationOutput {
                generated_ids: seq.get_generated_ids().to_vec(),
                generated_log_probs: seq.get_generated_log_probs().to_vec(),
                score: seq.cumulative_log_prob(),
                finish_reason: seq.finish_reason(),
            })
            .collect()
    }

    /// Deliver results and release resources of every terminal group.
    fn reap_terminal_groups(&mut self) {
        let mut index = 0;
        while index < self.requests.len() {
            if !self.requests[index].has_finished() {
                index += 1;
                continue;
            }
            let group = self.requests.remove(index);
            let request_id = group.request_id();
            let status = if group.is_ignored() {
                GenerationStatus::Ignored
            } else {
                GenerationStatus::Finished
            };
            let finals = match self.beam_states.remove(&request_id) {
                Some(state) if state.finalized => state.final_outputs,
                _ => Self::final_outputs_of(&group),
            };
            self.scheduler.free_group(&group);
            for seq in group.sequences() {
                self.streamed.remove(&seq.seq_id());
            }
            if let Some(stream) = self.streams.remove(&request_id) {
                stream.finish(status, finals);
            }
            if self.chat.as_ref().and_then(|c| c.request_id) == Some(request_id) {
                self.chat = None;
            }
            debug!(request_id, ?status, "request completed");
        }
    }
}
