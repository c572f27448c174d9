//! Generation handles and their output streams.
//!
//! Every admitted request gets a [`GenerationStream`]: a single-producer,
//! single-consumer FIFO of per-step output chunks plus a terminal marker.
//! The pipeline pushes from the step loop; the [`GenerationHandle`] reads
//! from any thread. Dropping the request through the handle is an
//! out-of-band signal the scheduler observes at the next step boundary.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::core::sequence::{GenerationFinishReason, RequestId, SequenceId};
use crate::error::{Error, Result};

/// Terminal and non-terminal states of a generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    /// Still producing tokens.
    Running,
    /// All sequences reached a stop condition.
    Finished,
    /// The prompt can never fit the KV cache.
    Ignored,
    /// Dropped by the pipeline (`finish_request`).
    DroppedByPipeline,
    /// Cancelled through the handle.
    DroppedByHandle,
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Tokens produced for one sequence, either incrementally per step or as
/// the request's final cumulative output.
#[derive(Debug, Clone, Default)]
pub struct GenerationOutput {
    pub generated_ids: Vec<u32>,
    pub generated_log_probs: Vec<f32>,
    /// Cumulative log-probability of the sequence so far.
    pub score: f32,
    pub finish_reason: GenerationFinishReason,
}

/// Final per-request result returned by the blocking entry points.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub request_id: RequestId,
    /// One token stream per returned sequence.
    pub generation_ids: Vec<Vec<u32>>,
    /// Cumulative log-probability score per returned sequence.
    pub scores: Vec<f32>,
    pub status: GenerationStatus,
}

#[derive(Debug, Default)]
struct StreamState {
    chunks: VecDeque<HashMap<SequenceId, GenerationOutput>>,
    final_outputs: Vec<GenerationOutput>,
    status: Option<GenerationStatus>,
}

impl StreamState {
    fn status(&self) -> GenerationStatus {
        self.status.unwrap_or(GenerationStatus::Running)
    }
}

/// Producer/consumer channel between the step loop and one handle.
#[derive(Debug, Default)]
pub struct GenerationStream {
    state: Mutex<StreamState>,
    cond: Condvar,
}

impl GenerationStream {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push(&self, chunk: HashMap<SequenceId, GenerationOutput>) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.state.lock().expect("stream lock");
        state.chunks.push_back(chunk);
        self.cond.notify_all();
    }

    /// Mark the stream terminal with the request's cumulative outputs.
    /// A stream already dropped through the handle keeps that status.
    pub(crate) fn finish(&self, status: GenerationStatus, final_outputs: Vec<GenerationOutput>) {
        let mut state = self.state.lock().expect("stream lock");
        if state.status.is_none() {
            state.status = Some(status);
        }
        state.final_outputs = final_outputs;
        self.cond.notify_all();
    }

    pub(crate) fn drop_by_handle(&self) {
        let mut state = self.state.lock().expect("stream lock");
        if state.status.is_none() {
            state.status = Some(GenerationStatus::DroppedByHandle);
        }
        self.cond.notify_all();
    }

    pub fn status(&self) -> GenerationStatus {
        self.state.lock().expect("stream lock").status()
    }

    pub fn can_read(&self) -> bool {
        !self.state.lock().expect("stream lock").chunks.is_empty()
    }

    /// Blocking pull of the next chunk. Returns an empty map once the
    /// stream is terminal and drained.
    pub fn read(&self) -> HashMap<SequenceId, GenerationOutput> {
        let mut state = self.state.lock().expect("stream lock");
        loop {
            if let Some(chunk) = state.chunks.pop_front() {
                return chunk;
            }
            if state.status().is_terminal() {
                return HashMap::new();
            }
            state = self.cond.wait(state).expect("stream lock");
        }
    }

    /// Non-blocking pull of the next chunk.
    pub fn try_read(&self) -> Option<HashMap<SequenceId, GenerationOutput>> {
        self.state.lock().expect("stream lock").chunks.pop_front()
    }

    /// Block until terminal and return the cumulative outputs.
    pub fn read_all(&self) -> Vec<GenerationOutput> {
        let mut state = self.state.lock().expect("stream lock");
        while !state.status().is_terminal() {
            state = self.cond.wait(state).expect("stream lock");
        }
        state.final_outputs.clone()
    }
}

/// Caller-side view of one request.
///
/// Dropping the handle without reading it to completion cancels the
/// request; the scheduler frees its blocks at the next step boundary.
#[derive(Debug)]
pub struct GenerationHandle {
    request_id: RequestId,
    stream: Arc<GenerationStream>,
}

impl GenerationHandle {
    pub(crate) fn new(request_id: RequestId, stream: Arc<GenerationStream>) -> Self {
        Self { request_id, stream }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn status(&self) -> GenerationStatus {
        self.stream.status()
    }

    pub fn is_dropped(&self) -> bool {
        self.stream.status() == GenerationStatus::DroppedByHandle
    }

    /// Whether an unread chunk is available.
    pub fn can_read(&self) -> bool {
        self.stream.can_read()
    }

    /// Blocking incremental pull of per-step tokens.
    pub fn read(&self) -> Result<HashMap<SequenceId, GenerationOutput>> {
        if self.is_dropped() {
            return Err(Error::HandleDropped);
        }
        Ok(self.stream.read())
    }

    /// Non-blocking pull of per-step tokens.
    pub fn try_read(&self) -> Option<HashMap<SequenceId, GenerationOutput>> {
        self.stream.try_read()
    }

    /// Block until the request reaches a terminal state and return its
    /// cumulative outputs. Partial results of dropped or ignored requests
    /// are delivered the same way.
    pub fn read_all(&self) -> Vec<GenerationOutput> {
        self.stream.read_all()
    }

    /// Alias for [`read_all`](Self::read_all): wait for the final outputs.
    pub fn back(&self) -> Vec<GenerationOutput> {
        self.stream.read_all()
    }

    /// Cancel the request. Observed by the scheduler at the next step
    /// boundary; already-terminal requests are unaffected.
    pub fn abort(&self) {
        self.stream.drop_by_handle();
    }

    /// Assemble the final [`GenerationResult`] once terminal.
    pub fn result(&self) -> GenerationResult {
        let outputs = self.read_all();
        GenerationResult {
            request_id: self.request_id,
            generation_ids: outputs.iter().map(|o| o.generated_ids.clone()).collect(),
            scores: outputs.iter().map(|o| o.score).collect(),
            status: self.stream.status(),
        }
    }
}

impl Drop for GenerationHandle {
    /// An abandoned handle cancels its request; a terminal one is left as
    /// it finished.
    fn drop(&mut self) {
        self.stream.drop_by_handle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_returns_empty_after_terminal() {
        let stream = GenerationStream::new();
        let mut chunk = HashMap::new();
        chunk.insert(0, GenerationOutput::default());
        stream.push(chunk);
        stream.finish(GenerationStatus::Finished, Vec::new());

        assert_eq!(stream.read().len(), 1);
        assert!(stream.read().is_empty());
        assert_eq!(stream.status(), GenerationStatus::Finished);
    }

    #[test]
    fn handle_drop_is_sticky() {
        let stream = GenerationStream::new();
        let handle = GenerationHandle::new(7, Arc::clone(&stream));
        handle.abort();
        assert!(handle.is_dropped());
        // A later pipeline finish does not overwrite the drop.
        stream.finish(GenerationStatus::Finished, Vec::new());
        assert_eq!(handle.status(), GenerationStatus::DroppedByHandle);
        assert!(handle.read().is_err());
    }
}
