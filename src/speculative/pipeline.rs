//! Speculative decoding over two continuous-batching pipelines.
//!
//! The draft pipeline runs a cheap model autoregressively for K steps; the
//! main pipeline, in validation mode, scores all K candidates plus one
//! extra position in a single forward pass. Agreeing candidates are
//! accepted wholesale, the first disagreement is replaced by the main
//! model's own choice, and a full agreement earns the bonus token from the
//! extra position. The draft's KV cache is then rolled back onto the main
//! model's committed stream through the partial-preemption path.

use tracing::{debug, info};

use crate::config::{GenerationConfig, SchedulerConfig};
use crate::core::sequence::RequestId;
use crate::engine::handle::{GenerationResult, GenerationStatus};
use crate::engine::model_runner::ModelRunner;
use crate::engine::pipeline::{ContinuousBatchingPipeline, GeneratedSequence};
use crate::error::{Error, Result};
use crate::speculative::config::SpeculativeConfig;

/// Drives a draft and a main pipeline over the same scheduler machinery.
pub struct SpeculativeDecodingPipeline {
    main: ContinuousBatchingPipeline,
    draft: ContinuousBatchingPipeline,
    num_speculative_tokens: usize,
    /// Accepted tokens per validation round, bucket `k+1` meaning all K
    /// candidates plus the bonus token.
    hit_histogram: Vec<usize>,
    next_request_id: RequestId,
}

impl SpeculativeDecodingPipeline {
    /// Build the coordinator. Both pipelines get their own scheduler and
    /// block pool from the same configuration; the main pipeline runs in
    /// validation mode.
    pub fn new(
        main_model: Box<dyn ModelRunner>,
        draft_model: Box<dyn ModelRunner>,
        scheduler_config: SchedulerConfig,
        config: SpeculativeConfig,
    ) -> Self {
        let main =
            ContinuousBatchingPipeline::with_options(main_model, scheduler_config.clone(), None, true);
        let draft =
            ContinuousBatchingPipeline::with_options(draft_model, scheduler_config, None, false);
        let num_speculative_tokens = config.num_speculative_tokens.max(1);
        Self {
            main,
            draft,
            num_speculative_tokens,
            hit_histogram: vec![0; num_speculative_tokens + 2],
            next_request_id: 0,
        }
    }

    /// Accepted-tokens-per-round histogram over `{0, 1, .., K+1}`.
    pub fn hit_histogram(&self) -> &[usize] {
        &self.hit_histogram
    }

    pub fn main_pipeline(&self) -> &ContinuousBatchingPipeline {
        &self.main
    }

    pub fn draft_pipeline(&self) -> &ContinuousBatchingPipeline {
        &self.draft
    }

    /// Generate one sequence to completion with speculative decoding.
    ///
    /// Validation compares argmax choices, so only greedy decoding is
    /// supported; the emitted tokens match what the main pipeline would
    /// produce on its own.
    pub fn generate(
        &mut self,
        prompt: &[u32],
        params: &GenerationConfig,
    ) -> Result<GenerationResult> {
        params.validate()?;
        if !params.is_greedy_decoding() {
            return Err(Error::Config(
                "speculative decoding requires greedy sampling".to_string(),
            ));
        }
        let k = self.num_speculative_tokens;
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let main_handle = self
            .main
            .add_request(request_id, prompt.to_vec(), params.clone())?;
        // The draft ignores stop conditions; the main pipeline is the only
        // authority on when generation ends.
        let draft_params = GenerationConfig {
            ignore_eos: true,
            max_new_tokens: Some(
                params
                    .get_max_new_tokens(prompt.len())
                    .saturating_add(k + 1),
            ),
            ..params.clone()
        };
        // Held for the whole run: dropping a handle cancels its request.
        let _draft_handle = self
            .draft
            .add_request(request_id, prompt.to_vec(), draft_params)?;

        // Prompt pass on both models; each samples its own first token.
        self.main.step()?;
        self.draft.step()?;
        let draft_seq_id = self
            .draft_sequence(request_id)?
            .ok_or(Error::RequestNotFound(request_id))?
            .sequence_id;
        self.sync_draft_to_main(request_id, draft_seq_id)?;

        let mut draft_alive = true;
        while main_handle.status() == GenerationStatus::Running {
            let committed = self
                .main_sequence(request_id)?
                .ok_or(Error::RequestNotFound(request_id))?;
            let committed_len = committed.token_ids.len();

            let candidates = if draft_alive {
                for _ in 0..k {
                    self.draft.step()?;
                }
                match self.draft_sequence(request_id)? {
                    Some(draft_seq) => {
                        let mut tokens = draft_seq.token_ids;
                        let mut log_probs = draft_seq.log_probs;
                        tokens.truncate(committed_len + k);
                        log_probs.truncate(committed_len + k);
                        (tokens, log_probs)
                    }
                    None => {
                        draft_alive = false;
                        (committed.token_ids.clone(), committed.log_probs.clone())
                    }
                }
            } else {
                (committed.token_ids.clone(), committed.log_probs.clone())
            };

            if candidates.0.len() <= committed_len {
                // No proposals this round: the main model decodes alone.
                self.main.step()?;
                continue;
            }

            self.main.update_generated_sequence(&GeneratedSequence {
                request_id,
                sequence_id: committed.sequence_id,
                token_ids: candidates.0,
                log_probs: candidates.1,
            })?;
            // One forward pass scores every candidate plus one extra
            // position for the correction or bonus token.
            self.main.step()?;

            let accepted_len = match self.main_sequence(request_id)? {
                Some(seq) => seq.token_ids.len(),
                None => main_handle
                    .read_all()
                    .first()
                    .map(|o| o.generated_ids.len())
                    .unwrap_or(committed_len),
            };
            let accepted = accepted_len.saturating_sub(committed_len);
            let bucket = accepted.min(k + 1);
            self.hit_histogram[bucket] += 1;
            debug!(request_id, accepted, "validation round");

            if main_handle.status() != GenerationStatus::Running {
                break;
            }
            if draft_alive {
                self.sync_draft_to_main(request_id, draft_seq_id)?;
            }
        }

        self.draft.finish_request(Some(request_id));
        let result = main_handle.result();
        info!(
            request_id,
            generated = result.generation_ids.first().map(|g| g.len()).unwrap_or(0),
            histogram = ?self.hit_histogram,
            "speculative generation finished"
        );
        Ok(result)
    }

    /// Roll the draft's committed stream back onto the main's, rewinding
    /// its KV cache through the partial-preemption path.
    fn sync_draft_to_main(&mut self, request_id: RequestId, draft_seq_id: u64) -> Result<()> {
        let Some(main_seq) = self.main_sequence(request_id)? else {
            return Ok(());
        };
        let update = self.draft.update_generated_sequence(&GeneratedSequence {
            request_id,
            sequence_id: draft_seq_id,
            token_ids: main_seq.token_ids,
            log_probs: main_seq.log_probs,
        })?;
        debug!(
            request_id,
            to_insert = update.to_insert,
            to_remove = update.to_remove,
            "draft rolled back onto main"
        );
        Ok(())
    }

    fn main_sequence(&self, request_id: RequestId) -> Result<Option<GeneratedSequence>> {
        Ok(self
            .main
            .get_generated_sequences()
            .into_iter()
            .find(|s| s.request_id == request_id))
    }

    fn draft_sequence(&self, request_id: RequestId) -> Result<Option<GeneratedSequence>> {
        Ok(self
            .draft
            .get_generated_sequences()
            .into_iter()
            .find(|s| s.request_id == request_id))
    }
}
