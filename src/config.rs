//! Configuration types for nano-batch.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Token budget per scheduling step.
    pub max_num_batched_tokens: usize,
    /// Total number of blocks in the KV cache pool.
    pub num_kv_blocks: usize,
    /// Tokens per block.
    pub block_size: usize,
    /// `false` schedules whole prompts exclusively per step; `true` mixes
    /// prompt chunks and generation tokens freely within the budget.
    pub dynamic_split_fuse: bool,
    /// Upper bound on concurrently running sequences.
    pub max_num_seqs: usize,
    /// Enable content-addressed block reuse across sequences.
    pub enable_prefix_caching: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: 256,
            num_kv_blocks: 1024,
            block_size: 16,
            dynamic_split_fuse: true,
            max_num_seqs: 256,
            enable_prefix_caching: false,
        }
    }
}

/// Beam-search stopping condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StopCriteria {
    /// Never stop as long as beams can improve.
    Never,
    /// Stop as soon as `num_return_sequences` beams have finished.
    Early,
    /// Stop when the best running beam cannot beat the worst finished one.
    #[default]
    Heuristic,
}

/// Accepts the HuggingFace `early_stopping` encoding: `"never"`, `true`
/// (early) or `false` (heuristic).
fn deserialize_stop_criteria<'de, D>(deserializer: D) -> std::result::Result<StopCriteria, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Flag(bool),
        Name(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Flag(true) => Ok(StopCriteria::Early),
        Raw::Flag(false) => Ok(StopCriteria::Heuristic),
        Raw::Name(s) if s == "never" => Ok(StopCriteria::Never),
        Raw::Name(s) => Err(serde::de::Error::custom(format!(
            "unknown early_stopping value: {s}"
        ))),
    }
}

/// Per-request generation parameters.
///
/// Mirrors the HuggingFace generation options that affect scheduling and
/// sampling. `num_beams > 1` selects beam search, `do_sample` selects
/// multinomial sampling, otherwise decoding is greedy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate, prompt excluded.
    pub max_new_tokens: Option<usize>,
    /// Maximum total length (prompt plus generated). `max_new_tokens` has
    /// priority when both are set.
    pub max_length: Option<usize>,
    /// Minimum number of tokens to generate before EOS is allowed.
    pub min_new_tokens: usize,
    /// Keep generating after EOS (requires an explicit length limit).
    pub ignore_eos: bool,
    /// End-of-sequence token id.
    pub eos_token_id: Option<u32>,

    // Beam search
    /// Number of beams; `> 1` activates beam search.
    pub num_beams: usize,
    /// Number of diversity groups the beams are split into.
    pub num_beam_groups: usize,
    /// Subtracted from the log-probability of tokens already chosen by
    /// earlier beam groups in the same step.
    pub diversity_penalty: f32,
    /// Exponential length penalty applied to finished beam scores.
    pub length_penalty: f32,
    /// Beam-search stopping condition.
    #[serde(
        rename = "early_stopping",
        deserialize_with = "deserialize_stop_criteria"
    )]
    pub stop_criteria: StopCriteria,
    /// Number of sequences returned per request.
    pub num_return_sequences: usize,
    /// Ban n-grams of this size from repeating. `usize::MAX` disables.
    pub no_repeat_ngram_size: usize,

    // Multinomial sampling
    /// `true` samples from the distribution instead of taking the argmax.
    pub do_sample: bool,
    /// Temperature for logit scaling.
    pub temperature: f32,
    /// Nucleus sampling threshold in `(0, 1]`.
    pub top_p: f32,
    /// Keep only the `top_k` most likely tokens when sampling.
    pub top_k: usize,
    /// Multiplicative penalty on logits of tokens already present.
    pub repetition_penalty: f32,
    /// Additive penalty on tokens that appeared at least once, in `[-2, 2]`.
    pub presence_penalty: f32,
    /// Additive penalty scaled by occurrence count, in `[-2, 2]`.
    pub frequency_penalty: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: None,
            max_length: None,
            min_new_tokens: 0,
            ignore_eos: false,
            eos_token_id: None,
            num_beams: 1,
            num_beam_groups: 1,
            diversity_penalty: 1.0,
            length_penalty: 1.0,
            stop_criteria: StopCriteria::Heuristic,
            num_return_sequences: 1,
            no_repeat_ngram_size: usize::MAX,
            do_sample: false,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 50,
            repetition_penalty: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

impl GenerationConfig {
    /// Load a generation config from a HuggingFace-style JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }

    /// Effective cap on generated tokens for a prompt of the given length.
    ///
    /// `max_new_tokens` has priority over `max_length`; with neither set the
    /// cap is `usize::MAX` and an EOS token must terminate generation.
    pub fn get_max_new_tokens(&self, prompt_len: usize) -> usize {
        match (self.max_new_tokens, self.max_length) {
            (Some(n), _) => n,
            (None, Some(l)) => l.saturating_sub(prompt_len),
            (None, None) => usize::MAX,
        }
    }

    /// Greedy decoding: neither sampling nor beam search.
    pub fn is_greedy_decoding(&self) -> bool {
        !self.do_sample && !self.is_beam_search()
    }

    /// Beam search is selected by `num_beams > 1`.
    pub fn is_beam_search(&self) -> bool {
        self.num_beams > 1
    }

    /// Multinomial sampling is selected by `do_sample`.
    pub fn is_multinomial(&self) -> bool {
        self.do_sample
    }

    /// Check internal consistency of the options.
    pub fn validate(&self) -> Result<()> {
        if self.do_sample && self.num_beams > 1 {
            return Err(Error::Config(
                "beam search and multinomial sampling are mutually exclusive; \
                 set do_sample=false or num_beams=1"
                    .to_string(),
            ));
        }
        if self.num_return_sequences == 0 {
            return Err(Error::Config(
                "num_return_sequences must be greater than 0".to_string(),
            ));
        }
        if self.max_new_tokens == Some(0) {
            return Err(Error::Config(
                "max_new_tokens must be greater than 0".to_string(),
            ));
        }
        if self.num_beams == 0 || self.num_beam_groups == 0 {
            return Err(Error::Config(
                "num_beams and num_beam_groups must be greater than 0".to_string(),
            ));
        }
        if self.num_beams % self.num_beam_groups != 0 {
            return Err(Error::Config(
                "num_beams must be divisible by num_beam_groups".to_string(),
            ));
        }
        if self.max_new_tokens.is_none() && self.max_length == Some(0) {
            return Err(Error::Config(
                "max_length must be greater than 0 when max_new_tokens is unset".to_string(),
            ));
        }
        if self.min_new_tokens > self.get_max_new_tokens(0) {
            return Err(Error::Config(
                "min_new_tokens must not exceed max_new_tokens".to_string(),
            ));
        }
        if self.do_sample {
            if self.top_k == 0 {
                return Err(Error::Config("top_k must be strictly positive".to_string()));
            }
            if !(self.top_p > 0.0 && self.top_p <= 1.0) {
                return Err(Error::Config(format!(
                    "top_p must be in (0, 1], but got {}",
                    self.top_p
                )));
            }
            if self.temperature <= 0.0 {
                return Err(Error::Config(format!(
                    "temperature must be strictly positive for sampling, but got {}",
                    self.temperature
                )));
            }
        }
        if self.repetition_penalty <= 0.0 {
            return Err(Error::Config(format!(
                "repetition_penalty must be strictly positive, but got {}",
                self.repetition_penalty
            )));
        }
        if self.ignore_eos && self.max_new_tokens.is_none() && self.max_length.is_none() {
            return Err(Error::Config(
                "ignore_eos requires max_new_tokens or max_length to be set".to_string(),
            ));
        }
        if self.eos_token_id.is_none()
            && self.max_new_tokens.is_none()
            && self.max_length.is_none()
        {
            return Err(Error::Config(
                "one of eos_token_id, max_new_tokens or max_length must be set".to_string(),
            ));
        }
        if self.is_beam_search() {
            if self.no_repeat_ngram_size == 0 {
                return Err(Error::Config(
                    "no_repeat_ngram_size must be positive".to_string(),
                ));
            }
        } else {
            if !(-2.0..=2.0).contains(&self.frequency_penalty) {
                return Err(Error::Config(format!(
                    "frequency_penalty must be in [-2, 2], but got {}",
                    self.frequency_penalty
                )));
            }
            if !(-2.0..=2.0).contains(&self.presence_penalty) {
                return Err(Error::Config(format!(
                    "presence_penalty must be in [-2, 2], but got {}",
                    self.presence_penalty
                )));
            }
        }
        Ok(())
    }
}

/// Greedy decoding preset.
pub fn greedy() -> GenerationConfig {
    GenerationConfig {
        temperature: 0.0,
        ignore_eos: true,
        num_return_sequences: 1,
        max_new_tokens: Some(30),
        ..GenerationConfig::default()
    }
}

/// Beam-search preset: four beams in two diversity groups.
pub fn beam_search() -> GenerationConfig {
    GenerationConfig {
        num_beams: 4,
        num_return_sequences: 3,
        num_beam_groups: 2,
        diversity_penalty: 2.0,
        max_new_tokens: Some(100),
        ..GenerationConfig::default()
    }
}

/// Multinomial sampling preset.
pub fn multinomial() -> GenerationConfig {
    GenerationConfig {
        do_sample: true,
        temperature: 0.9,
        top_p: 0.9,
        top_k: 20,
        num_return_sequences: 3,
        presence_penalty: 0.01,
        frequency_penalty: 0.1,
        min_new_tokens: 15,
        max_new_tokens: Some(30),
        ..GenerationConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        // eos unset, but max limits also unset: default alone is rejected.
        let config = GenerationConfig::default();
        assert!(config.validate().is_err());

        let config = GenerationConfig {
            max_new_tokens: Some(16),
            ..GenerationConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn presets_are_valid() {
        assert!(greedy().validate().is_ok());
        assert!(beam_search().validate().is_ok());
        assert!(multinomial().validate().is_ok());
    }

    #[test]
    fn beam_and_sampling_exclusive() {
        let config = GenerationConfig {
            do_sample: true,
            num_beams: 4,
            max_new_tokens: Some(8),
            ..GenerationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn beams_divisible_by_groups() {
        let config = GenerationConfig {
            num_beams: 4,
            num_beam_groups: 3,
            max_new_tokens: Some(8),
            ..GenerationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_new_tokens_has_priority_over_max_length() {
        let config = GenerationConfig {
            max_new_tokens: Some(10),
            max_length: Some(100),
            ..GenerationConfig::default()
        };
        assert_eq!(config.get_max_new_tokens(50), 10);

        let config = GenerationConfig {
            max_length: Some(100),
            ..GenerationConfig::default()
        };
        assert_eq!(config.get_max_new_tokens(30), 70);
    }

    #[test]
    fn early_stopping_accepts_bool_and_never() {
        let config: GenerationConfig =
            serde_json::from_str(r#"{"early_stopping": true, "max_new_tokens": 4}"#).unwrap();
        assert_eq!(config.stop_criteria, StopCriteria::Early);

        let config: GenerationConfig =
            serde_json::from_str(r#"{"early_stopping": false, "max_new_tokens": 4}"#).unwrap();
        assert_eq!(config.stop_criteria, StopCriteria::Heuristic);

        let config: GenerationConfig =
            serde_json::from_str(r#"{"early_stopping": "never", "max_new_tokens": 4}"#).unwrap();
        assert_eq!(config.stop_criteria, StopCriteria::Never);
    }
}
