//! Speculative decoding configuration.

use serde::{Deserialize, Serialize};

/// Configuration for speculative decoding.
///
/// A small draft model proposes `num_speculative_tokens` continuations per
/// round; the main model scores all of them in a single forward pass and
/// keeps the agreeing prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculativeConfig {
    /// Number of tokens the draft proposes per round (K). Higher values
    /// help when the draft agrees often and waste compute when it does not.
    pub num_speculative_tokens: usize,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            num_speculative_tokens: 4,
        }
    }
}

impl SpeculativeConfig {
    pub fn new(num_speculative_tokens: usize) -> Self {
        Self {
            num_speculative_tokens,
        }
    }
}
