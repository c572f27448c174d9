//! Token sampling.
//!
//! Greedy and multinomial selection over a logits row, with the standard
//! logit transformations: temperature, top-k, top-p, repetition, presence
//! and frequency penalties, n-gram repetition bans and the minimum-length
//! EOS ban. Beam-search candidate scoring reuses the same penalized
//! log-probabilities through [`Sampler::penalized_log_probs`].

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::GenerationConfig;

/// Index of the largest value in a logits row.
pub(crate) fn argmax(row: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best as u32
}

/// Numerically stable log-softmax.
pub(crate) fn log_softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum: f32 = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
    row.iter().map(|&v| v - max - log_sum).collect()
}

/// Token sampler with a seedable random source.
#[derive(Debug)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Seeded sampler for reproducible multinomial runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Apply the configured penalties to a logits row.
    fn penalized_logits(
        &self,
        row: &[f32],
        params: &GenerationConfig,
        prompt: &[u32],
        generated: &[u32],
    ) -> Vec<f32> {
        let mut logits = row.to_vec();

        if params.repetition_penalty != 1.0 {
            for &token in prompt.iter().chain(generated.iter()) {
                if let Some(logit) = logits.get_mut(token as usize) {
                    if *logit > 0.0 {
                        *logit /= params.repetition_penalty;
                    } else {
                        *logit *= params.repetition_penalty;
                    }
                }
            }
        }

        if params.presence_penalty != 0.0 || params.frequency_penalty != 0.0 {
            let mut counts = std::collections::HashMap::new();
            for &token in generated {
                *counts.entry(token).or_insert(0usize) += 1;
            }
            for (&token, &count) in &counts {
                if let Some(logit) = logits.get_mut(token as usize) {
                    *logit -= params.presence_penalty + params.frequency_penalty * count as f32;
                }
            }
        }

        if params.no_repeat_ngram_size != usize::MAX && params.no_repeat_ngram_size > 0 {
            for token in banned_ngram_tokens(prompt, generated, params.no_repeat_ngram_size) {
                if let Some(logit) = logits.get_mut(token as usize) {
                    *logit = f32::NEG_INFINITY;
                }
            }
        }

        if generated.len() < params.min_new_tokens {
            if let Some(eos) = params.eos_token_id {
                if let Some(logit) = logits.get_mut(eos as usize) {
                    *logit = f32::NEG_INFINITY;
                }
            }
        }

        logits
    }

    /// Penalized log-probabilities of a row: the beam-search scoring input.
    pub fn penalized_log_probs(
        &self,
        row: &[f32],
        params: &GenerationConfig,
        prompt: &[u32],
        generated: &[u32],
    ) -> Vec<f32> {
        log_softmax(&self.penalized_logits(row, params, prompt, generated))
    }

    /// Select the next token for a sequence and return it with its
    /// log-probability.
    pub fn sample(
        &mut self,
        row: &[f32],
        params: &GenerationConfig,
        prompt: &[u32],
        generated: &[u32],
    ) -> (u32, f32) {
        let logits = self.penalized_logits(row, params, prompt, generated);

        if !params.do_sample || params.temperature == 0.0 {
            let token = argmax(&logits);
            let log_probs = log_softmax(&logits);
            return (token, log_probs[token as usize]);
        }

        let scaled: Vec<f32> = logits.iter().map(|&v| v / params.temperature).collect();
        let log_probs = log_softmax(&scaled);

        // Top-k: keep the k most likely candidates.
        let mut candidates: Vec<(usize, f32)> = log_probs.iter().copied().enumerate().collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        if params.top_k > 0 && params.top_k < candidates.len() {
            candidates.truncate(params.top_k);
        }

        // Top-p: cut the sorted tail once the cumulative mass exceeds p.
        if params.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            let mut cutoff = candidates.len();
            for (i, (_, lp)) in candidates.iter().enumerate() {
                cumulative += lp.exp();
                if cumulative > params.top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            candidates.truncate(cutoff);
        }

        let weights: Vec<f64> = candidates.iter().map(|(_, lp)| lp.exp() as f64).collect();
        let token = match WeightedIndex::new(&weights) {
            Ok(dist) => candidates[dist.sample(&mut self.rng)].0 as u32,
            // Degenerate distribution (all mass filtered out): fall back to
            // the most likely candidate.
            Err(_) => candidates[0].0 as u32,
        };
        (token, log_probs[token as usize])
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Tokens that would complete an already-seen n-gram.
fn banned_ngram_tokens(prompt: &[u32], generated: &[u32], n: usize) -> Vec<u32> {
    let mut tokens: Vec<u32> = Vec::with_capacity(prompt.len() + generated.len());
    tokens.extend_from_slice(prompt);
    tokens.extend_from_slice(generated);
    if n == 0 || tokens.len() < n {
        return Vec::new();
    }
    let tail: &[u32] = &tokens[tokens.len() - (n - 1)..];
    let mut banned = Vec::new();
    for window in tokens.windows(n) {
        if &window[..n - 1] == tail {
            banned.push(window[n - 1]);
        }
    }
    banned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn greedy_params() -> GenerationConfig {
        config::greedy()
    }

    #[test]
    fn greedy_takes_argmax() {
        let mut sampler = Sampler::with_seed(0);
        let row = vec![0.1, 2.0, 0.5, -1.0];
        let (token, _) = sampler.sample(&row, &greedy_params(), &[], &[]);
        assert_eq!(token, 1);
    }

    #[test]
    fn min_new_tokens_bans_eos() {
        let mut sampler = Sampler::with_seed(0);
        let params = GenerationConfig {
            eos_token_id: Some(1),
            min_new_tokens: 2,
            max_new_tokens: Some(8),
            ..GenerationConfig::default()
        };
        let row = vec![0.1, 5.0, 0.5, -1.0];
        let (token, _) = sampler.sample(&row, &params, &[7], &[]);
        assert_ne!(token, 1);

        // Past the floor, EOS wins again.
        let (token, _) = sampler.sample(&row, &params, &[7], &[3, 2]);
        assert_eq!(token, 1);
    }

    #[test]
    fn repetition_penalty_discourages_seen_tokens() {
        let mut sampler = Sampler::with_seed(0);
        let params = GenerationConfig {
            repetition_penalty: 10.0,
            max_new_tokens: Some(8),
            ..GenerationConfig::default()
        };
        let row = vec![1.0, 1.1, 0.9];
        // Token 1 leads, but it already occurred.
        let (token, _) = sampler.sample(&row, &params, &[], &[1]);
        assert_eq!(token, 0);
    }

    #[test]
    fn no_repeat_ngram_bans_completion() {
        let mut sampler = Sampler::with_seed(0);
        let params = GenerationConfig {
            no_repeat_ngram_size: 2,
            max_new_tokens: Some(8),
            ..GenerationConfig::default()
        };
        // History contains the bigram (3, 1); after a trailing 3 the
        // continuation 1 is banned even though its logit leads.
        let row = vec![0.0, 5.0, 1.0, 0.0];
        let (token, _) = sampler.sample(&row, &params, &[3, 1], &[2, 3]);
        assert_ne!(token, 1);
        assert_eq!(token, 2);
    }

    #[test]
    fn seeded_multinomial_is_reproducible() {
        let params = GenerationConfig {
            do_sample: true,
            temperature: 1.0,
            max_new_tokens: Some(8),
            ..GenerationConfig::default()
        };
        let row = vec![1.0, 2.0, 3.0, 0.5];
        let mut a = Sampler::with_seed(42);
        let mut b = Sampler::with_seed(42);
        for _ in 0..16 {
            assert_eq!(
                a.sample(&row, &params, &[], &[]).0,
                b.sample(&row, &params, &[], &[]).0
            );
        }
    }
}
