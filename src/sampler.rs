//! Logit post-processing for the autoregressive language model.
//!
//! Stages run in a fixed order — repetition penalty, temperature, top-k,
//! top-p, softmax, sample — and that order is not an implementation detail:
//! top-k and top-p are applied to filter the *raw* (penalty- and
//! temperature-adjusted) logit distribution, and softmax is computed last,
//! purely to turn the surviving candidates into a probability distribution
//! to draw from. Reordering softmax earlier would change which tokens
//! top-k/top-p admit.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Parameters controlling one sampling call.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    /// Divides (or multiplies, for negative logits) the logit of any token
    /// already present in history. `1.0` disables the penalty.
    pub repetition_penalty: f32,
    /// Divides every logit before filtering. Must be greater than zero.
    pub temperature: f32,
    /// Keep only the `top_k` highest-logit candidates. `0` disables top-k.
    pub top_k: usize,
    /// Keep the smallest prefix of candidates (ranked by softmax mass)
    /// whose cumulative probability reaches `top_p`. `1.0` disables top-p.
    pub top_p: f32,
    /// Whether the start-of-speech token counts as history for the
    /// repetition penalty.
    pub penalize_start_token: bool,
}

/// Samples a next token from a raw logit vector, reusing scratch buffers
/// across calls so steady-state decoding allocates nothing.
pub struct Sampler {
    rng: StdRng,
    probs: Vec<f32>,
}

impl Sampler {
    /// Construct a sampler seeded from a fixed value, for reproducible
    /// generation. Seed `0` is a valid, ordinary seed — not a sentinel for
    /// "use entropy".
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            probs: Vec::new(),
        }
    }

    /// Construct a sampler seeded from the OS entropy source.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            probs: Vec::new(),
        }
    }

    /// Run the full post-processing pipeline and draw a token index.
    ///
    /// `logits` is mutated in place by the repetition-penalty and
    /// temperature stages. `history` is the sequence of previously emitted
    /// token IDs (including the start-of-speech token, subject to
    /// `params.penalize_start_token`).
    pub fn sample(&mut self, logits: &mut [f32], history: &[i64], params: &SamplingParams) -> i64 {
        apply_repetition_penalty(logits, history, params);
        apply_temperature(logits, params.temperature);

        let vocab_size = logits.len();
        let mut keep: Vec<bool> = vec![true; vocab_size];
        apply_top_k(logits, &mut keep, params.top_k);
        apply_top_p(logits, &mut keep, params.top_p);

        self.softmax_masked(logits, &keep);
        self.sample_from_probs(vocab_size)
    }

    /// Numerically stable softmax over `logits`, writing into the
    /// reusable `probs` scratch buffer. Entries where `keep[i]` is false
    /// are forced to zero probability.
    fn softmax_masked(&mut self, logits: &[f32], keep: &[bool]) {
        self.probs.clear();
        self.probs.resize(logits.len(), 0.0);

        let max_logit = logits
            .iter()
            .zip(keep)
            .filter(|&(_, &k)| k)
            .map(|(&l, _)| l)
            .fold(f32::NEG_INFINITY, f32::max);

        if !max_logit.is_finite() {
            // Every candidate masked out, or every logit non-finite: fall
            // back to a degenerate distribution on index 0.
            if !self.probs.is_empty() {
                self.probs[0] = 1.0;
            }
            return;
        }

        let mut sum_exp = 0.0f32;
        for (i, &logit) in logits.iter().enumerate() {
            if keep[i] {
                let e = (logit - max_logit).exp();
                self.probs[i] = e;
                sum_exp += e;
            }
        }

        if sum_exp > 0.0 {
            let inv = 1.0 / sum_exp;
            for p in &mut self.probs {
                *p *= inv;
            }
        } else if !self.probs.is_empty() {
            self.probs[0] = 1.0;
        }
    }

    /// Draw an index by walking a manual cumulative sum against a uniform
    /// draw in `[0, 1)`. Falls back to the last index on float drift (the
    /// cumulative sum landing just short of the draw due to rounding).
    fn sample_from_probs(&mut self, vocab_size: usize) -> i64 {
        if vocab_size == 0 {
            return 0;
        }
        let u: f32 = self.rng.r#gen::<f32>();
        let mut cum = 0.0f32;
        for (i, &p) in self.probs.iter().enumerate() {
            cum += p;
            if u < cum {
                return i as i64;
            }
        }
        (vocab_size - 1) as i64
    }
}

fn apply_repetition_penalty(logits: &mut [f32], history: &[i64], params: &SamplingParams) {
    if params.repetition_penalty == 1.0 {
        return;
    }
    let seen: HashSet<i64> = if params.penalize_start_token {
        history.iter().copied().collect()
    } else {
        history.iter().copied().skip(1).collect()
    };

    for (token_id, logit) in logits.iter_mut().enumerate() {
        if seen.contains(&(token_id as i64)) {
            *logit = if *logit >= 0.0 {
                *logit / params.repetition_penalty
            } else {
                *logit * params.repetition_penalty
            };
        }
    }
}

fn apply_temperature(logits: &mut [f32], temperature: f32) {
    if temperature > 0.0 && temperature != 1.0 {
        let inv_temp = 1.0 / temperature;
        for logit in logits.iter_mut() {
            *logit *= inv_temp;
        }
    }
}

/// Zero out `keep` for every index whose logit is below the `k`-th highest
/// value theta. Ties at theta are all kept, so more than `k` indices can
/// survive. `k == 0` or `k >= logits.len()` is a no-op.
fn apply_top_k(logits: &[f32], keep: &mut [bool], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }

    let mut ranked: Vec<f32> = logits.to_vec();
    ranked.select_nth_unstable_by(k - 1, |a, b| {
        b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal)
    });
    let theta = ranked[k - 1];

    for (i, slot) in keep.iter_mut().enumerate() {
        *slot = *slot && logits[i] >= theta;
    }
}

/// Zero out `keep` for every index past the smallest softmax-ranked prefix
/// whose cumulative probability reaches `p`. `p >= 1.0` is a no-op. Ranking
/// uses a softmax computed only over currently-kept indices, purely to
/// order candidates — its output is discarded, not reused as the final
/// sampling distribution.
fn apply_top_p(logits: &[f32], keep: &mut [bool], p: f32) {
    if p >= 1.0 {
        return;
    }

    let max_logit = logits
        .iter()
        .zip(keep.iter())
        .filter(|&(_, &k)| k)
        .map(|(&l, _)| l)
        .fold(f32::NEG_INFINITY, f32::max);
    if !max_logit.is_finite() {
        return;
    }

    let mut ranked: Vec<(usize, f32)> = logits
        .iter()
        .zip(keep.iter())
        .enumerate()
        .filter(|&(_, (_, &k))| k)
        .map(|(i, (&l, _))| (i, (l - max_logit).exp()))
        .collect();
    let sum_exp: f32 = ranked.iter().map(|&(_, e)| e).sum();
    if sum_exp <= 0.0 {
        return;
    }
    for entry in &mut ranked {
        entry.1 /= sum_exp;
    }
    ranked.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cum = 0.0f32;
    let mut cutoff = ranked.len();
    for (i, &(_, prob)) in ranked.iter().enumerate() {
        cum += prob;
        if cum >= p {
            cutoff = i + 1;
            break;
        }
    }

    let admitted: HashSet<usize> = ranked[..cutoff].iter().map(|&(idx, _)| idx).collect();
    for (i, slot) in keep.iter_mut().enumerate() {
        *slot = *slot && admitted.contains(&i);
    }
}
