//! Next-token selection.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use tpforge_kernels::utils::{argmax, softmax_inplace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Total length of each returned sequence, prompt included.
    pub max_length: usize,
    pub top_k: usize,
    pub temperature: f32,
    pub seed: u64,
    #[serde(default)]
    pub eos_token: Option<usize>,
}

impl SamplingParams {
    pub fn new(max_length: usize, top_k: usize) -> Self {
        Self {
            max_length,
            top_k,
            temperature: 1.0,
            seed: 0,
            eos_token: None,
        }
    }

    pub fn greedy(max_length: usize) -> Self {
        Self::new(max_length, 1)
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_eos_token(mut self, token: usize) -> Self {
        self.eos_token = Some(token);
        self
    }

    pub fn is_greedy(&self) -> bool {
        self.top_k == 1 || self.temperature == 0.0
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_length > 0, "max_length must be positive");
        ensure!(self.top_k >= 1, "top_k must be at least 1");
        ensure!(
            self.temperature.is_finite() && self.temperature >= 0.0,
            "temperature must be a finite non-negative number"
        );
        Ok(())
    }
}

/// Keeps the `k` highest logits, ties with the k-th kept, and masks the
/// rest to `-inf`.
pub fn top_k_filter(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.select_nth_unstable_by(k - 1, |a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Draws one token per call from a seeded stream.
pub struct TopKSampler {
    top_k: usize,
    temperature: f32,
    rng: fastrand::Rng,
}

impl TopKSampler {
    pub fn new(params: &SamplingParams, row: usize) -> Self {
        Self {
            top_k: params.top_k,
            temperature: params.temperature,
            rng: fastrand::Rng::with_seed(params.seed.wrapping_add(row as u64)),
        }
    }

    pub fn sample(&mut self, logits: &[f32]) -> usize {
        if self.top_k == 1 || self.temperature == 0.0 {
            return argmax(logits).unwrap_or(0);
        }
        let mut probs = logits.to_vec();
        top_k_filter(&mut probs, self.top_k);
        for p in probs.iter_mut() {
            *p /= self.temperature;
        }
        softmax_inplace(&mut probs);

        let draw = self.rng.f32();
        let mut cumulative = 0.0;
        let mut last = 0;
        for (index, &p) in probs.iter().enumerate() {
            if p <= 0.0 {
                continue;
            }
            cumulative += p;
            last = index;
            if draw < cumulative {
                return index;
            }
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_keeps_ties_at_threshold() {
        let mut logits = vec![1.0, 3.0, 2.0, 2.0, 0.5];
        top_k_filter(&mut logits, 2);
        assert_eq!(logits[1], 3.0);
        assert_eq!(logits[2], 2.0);
        assert_eq!(logits[3], 2.0);
        assert!(logits[0].is_infinite() && logits[4].is_infinite());
    }

    #[test]
    fn greedy_picks_argmax() {
        let mut sampler = TopKSampler::new(&SamplingParams::greedy(8), 0);
        assert_eq!(sampler.sample(&[0.1, 0.9, 0.3]), 1);
        let params = SamplingParams::new(8, 10).with_temperature(0.0);
        assert!(params.is_greedy());
        assert_eq!(TopKSampler::new(&params, 0).sample(&[5.0, 0.0, 7.0]), 2);
    }

    #[test]
    fn samples_stay_inside_top_k() {
        let logits: Vec<f32> = (0..50).map(|i| i as f32 * 0.1).collect();
        let mut sampler = TopKSampler::new(&SamplingParams::new(8, 10).with_seed(42), 0);
        for _ in 0..500 {
            assert!(sampler.sample(&logits) >= 40);
        }
    }

    #[test]
    fn same_seed_same_stream() {
        let logits: Vec<f32> = (0..32).map(|i| ((i * 7) % 13) as f32 * 0.2).collect();
        let params = SamplingParams::new(8, 10).with_seed(9);
        let draw = |row| {
            let mut sampler = TopKSampler::new(&params, row);
            (0..64).map(|_| sampler.sample(&logits)).collect::<Vec<_>>()
        };
        assert_eq!(draw(0), draw(0));
        assert_ne!(draw(0), draw(1));
    }

    #[test]
    fn invalid_params_are_rejected() {
        assert!(SamplingParams::new(0, 10).validate().is_err());
        assert!(SamplingParams::new(8, 0).validate().is_err());
        assert!(SamplingParams::new(8, 2).with_temperature(-1.0).validate().is_err());
        assert!(SamplingParams::new(8, 2).validate().is_ok());
    }
}
