//! Attention kernels.
//!
//! Attention is computed one query row at a time against a span of cached
//! keys/values. A span may be split across cores (sequence sharding), so the
//! kernel produces a [`PartialAttention`] per chunk and chunks are combined
//! with a log-sum-exp merge. A single chunk is exact softmax attention.

use anyhow::{ensure, Result};
use ndarray::{Array1, ArrayView1, ArrayView2};

#[derive(Debug, Clone)]
pub struct PartialAttention {
    /// Running max of the scaled scores.
    pub max: f32,
    /// Sum of `exp(score - max)`.
    pub denominator: f32,
    /// Sum of `exp(score - max) * value`.
    pub numerator: Array1<f32>,
}

impl PartialAttention {
    pub fn empty(head_dim: usize) -> Self {
        Self {
            max: f32::NEG_INFINITY,
            denominator: 0.0,
            numerator: Array1::zeros(head_dim),
        }
    }

    /// Attend `query` over one chunk of `keys`/`values`, both `(len, head_dim)`.
    pub fn over(
        query: ArrayView1<'_, f32>,
        keys: ArrayView2<'_, f32>,
        values: ArrayView2<'_, f32>,
        scale: f32,
    ) -> Result<Self> {
        ensure!(
            keys.ncols() == query.len(),
            "query dim {} must match key dim {}",
            query.len(),
            keys.ncols()
        );
        ensure!(
            keys.nrows() == values.nrows(),
            "key rows {} differ from value rows {}",
            keys.nrows(),
            values.nrows()
        );
        if keys.nrows() == 0 {
            return Ok(Self::empty(values.ncols()));
        }

        let mut scores = keys.dot(&query);
        scores *= scale;
        let max = scores.fold(f32::NEG_INFINITY, |acc, &s| acc.max(s));
        scores.mapv_inplace(|s| (s - max).exp());
        let denominator = scores.sum();
        let numerator = values.t().dot(&scores);

        Ok(Self {
            max,
            denominator,
            numerator,
        })
    }

    pub fn merge(self, other: PartialAttention) -> PartialAttention {
        if other.denominator == 0.0 {
            return self;
        }
        if self.denominator == 0.0 {
            return other;
        }
        let max = self.max.max(other.max);
        let a = (self.max - max).exp();
        let b = (other.max - max).exp();
        PartialAttention {
            max,
            denominator: self.denominator * a + other.denominator * b,
            numerator: &self.numerator * a + &other.numerator * b,
        }
    }

    pub fn finish(self) -> Array1<f32> {
        if self.denominator == 0.0 {
            return self.numerator;
        }
        self.numerator / self.denominator
    }
}

/// Combine per-chunk partials into the attention output.
pub fn merge_partials<I>(head_dim: usize, partials: I) -> Array1<f32>
where
    I: IntoIterator<Item = PartialAttention>,
{
    partials
        .into_iter()
        .fold(PartialAttention::empty(head_dim), PartialAttention::merge)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::softmax_inplace;
    use approx::assert_abs_diff_eq;
    use ndarray::{s, Array2};

    fn reference(q: &Array1<f32>, k: &Array2<f32>, v: &Array2<f32>, scale: f32) -> Array1<f32> {
        let mut scores = (k.dot(q) * scale).to_vec();
        softmax_inplace(&mut scores);
        v.t().dot(&Array1::from(scores))
    }

    #[test]
    fn single_chunk_is_softmax_attention() {
        let q = Array1::from_shape_fn(4, |i| i as f32 * 0.3 - 0.5);
        let k = Array2::from_shape_fn((6, 4), |(i, j)| ((i + 2 * j) % 5) as f32 * 0.2);
        let v = Array2::from_shape_fn((6, 4), |(i, j)| (i * j) as f32 * 0.1);

        let out = PartialAttention::over(q.view(), k.view(), v.view(), 0.5)
            .unwrap()
            .finish();
        let expected = reference(&q, &k, &v, 0.5);
        for (a, b) in out.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn chunked_merge_matches_unchunked() {
        let q = Array1::from_shape_fn(8, |i| (i as f32).sin());
        let k = Array2::from_shape_fn((23, 8), |(i, j)| ((i * 3 + j) as f32).cos() * 2.0);
        let v = Array2::from_shape_fn((23, 8), |(i, j)| (i as f32 - j as f32) * 0.05);

        let chunks = [(0, 7), (7, 16), (16, 23)];
        let partials = chunks.iter().map(|&(a, b)| {
            PartialAttention::over(
                q.view(),
                k.slice(s![a..b, ..]),
                v.slice(s![a..b, ..]),
                0.35,
            )
            .unwrap()
        });
        let merged = merge_partials(8, partials);
        let expected = reference(&q, &k, &v, 0.35);
        for (a, b) in merged.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn empty_chunks_do_not_contribute() {
        let q = Array1::from_elem(2, 1.0f32);
        let k = Array2::from_elem((3, 2), 0.5f32);
        let v = Array2::from_shape_fn((3, 2), |(i, _)| i as f32);
        let empty = PartialAttention::over(
            q.view(),
            k.slice(s![0..0, ..]),
            v.slice(s![0..0, ..]),
            1.0,
        )
        .unwrap();
        let full = PartialAttention::over(q.view(), k.view(), v.view(), 1.0).unwrap();
        let merged = merge_partials(2, vec![empty, full]);
        assert_abs_diff_eq!(merged[0], 1.0, epsilon = 1e-6);
    }
}
