//! Rotary position embeddings, rotate-half convention as in llama
//! checkpoints.
//!
//! Reference: https://arxiv.org/abs/2104.09864

use ndarray::{ArrayViewMut1, ArrayViewMut2, Axis};

#[derive(Debug, Clone)]
pub struct Rope {
    inv_freq: Vec<f32>,
    head_dim: usize,
}

impl Rope {
    pub fn new(head_dim: usize, theta: f32) -> Self {
        let half = head_dim / 2;
        let inv_freq = (0..half)
            .map(|i| 1.0 / theta.powf((2 * i) as f32 / head_dim as f32))
            .collect();
        Self { inv_freq, head_dim }
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Rotate one head vector for `position`: element `i` pairs with
    /// `i + head_dim / 2`.
    pub fn rotate(&self, mut head: ArrayViewMut1<'_, f32>, position: usize) {
        let half = self.inv_freq.len();
        for (i, freq) in self.inv_freq.iter().enumerate() {
            let (sin, cos) = (position as f32 * freq).sin_cos();
            let x0 = head[i];
            let x1 = head[i + half];
            head[i] = x0 * cos - x1 * sin;
            head[i + half] = x0 * sin + x1 * cos;
        }
    }

    /// Rotate every head of `rows` (shape `(rows, heads * head_dim)`), row
    /// `r` sitting at `first_position + r`.
    pub fn apply(&self, mut rows: ArrayViewMut2<'_, f32>, first_position: usize) {
        for (r, mut row) in rows.axis_iter_mut(Axis(0)).enumerate() {
            for head in row.exact_chunks_mut(self.head_dim) {
                self.rotate(head, first_position + r);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    #[test]
    fn position_zero_is_identity() {
        let rope = Rope::new(8, 10000.0);
        let original = Array2::from_shape_fn((1, 16), |(_, j)| j as f32 * 0.1);
        let mut rotated = original.clone();
        rope.apply(rotated.view_mut(), 0);
        assert_eq!(rotated, original);
    }

    #[test]
    fn rotation_preserves_norm() {
        let rope = Rope::new(8, 10000.0);
        let mut head = Array1::from_iter((0..8).map(|i| i as f32 - 3.5));
        let before = head.dot(&head);
        rope.rotate(head.view_mut(), 1234);
        assert_abs_diff_eq!(head.dot(&head), before, epsilon = 1e-3);
    }

    #[test]
    fn dot_product_depends_on_relative_position() {
        let rope = Rope::new(8, 10000.0);
        let q = Array1::from_iter((0..8).map(|i| (i as f32).sin()));
        let k = Array1::from_iter((0..8).map(|i| (i as f32).cos()));
        let score = |qp: usize, kp: usize| {
            let (mut q, mut k) = (q.clone(), k.clone());
            rope.rotate(q.view_mut(), qp);
            rope.rotate(k.view_mut(), kp);
            q.dot(&k)
        };
        assert_abs_diff_eq!(score(10, 7), score(103, 100), epsilon = 1e-3);
    }
}
