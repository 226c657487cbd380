//! Shared helpers for kernel implementations.

use crate::config::ActivationKind;
use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView2};

pub fn validate_matmul_inputs(lhs: &ArrayView2<'_, f32>, rhs: &ArrayView2<'_, f32>) -> Result<()> {
    if lhs.ncols() != rhs.nrows() {
        bail!(
            "matmul dimension mismatch: lhs {}x{} vs rhs {}x{}",
            lhs.nrows(),
            lhs.ncols(),
            rhs.nrows(),
            rhs.ncols()
        );
    }
    Ok(())
}

pub fn apply_activation(mut output: Array2<f32>, activation: ActivationKind) -> Array2<f32> {
    if activation != ActivationKind::None {
        output.mapv_inplace(|x| activation.apply(x));
    }
    output
}

/// Numerically stable softmax over a slice. `-inf` entries get zero mass;
/// an all `-inf` input yields a uniform distribution.
pub fn softmax_inplace(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let max = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);

    if max == f32::NEG_INFINITY {
        let uniform = 1.0 / values.len() as f32;
        values.fill(uniform);
        return;
    }

    let mut sum = 0.0f32;
    for v in values.iter_mut() {
        *v = if v.is_finite() { (*v - max).exp() } else { 0.0 };
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum.max(f32::EPSILON);
    }
}

/// Index of the largest finite value; ties resolve to the lowest index.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((idx, v)),
        }
    }
    best.map(|(idx, _)| idx)
}
