//! Layer and RMS normalization kernels.

use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    LayerNorm,
    #[default]
    RmsNorm,
}

impl NormKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormKind::LayerNorm => "layer_norm",
            NormKind::RmsNorm => "rms_norm",
        }
    }
}

pub fn layer_norm_inplace(
    mut data: ArrayViewMut2<'_, f32>,
    gamma: ArrayView1<'_, f32>,
    beta: Option<ArrayView1<'_, f32>>,
    epsilon: f32,
) -> Result<()> {
    let feature_dim = data.len_of(Axis(1));
    ensure!(
        gamma.len() == feature_dim,
        "gamma length {} must equal feature dimension {}",
        gamma.len(),
        feature_dim
    );
    if let Some(beta) = &beta {
        ensure!(
            beta.len() == feature_dim,
            "beta length {} must equal feature dimension {}",
            beta.len(),
            feature_dim
        );
    }

    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let len = row.len() as f32;
            let mean = row.iter().sum::<f32>() / len;
            let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / len;
            let inv_std = 1.0 / (var + epsilon).sqrt();

            for (idx, value) in row.iter_mut().enumerate() {
                let mut normalized = (*value - mean) * inv_std * gamma[idx];
                if let Some(beta) = &beta {
                    normalized += beta[idx];
                }
                *value = normalized;
            }
        });

    Ok(())
}

pub fn rms_norm_inplace(
    mut data: ArrayViewMut2<'_, f32>,
    weight: ArrayView1<'_, f32>,
    epsilon: f32,
) -> Result<()> {
    let feature_dim = data.len_of(Axis(1));
    ensure!(
        weight.len() == feature_dim,
        "rms norm weight length {} must equal feature dimension {}",
        weight.len(),
        feature_dim
    );

    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let mean_sq = row.iter().map(|x| x * x).sum::<f32>() / row.len() as f32;
            let inv_rms = 1.0 / (mean_sq + epsilon).sqrt();
            for (idx, value) in row.iter_mut().enumerate() {
                *value *= inv_rms * weight[idx];
            }
        });

    Ok(())
}

/// Non-mutating normalization that returns a new array.
pub fn normalize(
    kind: NormKind,
    data: ArrayView2<'_, f32>,
    weight: ArrayView1<'_, f32>,
    bias: Option<ArrayView1<'_, f32>>,
    epsilon: f32,
) -> Result<Array2<f32>> {
    let mut output = data.to_owned();
    match kind {
        NormKind::LayerNorm => layer_norm_inplace(output.view_mut(), weight, bias, epsilon)?,
        NormKind::RmsNorm => rms_norm_inplace(output.view_mut(), weight, epsilon)?,
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    #[test]
    fn layer_norm_zero_mean_unit_var() {
        let mut data = Array2::from_shape_fn((4, 8), |(i, j)| ((i + 1) * (j + 1)) as f32 * 0.125);
        let gamma = Array1::from_elem(8, 1.0f32);
        let beta = Array1::from_elem(8, 0.0f32);

        layer_norm_inplace(data.view_mut(), gamma.view(), Some(beta.view()), 1e-5)
            .expect("layer norm");

        for row in data.axis_iter(Axis(0)) {
            let len = row.len() as f32;
            let mean = row.iter().sum::<f32>() / len;
            let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / len;
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
            assert_abs_diff_eq!(var, 1.0, epsilon = 5e-4);
        }
    }

    #[test]
    fn rms_norm_unit_root_mean_square() {
        let data = Array2::from_shape_fn((3, 16), |(i, j)| (i as f32 + 1.0) * (j as f32 - 7.5));
        let weight = Array1::from_elem(16, 1.0f32);
        let out = normalize(NormKind::RmsNorm, data.view(), weight.view(), None, 1e-6).unwrap();

        for row in out.axis_iter(Axis(0)) {
            let rms = (row.iter().map(|x| x * x).sum::<f32>() / row.len() as f32).sqrt();
            assert_abs_diff_eq!(rms, 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn row_chunks_normalize_independently() {
        // Sequence-parallel norm relies on rows being independent.
        let data = Array2::from_shape_fn((8, 6), |(i, j)| ((i * 7 + j * 3) % 11) as f32 - 5.0);
        let weight = Array1::from_shape_fn(6, |j| 0.5 + j as f32 * 0.1);
        let whole = normalize(NormKind::RmsNorm, data.view(), weight.view(), None, 1e-5).unwrap();

        let top = normalize(
            NormKind::RmsNorm,
            data.slice(ndarray::s![..4, ..]),
            weight.view(),
            None,
            1e-5,
        )
        .unwrap();
        for (a, b) in whole.slice(ndarray::s![..4, ..]).iter().zip(top.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn mismatched_weight_is_rejected() {
        let data = Array2::<f32>::zeros((2, 4));
        let weight = Array1::from_elem(3, 1.0f32);
        assert!(normalize(NormKind::LayerNorm, data.view(), weight.view(), None, 1e-5).is_err());
    }
}
