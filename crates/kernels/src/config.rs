//! Kernel configuration structures.

use anyhow::{bail, Result};
use half::{bf16, f16};
use ndarray::{ArrayBase, DataMut, Dimension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric precision used for weights and activations on the cores.
///
/// Values are held as `f32` on the host and rounded through the narrower
/// format, so an `f16` model behaves like one stored in half precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    F32,
    F16,
    BF16,
}

impl DataType {
    pub fn element_size_bytes(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 | DataType::BF16 => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
        }
    }

    /// Round a single value through this precision.
    pub fn round(&self, value: f32) -> f32 {
        match self {
            DataType::F32 => value,
            DataType::F16 => f16::from_f32(value).to_f32(),
            DataType::BF16 => bf16::from_f32(value).to_f32(),
        }
    }

    pub fn round_inplace<S, D>(&self, values: &mut ArrayBase<S, D>)
    where
        S: DataMut<Elem = f32>,
        D: Dimension,
    {
        if *self == DataType::F32 {
            return;
        }
        let dtype = *self;
        values.mapv_inplace(|x| dtype.round(x));
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "fp32" | "float32" => Ok(DataType::F32),
            "f16" | "fp16" | "float16" => Ok(DataType::F16),
            "bf16" | "bfloat16" => Ok(DataType::BF16),
            other => bail!("unsupported precision '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatmulProblem {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub dtype: DataType,
}

impl MatmulProblem {
    pub fn new(m: usize, n: usize, k: usize, dtype: DataType) -> Self {
        Self { m, n, k, dtype }
    }

    pub fn flops(&self) -> f64 {
        2.0 * self.m as f64 * self.n as f64 * self.k as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    #[default]
    None,
    Gelu,
    Silu,
}

impl ActivationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationKind::None => "none",
            ActivationKind::Gelu => "gelu",
            ActivationKind::Silu => "silu",
        }
    }

    pub fn apply(&self, x: f32) -> f32 {
        match self {
            ActivationKind::None => x,
            ActivationKind::Gelu => {
                // tanh approximation
                let c = (2.0 / std::f32::consts::PI).sqrt();
                0.5 * x * (1.0 + (c * (x + 0.044715 * x.powi(3))).tanh())
            }
            ActivationKind::Silu => x / (1.0 + (-x).exp()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelProfile {
    pub kernel: String,
    pub problem: MatmulProblem,
    pub average_time_ms: f64,
    pub gflops: f64,
}

impl KernelProfile {
    pub fn new(kernel: &str, problem: MatmulProblem, average_time_ms: f64) -> Self {
        let gflops = if average_time_ms > 0.0 {
            problem.flops() / (average_time_ms * 1.0e6)
        } else {
            0.0
        };

        Self {
            kernel: kernel.to_string(),
            problem,
            average_time_ms,
            gflops,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn bf16_rounding_drops_low_mantissa_bits() {
        let value = 1.0 + 1.0 / 1024.0;
        assert_eq!(DataType::F32.round(value), value);
        assert_eq!(DataType::BF16.round(value), 1.0);
        assert_eq!(DataType::F16.round(value), value);
    }

    #[test]
    fn precision_parses_notebook_spellings() {
        assert_eq!("f16".parse::<DataType>().unwrap(), DataType::F16);
        assert_eq!("BF16".parse::<DataType>().unwrap(), DataType::BF16);
        assert_eq!("fp32".parse::<DataType>().unwrap(), DataType::F32);
        assert!("int8".parse::<DataType>().is_err());
    }

    #[test]
    fn round_inplace_is_identity_for_f32() {
        let mut values = Array1::from(vec![0.1f32, 0.2, 0.3]);
        let original = values.clone();
        DataType::F32.round_inplace(&mut values);
        assert_eq!(values, original);
        DataType::F16.round_inplace(&mut values);
        assert_ne!(values, original);
    }

    #[test]
    fn silu_matches_closed_form() {
        let x = 1.5f32;
        let expected = x / (1.0 + (-x).exp());
        assert!((ActivationKind::Silu.apply(x) - expected).abs() < 1e-6);
        assert_eq!(ActivationKind::None.apply(x), x);
    }
}
