//! Matrix multiplication kernels.

use crate::config::{ActivationKind, DataType, MatmulProblem};
use crate::utils::{apply_activation, validate_matmul_inputs};
use anyhow::{ensure, Result};
use ndarray::{s, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use std::sync::Arc;

pub struct MatmulInputs<'a> {
    pub lhs: ArrayView2<'a, f32>,
    pub rhs: ArrayView2<'a, f32>,
    pub activation: ActivationKind,
}

impl<'a> MatmulInputs<'a> {
    pub fn new(
        lhs: ArrayView2<'a, f32>,
        rhs: ArrayView2<'a, f32>,
        activation: ActivationKind,
    ) -> Self {
        Self {
            lhs,
            rhs,
            activation,
        }
    }

    /// The problem these operands describe, computed in `dtype`.
    pub fn problem(&self, dtype: DataType) -> MatmulProblem {
        MatmulProblem::new(self.lhs.nrows(), self.rhs.ncols(), self.lhs.ncols(), dtype)
    }
}

pub trait MatmulKernel: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, problem: &MatmulProblem) -> bool;
    fn run(&self, problem: &MatmulProblem, inputs: &MatmulInputs<'_>) -> Result<Array2<f32>>;
}

pub type DynMatmulKernel = Arc<dyn MatmulKernel>;

fn check_problem(problem: &MatmulProblem, inputs: &MatmulInputs<'_>) -> Result<()> {
    validate_matmul_inputs(&inputs.lhs, &inputs.rhs)?;
    ensure!(
        inputs.lhs.nrows() == problem.m && inputs.rhs.ncols() == problem.n,
        "operands {}x{} @ {}x{} do not match problem m={} n={} k={}",
        inputs.lhs.nrows(),
        inputs.lhs.ncols(),
        inputs.rhs.nrows(),
        inputs.rhs.ncols(),
        problem.m,
        problem.n,
        problem.k
    );
    Ok(())
}

#[derive(Default)]
pub struct ReferenceMatmul;

impl ReferenceMatmul {
    pub fn new() -> Self {
        Self
    }
}

impl MatmulKernel for ReferenceMatmul {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn supports(&self, _problem: &MatmulProblem) -> bool {
        true
    }

    fn run(&self, problem: &MatmulProblem, inputs: &MatmulInputs<'_>) -> Result<Array2<f32>> {
        check_problem(problem, inputs)?;
        let result = inputs.lhs.dot(&inputs.rhs);
        Ok(apply_activation(result, inputs.activation))
    }
}

/// Splits the reduction dimension into fixed slabs and accumulates them.
/// Mirrors how a core streams weight tiles through local SRAM.
pub struct BlockedMatmul {
    tile_k: usize,
}

impl BlockedMatmul {
    pub fn new() -> Self {
        Self { tile_k: 64 }
    }

    pub fn with_tile_k(tile_k: usize) -> Self {
        Self {
            tile_k: tile_k.max(1),
        }
    }
}

impl Default for BlockedMatmul {
    fn default() -> Self {
        Self::new()
    }
}

impl MatmulKernel for BlockedMatmul {
    fn name(&self) -> &'static str {
        "blocked"
    }

    fn supports(&self, problem: &MatmulProblem) -> bool {
        problem.k >= self.tile_k
    }

    fn run(&self, problem: &MatmulProblem, inputs: &MatmulInputs<'_>) -> Result<Array2<f32>> {
        check_problem(problem, inputs)?;

        let mut output = Array2::<f32>::zeros((problem.m, problem.n));
        for k0 in (0..problem.k).step_by(self.tile_k) {
            let k1 = (k0 + self.tile_k).min(problem.k);
            let lhs = inputs.lhs.slice(s![.., k0..k1]);
            let rhs = inputs.rhs.slice(s![k0..k1, ..]);
            output += &lhs.dot(&rhs);
        }

        Ok(apply_activation(output, inputs.activation))
    }
}

/// Row-parallel matmul; worthwhile once the bucket is long enough that
/// each worker gets a meaningful slab of rows.
pub struct ParallelMatmul {
    min_rows_per_task: usize,
}

impl ParallelMatmul {
    pub fn new() -> Self {
        Self {
            min_rows_per_task: 16,
        }
    }
}

impl Default for ParallelMatmul {
    fn default() -> Self {
        Self::new()
    }
}

impl MatmulKernel for ParallelMatmul {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn supports(&self, problem: &MatmulProblem) -> bool {
        problem.m >= self.min_rows_per_task
    }

    fn run(&self, problem: &MatmulProblem, inputs: &MatmulInputs<'_>) -> Result<Array2<f32>> {
        check_problem(problem, inputs)?;

        let rhs = inputs.rhs;
        let mut output = Array2::<f32>::zeros((problem.m, problem.n));
        let chunk = self
            .min_rows_per_task
            .max(problem.m / rayon::current_num_threads().max(1));

        output
            .axis_chunks_iter_mut(Axis(0), chunk)
            .into_par_iter()
            .zip(inputs.lhs.axis_chunks_iter(Axis(0), chunk).into_par_iter())
            .for_each(|(mut out, lhs)| {
                out.assign(&lhs.dot(&rhs));
            });

        Ok(apply_activation(output, inputs.activation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn operands(m: usize, k: usize, n: usize) -> (Array2<f32>, Array2<f32>) {
        let lhs = Array2::from_shape_fn((m, k), |(i, j)| (i + j) as f32 * 0.1);
        let rhs = Array2::from_shape_fn((k, n), |(i, j)| (i * j + 1) as f32 * 0.05);
        (lhs, rhs)
    }

    #[test]
    fn parallel_matmul_matches_reference() {
        let (lhs, rhs) = operands(64, 16, 24);
        let inputs = MatmulInputs::new(lhs.view(), rhs.view(), ActivationKind::None);
        let problem = inputs.problem(DataType::F32);

        let reference = ReferenceMatmul::new().run(&problem, &inputs).unwrap();
        let parallel = ParallelMatmul::new().run(&problem, &inputs).unwrap();

        for (a, b) in reference.iter().zip(parallel.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn blocked_matmul_handles_ragged_k() {
        let (lhs, rhs) = operands(5, 70, 3);
        let inputs = MatmulInputs::new(lhs.view(), rhs.view(), ActivationKind::Silu);
        let problem = inputs.problem(DataType::F32);

        let reference = ReferenceMatmul::new().run(&problem, &inputs).unwrap();
        let blocked = BlockedMatmul::with_tile_k(32).run(&problem, &inputs).unwrap();

        for (a, b) in reference.iter().zip(blocked.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-3);
        }
    }

    #[test]
    fn problem_follows_operand_shapes() {
        let (lhs, rhs) = operands(3, 7, 5);
        let inputs = MatmulInputs::new(lhs.view(), rhs.view(), ActivationKind::None);
        assert_eq!(inputs.problem(DataType::BF16), MatmulProblem::new(3, 5, 7, DataType::BF16));
    }

    #[test]
    fn mismatched_problem_is_rejected() {
        let (lhs, rhs) = operands(4, 8, 2);
        let inputs = MatmulInputs::new(lhs.view(), rhs.view(), ActivationKind::None);
        let wrong = MatmulProblem::new(8, 2, 8, DataType::F32);
        assert!(ReferenceMatmul::new().run(&wrong, &inputs).is_err());
    }
}
