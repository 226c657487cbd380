//! Picks the fastest registered matmul kernel for each local shape.

use crate::cache::AutotuneCache;
use anyhow::{anyhow, Result};
use ndarray::Array2;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tpforge_kernels::config::{ActivationKind, KernelProfile, MatmulProblem};
use tpforge_kernels::matmul::{DynMatmulKernel, MatmulInputs};
use tpforge_kernels::registry::KernelRegistry;
use tracing::debug;

/// Row count of synthetic probe operands. Long buckets are timed on a
/// slice of rows; kernel support is still decided on the full shape.
pub const MAX_PROBE_ROWS: usize = 256;

pub struct Autotuner {
    cache: AutotuneCache,
    runs: usize,
    warmup_runs: usize,
    seed: u64,
}

impl Autotuner {
    pub fn new(cache: AutotuneCache) -> Self {
        Self {
            cache,
            runs: 3,
            warmup_runs: 1,
            seed: 0x5eed,
        }
    }

    pub fn with_runs(mut self, warmup_runs: usize, runs: usize) -> Self {
        self.warmup_runs = warmup_runs;
        self.runs = runs.max(1);
        self
    }

    pub fn cache(&self) -> &AutotuneCache {
        &self.cache
    }

    pub fn into_cache(self) -> AutotuneCache {
        self.cache
    }

    /// Kernel for `problem`, timing candidates on random operands unless a
    /// cached choice is still registered.
    pub fn tune(
        &mut self,
        registry: &KernelRegistry,
        problem: MatmulProblem,
    ) -> Result<(KernelProfile, DynMatmulKernel)> {
        if let Some(found) = self.cached(registry, &problem) {
            return Ok(found);
        }

        let probe_rows = problem.m.clamp(1, MAX_PROBE_ROWS);
        let mut rng =
            fastrand::Rng::with_seed(self.seed ^ ((problem.n as u64) << 16) ^ problem.k as u64);
        let lhs = Array2::from_shape_simple_fn((probe_rows, problem.k), || rng.f32() - 0.5);
        let rhs = Array2::from_shape_simple_fn((problem.k, problem.n), || rng.f32() - 0.5);
        let probe = MatmulProblem::new(probe_rows, problem.n, problem.k, problem.dtype);
        let inputs = MatmulInputs::new(lhs.view(), rhs.view(), ActivationKind::None);

        self.select_matmul_kernel(registry, problem, probe, &inputs)
    }

    fn cached(
        &self,
        registry: &KernelRegistry,
        problem: &MatmulProblem,
    ) -> Option<(KernelProfile, DynMatmulKernel)> {
        let profile = self.cache.get_matmul(problem)?;
        let kernel = registry.find_matmul_kernel(&profile.kernel)?;
        kernel.supports(problem).then(|| (profile.clone(), kernel))
    }

    /// Times every kernel supporting `problem` on `inputs`, whose shape is
    /// `probe`, and caches the fastest.
    pub fn select_matmul_kernel(
        &mut self,
        registry: &KernelRegistry,
        problem: MatmulProblem,
        probe: MatmulProblem,
        inputs: &MatmulInputs<'_>,
    ) -> Result<(KernelProfile, DynMatmulKernel)> {
        let mut best: Option<(KernelProfile, DynMatmulKernel)> = None;

        for kernel in registry.matmul_kernels() {
            if !kernel.supports(&problem) {
                continue;
            }

            for _ in 0..self.warmup_runs {
                let _ = kernel.run(&probe, inputs)?;
            }

            let mut total = Duration::default();
            for _ in 0..self.runs {
                let start = Instant::now();
                let _ = kernel.run(&probe, inputs)?;
                total += start.elapsed();
            }

            let avg_ms = total.as_secs_f64() * 1000.0 / self.runs as f64;
            let profile = KernelProfile::new(kernel.name(), problem, avg_ms);

            match &best {
                Some((best_profile, _))
                    if profile.average_time_ms >= best_profile.average_time_ms =>
                {
                    continue;
                }
                _ => {
                    best = Some((profile, Arc::clone(kernel)));
                }
            }
        }

        let (profile, kernel) = best.ok_or_else(|| {
            anyhow!(
                "no registered matmul kernels support problem m={} n={} k={}",
                problem.m,
                problem.n,
                problem.k
            )
        })?;

        debug!(
            m = problem.m,
            n = problem.n,
            k = problem.k,
            kernel = profile.kernel.as_str(),
            avg_ms = profile.average_time_ms,
            "selected matmul kernel"
        );
        self.cache.insert_matmul(profile.clone());
        Ok((profile, kernel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpforge_kernels::config::DataType;
    use tpforge_kernels::matmul::ReferenceMatmul;

    #[test]
    fn tuned_choice_supports_the_full_problem() {
        let registry = KernelRegistry::with_default_matmul_kernels();
        let mut tuner = Autotuner::new(AutotuneCache::new()).with_runs(0, 1);
        let problem = MatmulProblem::new(4, 16, 8, DataType::F32);
        let (profile, kernel) = tuner.tune(&registry, problem).unwrap();
        // m = 4 rules out the parallel kernel and k = 8 the blocked one
        assert_eq!(profile.kernel, "reference");
        assert!(kernel.supports(&problem));
        assert_eq!(tuner.cache().len(), 1);
    }

    #[test]
    fn long_problems_are_probed_on_a_row_slice() {
        let registry = KernelRegistry::with_default_matmul_kernels();
        let mut tuner = Autotuner::new(AutotuneCache::new()).with_runs(0, 1);
        let problem = MatmulProblem::new(65_536, 8, 64, DataType::BF16);
        let (profile, _) = tuner.tune(&registry, problem).unwrap();
        assert_eq!(profile.problem, problem);
    }

    #[test]
    fn cached_choice_is_reused() {
        let mut registry = KernelRegistry::new();
        registry.register_matmul_kernel(ReferenceMatmul::new());
        let problem = MatmulProblem::new(2, 2, 2, DataType::F32);
        let mut cache = AutotuneCache::new();
        cache.insert_matmul(KernelProfile::new("reference", problem, 123.0));

        let mut tuner = Autotuner::new(cache);
        let (profile, _) = tuner.tune(&registry, problem).unwrap();
        assert_eq!(profile.average_time_ms, 123.0);
    }

    #[test]
    fn empty_registry_is_an_error() {
        let mut tuner = Autotuner::new(AutotuneCache::new());
        let problem = MatmulProblem::new(2, 2, 2, DataType::F32);
        assert!(tuner.tune(&KernelRegistry::new(), problem).is_err());
    }
}
