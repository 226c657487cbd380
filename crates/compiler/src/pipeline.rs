//! Per-bucket compile pipeline: build, rewrite, lower, tune.

use anyhow::{ensure, Result};
use tpforge_autotune::{AutotuneCache, Autotuner};
use tpforge_config::{AcceleratorConfig, Buckets, LoadOptions};
use tpforge_ir::{
    build_decoder_graph, Graph, GraphKind, LoweredGraph, MemoryEstimate, ModelDims, PassPipeline,
    ShardLayout,
};
use tpforge_kernels::config::DataType;
use tpforge_kernels::registry::KernelRegistry;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct CompilerConfig {
    pub dtype: DataType,
    pub autotune_warmup_runs: usize,
    pub autotune_runs: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            dtype: DataType::F32,
            autotune_warmup_runs: 1,
            autotune_runs: 3,
        }
    }
}

#[derive(Debug)]
pub struct CompileOutput {
    pub graphs: Vec<LoweredGraph>,
    pub autotune: AutotuneCache,
}

pub struct CompilerPipeline {
    config: CompilerConfig,
    accelerator: AcceleratorConfig,
    passes: PassPipeline,
    registry: KernelRegistry,
}

impl CompilerPipeline {
    pub fn new(accelerator: &AcceleratorConfig, config: CompilerConfig) -> Self {
        Self {
            config,
            accelerator: accelerator.clone(),
            passes: PassPipeline::for_config(accelerator),
            registry: KernelRegistry::with_default_matmul_kernels(),
        }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.pass_names()
    }

    /// The rewritten, not yet lowered graph of one bucket.
    pub fn build_graph(&self, dims: &ModelDims, kind: GraphKind, bucket: usize) -> Result<Graph> {
        let mut graph = build_decoder_graph(dims, &self.accelerator, kind, bucket, self.config.dtype)?;
        self.passes.run(&mut graph)?;
        debug!(
            graph = %graph.id(),
            ops = graph.operations.len(),
            passes = ?self.passes.pass_names(),
            "graph rewritten"
        );
        Ok(graph)
    }

    pub fn compile_graph(
        &self,
        dims: &ModelDims,
        layout: &ShardLayout,
        kind: GraphKind,
        bucket: usize,
        tuner: &mut Autotuner,
    ) -> Result<LoweredGraph> {
        let graph = self.build_graph(dims, kind, bucket)?;
        let mut lowered = LoweredGraph::lower(&graph, layout, dims.hidden_size, self.config.dtype);

        let mut chosen = Vec::new();
        for problem in lowered.matmul_problems() {
            let (profile, _) = tuner.tune(&self.registry, problem)?;
            chosen.push(profile);
        }
        lowered.assign_kernels(|problem| {
            chosen
                .iter()
                .find(|p| (p.problem.m, p.problem.n, p.problem.k) == (problem.m, problem.n, problem.k))
                .map(|p| p.kernel.clone())
                .unwrap_or_else(|| self.registry.fallback_matmul_kernel().name().to_string())
        });
        debug!(
            graph = %lowered.id(),
            matmuls = chosen.len(),
            collectives = lowered.collective_count(),
            "graph lowered"
        );
        Ok(lowered)
    }

    /// Context-encoding and token-generation graphs for every bucket.
    pub fn compile(
        &self,
        dims: &ModelDims,
        layout: &ShardLayout,
        buckets: &Buckets,
        cache: AutotuneCache,
    ) -> Result<CompileOutput> {
        let mut tuner = Autotuner::new(cache)
            .with_runs(self.config.autotune_warmup_runs, self.config.autotune_runs);
        let mut graphs = Vec::with_capacity(2 * buckets.len());
        for bucket in buckets.iter() {
            for kind in [GraphKind::ContextEncoding, GraphKind::TokenGeneration] {
                graphs.push(self.compile_graph(dims, layout, kind, bucket, &mut tuner)?);
            }
        }
        let autotune = tuner.into_cache();
        info!(
            graphs = graphs.len(),
            tuned_shapes = autotune.len(),
            tp_degree = layout.tp_degree,
            "compiled buckets"
        );
        Ok(CompileOutput { graphs, autotune })
    }
}

/// Per-core footprint of weights, a kv cache as long as the largest bucket
/// and that bucket's activations; fails when it exceeds the core budget.
pub fn check_core_memory(
    layout: &ShardLayout,
    dims: &ModelDims,
    options: &LoadOptions,
) -> Result<MemoryEstimate> {
    let capacity = options.buckets.largest();
    let estimate =
        layout.memory_estimate(dims, capacity, options.batch_size, capacity, options.precision);
    ensure!(
        estimate.total_bytes() <= options.core_memory_bytes,
        "per-core memory estimate of {} bytes (weights {}, kv cache {}, activations {}) \
         exceeds the {} byte core budget at tp_degree {} with largest bucket {}",
        estimate.total_bytes(),
        estimate.weight_bytes,
        estimate.kv_cache_bytes,
        estimate.activation_bytes,
        options.core_memory_bytes,
        layout.tp_degree,
        capacity
    );
    Ok(estimate)
}
