//! Graph rewrites driven by the accelerator configuration.

use crate::builder::{scatter_rows_after, Graph};
use crate::dialect::{AllGatherOp, CollectiveOp, GatherAxis, Operation};
use anyhow::Result;
use tpforge_config::AcceleratorConfig;
use tracing::debug;

pub trait Pass {
    fn name(&self) -> &str;
    fn run(&self, graph: &mut Graph) -> Result<()>;
}

/// Marks Q/K/V projections as a single concatenated matmul.
pub struct FuseQkv;

impl Pass for FuseQkv {
    fn name(&self) -> &str {
        "fuse-qkv"
    }

    fn run(&self, graph: &mut Graph) -> Result<()> {
        let mut fused = 0;
        for op in graph.operations.iter_mut() {
            if let Operation::QkvProjection(qkv) = op {
                if !qkv.fused {
                    qkv.fused = true;
                    fused += 1;
                }
            }
        }
        debug!(pass = self.name(), graph = %graph.id(), fused, "fused qkv projections");
        Ok(())
    }
}

/// Moves residual adds and norms into a row-scattered region: rows are
/// scattered after the embedding, all-reduces become reduce-scatters and
/// every norm output is gathered back to full rows.
pub struct SequenceParallelNorm;

impl Pass for SequenceParallelNorm {
    fn name(&self) -> &str {
        "sequence-parallel-norm"
    }

    fn run(&self, graph: &mut Graph) -> Result<()> {
        if graph
            .operations
            .iter()
            .any(|op| matches!(op, Operation::ScatterRows(_)))
        {
            return Ok(());
        }

        let mut rewritten = Vec::with_capacity(graph.operations.len() * 2);
        let mut norms = 0;
        for op in graph.operations.drain(..) {
            match op {
                Operation::Embedding(embedding) => {
                    let scatter = scatter_rows_after(&embedding);
                    rewritten.push(Operation::Embedding(embedding));
                    rewritten.push(scatter);
                }
                Operation::AllReduce(reduce) => {
                    rewritten.push(Operation::ReduceScatter(CollectiveOp {
                        name: reduce.name.replace("reduce", "reduce_scatter"),
                        input: reduce.input,
                        result: reduce.result,
                    }));
                }
                Operation::Norm(mut norm) => {
                    norm.sequence_parallel = true;
                    let gather = Operation::AllGather(AllGatherOp {
                        name: format!("{}_gather", norm.name),
                        axis: GatherAxis::Rows,
                        input: norm.result.clone(),
                        result: norm.result.clone(),
                    });
                    rewritten.push(Operation::Norm(norm));
                    rewritten.push(gather);
                    norms += 1;
                }
                other => rewritten.push(other),
            }
        }
        graph.operations = rewritten;
        debug!(pass = self.name(), graph = %graph.id(), norms, "rewrote norms into sequence-parallel region");
        graph.verify()
    }
}

pub struct PassPipeline {
    passes: Vec<Box<dyn Pass + Send + Sync>>,
}

impl PassPipeline {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Passes implied by the accelerator switches.
    pub fn for_config(config: &AcceleratorConfig) -> Self {
        let mut pipeline = Self::new();
        if config.fuse_qkv {
            pipeline.add_pass(FuseQkv);
        }
        if config.sequence_parallel_norm {
            pipeline.add_pass(SequenceParallelNorm);
        }
        pipeline
    }

    pub fn add_pass<P>(&mut self, pass: P)
    where
        P: Pass + Send + Sync + 'static,
    {
        self.passes.push(Box::new(pass));
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|pass| pass.name()).collect()
    }

    pub fn run(&self, graph: &mut Graph) -> Result<()> {
        for pass in &self.passes {
            pass.run(graph)?;
        }
        Ok(())
    }
}

impl Default for PassPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_decoder_graph, tests::tiny_dims};
    use crate::dialect::GraphKind;
    use tpforge_kernels::config::DataType;

    fn graph() -> Graph {
        build_decoder_graph(
            &tiny_dims(),
            &AcceleratorConfig::default(),
            GraphKind::ContextEncoding,
            64,
            DataType::F32,
        )
        .unwrap()
    }

    #[test]
    fn default_config_runs_no_passes() {
        assert!(PassPipeline::for_config(&AcceleratorConfig::default())
            .pass_names()
            .is_empty());
        assert_eq!(
            PassPipeline::for_config(&AcceleratorConfig::long_context()).pass_names(),
            vec!["fuse-qkv", "sequence-parallel-norm"]
        );
    }

    #[test]
    fn fuse_qkv_marks_every_projection() {
        let mut graph = graph();
        FuseQkv.run(&mut graph).unwrap();
        assert!(graph.operations.iter().all(|op| match op {
            Operation::QkvProjection(qkv) => qkv.fused,
            _ => true,
        }));
    }

    #[test]
    fn sequence_parallel_rewrite_swaps_collectives() {
        let mut graph = graph();
        let norms = graph.count("norm");
        SequenceParallelNorm.run(&mut graph).unwrap();
        assert_eq!(graph.count("all_reduce"), 0);
        assert_eq!(graph.count("reduce_scatter"), 4);
        assert_eq!(graph.count("scatter_rows"), 1);
        // one row gather per norm plus the logits column gather
        assert_eq!(graph.count("all_gather"), norms + 1);
        assert!(matches!(graph.operations[1], Operation::ScatterRows(_)));
    }

    #[test]
    fn sequence_parallel_rewrite_is_idempotent() {
        let mut graph = graph();
        SequenceParallelNorm.run(&mut graph).unwrap();
        let len = graph.operations.len();
        SequenceParallelNorm.run(&mut graph).unwrap();
        assert_eq!(graph.operations.len(), len);
    }
}
