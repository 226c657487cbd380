//! Lowering of a rewritten graph to per-core work.
//!
//! Every core of a tensor-parallel group runs the same op list on its own
//! shard. Lowering records the local matmul shapes (core 0 holds the widest
//! shard when the vocabulary does not split evenly) and a schedule label
//! per op; kernel names are filled in by the autotuner.

use crate::builder::Graph;
use crate::dialect::{GraphKind, Operation};
use crate::sharding::ShardLayout;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tpforge_kernels::config::{DataType, MatmulProblem};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoweredOp {
    pub name: String,
    pub operation: Operation,
    pub schedule: String,
    /// Local matmuls in execution order.
    pub matmuls: Vec<MatmulProblem>,
    /// Kernel chosen for each entry of `matmuls`.
    pub kernels: Vec<String>,
}

impl LoweredOp {
    pub fn kernel_for(&self, index: usize) -> Option<&str> {
        self.kernels.get(index).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoweredGraph {
    pub kind: GraphKind,
    pub bucket: usize,
    pub rows: usize,
    pub tp_degree: usize,
    pub dtype: DataType,
    pub operations: Vec<LoweredOp>,
}

impl LoweredGraph {
    pub fn lower(graph: &Graph, layout: &ShardLayout, hidden_size: usize, dtype: DataType) -> Self {
        let operations = graph
            .operations
            .iter()
            .map(|operation| LoweredOp {
                name: operation.name().to_string(),
                schedule: schedule_for(operation, layout).to_string(),
                matmuls: local_matmuls(operation, layout, graph.rows, hidden_size, dtype),
                kernels: Vec::new(),
                operation: operation.clone(),
            })
            .collect();

        Self {
            kind: graph.kind,
            bucket: graph.bucket,
            rows: graph.rows,
            tp_degree: layout.tp_degree,
            dtype,
            operations,
        }
    }

    pub fn id(&self) -> String {
        format!("{}_b{}", self.kind.as_str(), self.bucket)
    }

    /// Distinct matmul shapes across the graph, in a stable order.
    pub fn matmul_problems(&self) -> Vec<MatmulProblem> {
        let unique: BTreeSet<(usize, usize, usize)> = self
            .operations
            .iter()
            .flat_map(|op| op.matmuls.iter().map(|p| (p.m, p.n, p.k)))
            .collect();
        unique
            .into_iter()
            .map(|(m, n, k)| MatmulProblem::new(m, n, k, self.dtype))
            .collect()
    }

    pub fn assign_kernels<F>(&mut self, mut choose: F)
    where
        F: FnMut(&MatmulProblem) -> String,
    {
        for op in self.operations.iter_mut() {
            op.kernels = op.matmuls.iter().map(&mut choose).collect();
        }
    }

    pub fn collective_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.operation.is_collective())
            .count()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

fn local_matmuls(
    operation: &Operation,
    layout: &ShardLayout,
    rows: usize,
    hidden: usize,
    dtype: DataType,
) -> Vec<MatmulProblem> {
    let q_cols = layout.heads_per_core * layout.head_dim;
    let kv_cols = layout.kv_heads(0).len() * layout.head_dim;
    let inter = layout.intermediate_per_core;
    let problem = |n: usize, k: usize| MatmulProblem::new(rows, n, k, dtype);

    match operation {
        Operation::QkvProjection(op) if op.fused => vec![problem(q_cols + 2 * kv_cols, hidden)],
        Operation::QkvProjection(_) => vec![
            problem(q_cols, hidden),
            problem(kv_cols, hidden),
            problem(kv_cols, hidden),
        ],
        Operation::OutProjection(_) => vec![problem(hidden, q_cols)],
        Operation::Mlp(op) if op.gated => vec![
            problem(inter, hidden),
            problem(inter, hidden),
            problem(hidden, inter),
        ],
        Operation::Mlp(_) => vec![problem(inter, hidden), problem(hidden, inter)],
        Operation::LmHead(_) => vec![MatmulProblem::new(
            1,
            layout.vocab_range(0).len(),
            hidden,
            dtype,
        )],
        _ => Vec::new(),
    }
}

fn schedule_for(operation: &Operation, layout: &ShardLayout) -> &'static str {
    match operation {
        Operation::Embedding(_) => "replicated-gather",
        Operation::ScatterRows(_) => "row-scatter",
        Operation::Norm(op) if op.sequence_parallel => "row-chunk-norm",
        Operation::Norm(_) => "replicated-norm",
        Operation::QkvProjection(op) if op.fused => "column-parallel-fused",
        Operation::QkvProjection(_) => "column-parallel",
        Operation::Attention(_) if layout.seq_shards > 1 => "sequence-sharded-attention",
        Operation::Attention(_) => "head-parallel-attention",
        Operation::OutProjection(_) => "row-parallel",
        Operation::Mlp(_) => "column-then-row-parallel",
        Operation::AllReduce(_) => "ring-all-reduce",
        Operation::ReduceScatter(_) => "ring-reduce-scatter",
        Operation::AllGather(_) => "ring-all-gather",
        Operation::Residual(_) => "elementwise",
        Operation::LmHead(_) => "vocab-parallel",
    }
}
