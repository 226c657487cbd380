//! Graph builder and the canonical per-bucket decoder graph.

use crate::dialect::{
    AllGatherOp, AttentionOp, CollectiveOp, EmbeddingOp, GatherAxis, GraphKind, LmHeadOp, MlpOp,
    NormOp, NormSite, Operation, OutProjectionOp, QkvProjectionOp, ResidualOp, ScatterRowsOp,
    TensorSpec,
};
use crate::sharding::ModelDims;
use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write;
use tpforge_config::AcceleratorConfig;
use tpforge_kernels::config::DataType;

#[derive(Debug, Default, Clone)]
pub struct GraphBuilder {
    operations: Vec<Operation>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            operations: Vec::new(),
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn push(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn add_embedding<N: Into<String>>(
        self,
        name: N,
        tokens: TensorSpec,
        result: TensorSpec,
    ) -> Self {
        self.push(Operation::Embedding(EmbeddingOp {
            name: name.into(),
            tokens,
            result,
        }))
    }

    pub fn add_norm(self, op: NormOp) -> Self {
        self.push(Operation::Norm(op))
    }

    pub fn add_all_reduce<N: Into<String>>(self, name: N, value: TensorSpec) -> Self {
        self.push(Operation::AllReduce(CollectiveOp {
            name: name.into(),
            input: value.clone(),
            result: value,
        }))
    }

    pub fn add_residual<N: Into<String>>(
        self,
        name: N,
        layer: usize,
        input: TensorSpec,
        result: TensorSpec,
    ) -> Self {
        self.push(Operation::Residual(ResidualOp {
            name: name.into(),
            layer,
            input,
            result,
        }))
    }

    pub fn add_all_gather<N: Into<String>>(
        self,
        name: N,
        axis: GatherAxis,
        input: TensorSpec,
        result: TensorSpec,
    ) -> Self {
        self.push(Operation::AllGather(AllGatherOp {
            name: name.into(),
            axis,
            input,
            result,
        }))
    }

    pub fn build(self, kind: GraphKind, bucket: usize, rows: usize) -> Graph {
        Graph {
            kind,
            bucket,
            rows,
            operations: self.operations,
        }
    }
}

/// Decoder graph for one (kind, bucket) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub kind: GraphKind,
    pub bucket: usize,
    /// Rows processed per invocation: the bucket for context encoding, one
    /// for token generation.
    pub rows: usize,
    pub operations: Vec<Operation>,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn id(&self) -> String {
        format!("{}_b{}", self.kind.as_str(), self.bucket)
    }

    pub fn count(&self, mnemonic: &str) -> usize {
        self.operations
            .iter()
            .filter(|op| op.mnemonic() == mnemonic)
            .count()
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(
            text,
            "graph @{} attributes {{rows = {}, bucket = {}}} {{",
            self.id(),
            self.rows,
            self.bucket
        );
        for op in &self.operations {
            let _ = writeln!(text, "  {}", emit_operation(op));
        }
        text.push_str("}\n");
        text
    }

    /// Structural checks: unique op names, an embedding first and a
    /// column gather of the logits last, every sequence-parallel norm
    /// followed by a row gather, and no reduce-scatter outside a scattered
    /// region.
    pub fn verify(&self) -> Result<()> {
        ensure!(!self.operations.is_empty(), "graph {} is empty", self.id());

        let mut names = HashSet::new();
        for op in &self.operations {
            ensure!(
                names.insert(op.name()),
                "duplicate operation name '{}' in graph {}",
                op.name(),
                self.id()
            );
        }

        if !matches!(self.operations.first(), Some(Operation::Embedding(_))) {
            bail!("graph {} must start with an embedding", self.id());
        }
        match self.operations.last() {
            Some(Operation::AllGather(op)) if op.axis == GatherAxis::Columns => {}
            _ => bail!("graph {} must end with a column all-gather", self.id()),
        }

        let mut scattered = false;
        for (index, op) in self.operations.iter().enumerate() {
            match op {
                Operation::ScatterRows(_) => scattered = true,
                Operation::ReduceScatter(reduce) => ensure!(
                    scattered,
                    "reduce-scatter '{}' appears before rows were scattered",
                    reduce.name
                ),
                Operation::AllReduce(reduce) => ensure!(
                    !scattered,
                    "all-reduce '{}' inside the sequence-parallel region",
                    reduce.name
                ),
                Operation::Norm(norm) if norm.sequence_parallel => {
                    let gathered = matches!(
                        self.operations.get(index + 1),
                        Some(Operation::AllGather(gather)) if gather.axis == GatherAxis::Rows
                    );
                    ensure!(
                        gathered,
                        "sequence-parallel norm '{}' is not followed by a row all-gather",
                        norm.name
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }
}

pub fn tensor(name: &str, shape: &[usize], dtype: DataType) -> TensorSpec {
    TensorSpec::new(name, shape.to_vec(), dtype)
}

/// Canonical decoder graph: separate Q/K/V projections and all-reduce after
/// every row-parallel projection. Accelerator options are applied later by
/// the pass pipeline; `config` only supplies attention attributes.
pub fn build_decoder_graph(
    dims: &ModelDims,
    config: &AcceleratorConfig,
    kind: GraphKind,
    bucket: usize,
    dtype: DataType,
) -> Result<Graph> {
    ensure!(bucket > 0, "bucket length must be positive");
    let rows = match kind {
        GraphKind::ContextEncoding => bucket,
        GraphKind::TokenGeneration => 1,
    };
    let hidden = tensor("hidden", &[rows, dims.hidden_size], dtype);
    let normed = tensor("normed", &[rows, dims.hidden_size], dtype);
    let delta = tensor("delta", &[rows, dims.hidden_size], dtype);
    let head_dim = dims.head_dim();

    let mut builder = Graph::builder().add_embedding(
        "embed",
        tensor("tokens", &[rows], dtype),
        hidden.clone(),
    );

    let norm = |name: String, layer: Option<usize>, site: NormSite| NormOp {
        name,
        layer,
        site,
        kind: dims.norm,
        epsilon: dims.norm_epsilon,
        input: hidden.clone(),
        result: normed.clone(),
        sequence_parallel: false,
    };

    for layer in 0..dims.n_layers {
        builder = builder
            .add_norm(norm(
                format!("l{}_attn_norm", layer),
                Some(layer),
                NormSite::PreAttention,
            ))
            .push(Operation::QkvProjection(QkvProjectionOp {
                name: format!("l{}_qkv", layer),
                layer,
                input: normed.clone(),
                query: tensor("q", &[rows, dims.n_heads * head_dim], dtype),
                key: tensor("k", &[rows, dims.kv_dim()], dtype),
                value: tensor("v", &[rows, dims.kv_dim()], dtype),
                fused: false,
                rope_theta: dims.rope_theta,
            }))
            .push(Operation::Attention(AttentionOp {
                name: format!("l{}_attn", layer),
                layer,
                query: tensor("q", &[rows, dims.n_heads * head_dim], dtype),
                result: tensor("attn", &[rows, dims.n_heads * head_dim], dtype),
                scale: 1.0 / (head_dim as f32).sqrt(),
                layout: config.attention_layout,
                kv_sharding: config.kv_cache_sharding,
                shard_over_sequence: config.shard_over_sequence,
            }))
            .push(Operation::OutProjection(OutProjectionOp {
                name: format!("l{}_o_proj", layer),
                layer,
                input: tensor("attn", &[rows, dims.n_heads * head_dim], dtype),
                result: delta.clone(),
            }))
            .add_all_reduce(format!("l{}_attn_reduce", layer), delta.clone())
            .add_residual(
                format!("l{}_attn_residual", layer),
                layer,
                delta.clone(),
                hidden.clone(),
            )
            .add_norm(norm(
                format!("l{}_mlp_norm", layer),
                Some(layer),
                NormSite::PreMlp,
            ))
            .push(Operation::Mlp(MlpOp {
                name: format!("l{}_mlp", layer),
                layer,
                input: normed.clone(),
                hidden: tensor("mlp_hidden", &[rows, dims.intermediate_size], dtype),
                output: delta.clone(),
                activation: dims.activation,
                gated: dims.gated_mlp,
            }))
            .add_all_reduce(format!("l{}_mlp_reduce", layer), delta.clone())
            .add_residual(
                format!("l{}_mlp_residual", layer),
                layer,
                delta.clone(),
                hidden.clone(),
            );
    }

    // only the last row feeds sampling
    let logits = tensor("logits", &[1, dims.vocab_size], dtype);
    let graph = builder
        .add_norm(norm("final_norm".to_string(), None, NormSite::Final))
        .push(Operation::LmHead(LmHeadOp {
            name: "lm_head".to_string(),
            input: normed.clone(),
            result: logits.clone(),
        }))
        .add_all_gather("logits_gather", GatherAxis::Columns, logits.clone(), logits)
        .build(kind, bucket, rows);

    graph.verify()?;
    Ok(graph)
}

/// Inserted after the embedding by the sequence-parallel rewrite.
pub fn scatter_rows_after(embedding: &EmbeddingOp) -> Operation {
    Operation::ScatterRows(ScatterRowsOp {
        name: format!("{}_scatter", embedding.name),
        input: embedding.result.clone(),
        result: embedding.result.clone(),
    })
}

fn emit_operation(op: &Operation) -> String {
    let attrs = match op {
        Operation::Embedding(op) => format!("(%{}: {})", op.tokens.name, op.tokens.type_str()),
        Operation::ScatterRows(op) => format!("(%{}) {{axis = rows}}", op.input.name),
        Operation::Norm(op) => format!(
            "(%{}) {{kind = \"{}\", eps = {:e}, sequence_parallel = {}}}",
            op.input.name,
            op.kind.as_str(),
            op.epsilon,
            op.sequence_parallel
        ),
        Operation::QkvProjection(op) => format!(
            "(%{}) {{fused = {}, rope_theta = {}}} -> (%{}: {}, %{}: {}, %{}: {})",
            op.input.name,
            op.fused,
            op.rope_theta,
            op.query.name,
            op.query.type_str(),
            op.key.name,
            op.key.type_str(),
            op.value.name,
            op.value.type_str()
        ),
        Operation::Attention(op) => format!(
            "(%{}) {{scale = {:.6}, layout = \"{}\", kv_sharding = \"{}\", shard_over_sequence = {}}}",
            op.query.name,
            op.scale,
            op.layout.as_str(),
            op.kv_sharding.as_str(),
            op.shard_over_sequence
        ),
        Operation::OutProjection(op) => format!("(%{})", op.input.name),
        Operation::Mlp(op) => format!(
            "(%{}) {{activation = \"{}\", gated = {}, hidden = {}}}",
            op.input.name,
            op.activation.as_str(),
            op.gated,
            op.hidden.type_str()
        ),
        Operation::AllReduce(op) | Operation::ReduceScatter(op) => format!("(%{})", op.input.name),
        Operation::AllGather(op) => format!(
            "(%{}) {{axis = {}}}",
            op.input.name,
            match op.axis {
                GatherAxis::Rows => "rows",
                GatherAxis::Columns => "columns",
            }
        ),
        Operation::Residual(op) => format!("(%{}, %{})", op.result.name, op.input.name),
        Operation::LmHead(op) => format!("(%{})", op.input.name),
    };
    let result = op.result();
    format!(
        "%{} = tpf.{} @{}{} : {}",
        result.name,
        op.mnemonic(),
        op.name(),
        attrs,
        result.type_str()
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tpforge_kernels::config::ActivationKind;
    use tpforge_kernels::norm::NormKind;

    pub(crate) fn tiny_dims() -> ModelDims {
        ModelDims {
            vocab_size: 96,
            hidden_size: 32,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 2,
            intermediate_size: 64,
            norm: NormKind::RmsNorm,
            norm_epsilon: 1e-5,
            activation: ActivationKind::Silu,
            gated_mlp: true,
            rope_theta: 10000.0,
        }
    }

    #[test]
    fn context_graph_has_expected_structure() {
        let graph = build_decoder_graph(
            &tiny_dims(),
            &AcceleratorConfig::default(),
            GraphKind::ContextEncoding,
            128,
            DataType::F32,
        )
        .unwrap();
        assert_eq!(graph.rows, 128);
        assert_eq!(graph.count("qkv_proj"), 2);
        assert_eq!(graph.count("all_reduce"), 4);
        assert_eq!(graph.count("norm"), 5);
        assert_eq!(graph.id(), "ctx_b128");
    }

    #[test]
    fn token_generation_graph_processes_one_row() {
        let graph = build_decoder_graph(
            &tiny_dims(),
            &AcceleratorConfig::default(),
            GraphKind::TokenGeneration,
            256,
            DataType::BF16,
        )
        .unwrap();
        assert_eq!(graph.rows, 1);
        assert!(graph.to_text().contains("tensor<1x96xbf16>"));
    }

    #[test]
    fn verify_rejects_duplicate_names() {
        let mut graph = build_decoder_graph(
            &tiny_dims(),
            &AcceleratorConfig::default(),
            GraphKind::ContextEncoding,
            16,
            DataType::F32,
        )
        .unwrap();
        let first = graph.operations[1].clone();
        graph.operations.insert(2, first);
        assert!(graph.verify().is_err());
    }

    #[test]
    fn text_dump_lists_every_operation() {
        let graph = build_decoder_graph(
            &tiny_dims(),
            &AcceleratorConfig::default(),
            GraphKind::ContextEncoding,
            16,
            DataType::F32,
        )
        .unwrap();
        let text = graph.to_text();
        assert!(text.starts_with("graph @ctx_b16"));
        assert_eq!(text.lines().count(), graph.operations.len() + 2);
        assert!(text.contains("tpf.lm_head @lm_head"));
    }
}
