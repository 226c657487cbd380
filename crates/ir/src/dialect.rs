//! Decoder graph operations.
//!
//! Ops are coarse: one op per projection, norm, attention or collective.
//! Each op reads and writes fixed per-core slots (hidden, normed, q/k/v,
//! attention output, partial sums, logits); the tensor specs exist for
//! shape bookkeeping and the text dump.

use serde::{Deserialize, Serialize};
use tpforge_config::{AttentionLayout, KvCacheSharding};
use tpforge_kernels::config::{ActivationKind, DataType};
use tpforge_kernels::norm::NormKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl TensorSpec {
    pub fn new<N: Into<String>>(name: N, shape: Vec<usize>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn num_bytes(&self) -> usize {
        self.num_elements() * self.dtype.element_size_bytes()
    }

    pub fn type_str(&self) -> String {
        if self.shape.is_empty() {
            return format!("tensor<{}>", self.dtype.as_str());
        }
        let dims = self
            .shape
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>()
            .join("x");
        format!("tensor<{}x{}>", dims, self.dtype.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphKind {
    /// Encodes a whole prompt; rows = bucket length.
    ContextEncoding,
    /// Generates one token against a cache of up to bucket length.
    TokenGeneration,
}

impl GraphKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphKind::ContextEncoding => "ctx",
            GraphKind::TokenGeneration => "tkg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormSite {
    PreAttention,
    PreMlp,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatherAxis {
    /// Concatenate sequence chunks.
    Rows,
    /// Concatenate vocabulary shards.
    Columns,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingOp {
    pub name: String,
    pub tokens: TensorSpec,
    pub result: TensorSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScatterRowsOp {
    pub name: String,
    pub input: TensorSpec,
    pub result: TensorSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormOp {
    pub name: String,
    pub layer: Option<usize>,
    pub site: NormSite,
    pub kind: NormKind,
    pub epsilon: f32,
    pub input: TensorSpec,
    pub result: TensorSpec,
    pub sequence_parallel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QkvProjectionOp {
    pub name: String,
    pub layer: usize,
    pub input: TensorSpec,
    pub query: TensorSpec,
    pub key: TensorSpec,
    pub value: TensorSpec,
    pub fused: bool,
    pub rope_theta: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionOp {
    pub name: String,
    pub layer: usize,
    pub query: TensorSpec,
    pub result: TensorSpec,
    pub scale: f32,
    pub layout: AttentionLayout,
    pub kv_sharding: KvCacheSharding,
    pub shard_over_sequence: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutProjectionOp {
    pub name: String,
    pub layer: usize,
    pub input: TensorSpec,
    pub result: TensorSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpOp {
    pub name: String,
    pub layer: usize,
    pub input: TensorSpec,
    pub hidden: TensorSpec,
    pub output: TensorSpec,
    pub activation: ActivationKind,
    pub gated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveOp {
    pub name: String,
    pub input: TensorSpec,
    pub result: TensorSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllGatherOp {
    pub name: String,
    pub axis: GatherAxis,
    pub input: TensorSpec,
    pub result: TensorSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidualOp {
    pub name: String,
    pub layer: usize,
    pub input: TensorSpec,
    pub result: TensorSpec,
}

/// Projects the last row of its input onto this core's vocabulary slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmHeadOp {
    pub name: String,
    pub input: TensorSpec,
    pub result: TensorSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Embedding(EmbeddingOp),
    ScatterRows(ScatterRowsOp),
    Norm(NormOp),
    QkvProjection(QkvProjectionOp),
    Attention(AttentionOp),
    OutProjection(OutProjectionOp),
    Mlp(MlpOp),
    AllReduce(CollectiveOp),
    ReduceScatter(CollectiveOp),
    AllGather(AllGatherOp),
    Residual(ResidualOp),
    LmHead(LmHeadOp),
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Operation::Embedding(op) => &op.name,
            Operation::ScatterRows(op) => &op.name,
            Operation::Norm(op) => &op.name,
            Operation::QkvProjection(op) => &op.name,
            Operation::Attention(op) => &op.name,
            Operation::OutProjection(op) => &op.name,
            Operation::Mlp(op) => &op.name,
            Operation::AllReduce(op) | Operation::ReduceScatter(op) => &op.name,
            Operation::AllGather(op) => &op.name,
            Operation::Residual(op) => &op.name,
            Operation::LmHead(op) => &op.name,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Operation::Embedding(_) => "embedding",
            Operation::ScatterRows(_) => "scatter_rows",
            Operation::Norm(_) => "norm",
            Operation::QkvProjection(_) => "qkv_proj",
            Operation::Attention(_) => "attention",
            Operation::OutProjection(_) => "out_proj",
            Operation::Mlp(_) => "mlp",
            Operation::AllReduce(_) => "all_reduce",
            Operation::ReduceScatter(_) => "reduce_scatter",
            Operation::AllGather(_) => "all_gather",
            Operation::Residual(_) => "residual",
            Operation::LmHead(_) => "lm_head",
        }
    }

    pub fn is_collective(&self) -> bool {
        matches!(
            self,
            Operation::ScatterRows(_)
                | Operation::AllReduce(_)
                | Operation::ReduceScatter(_)
                | Operation::AllGather(_)
        )
    }

    pub fn result(&self) -> &TensorSpec {
        match self {
            Operation::Embedding(op) => &op.result,
            Operation::ScatterRows(op) => &op.result,
            Operation::Norm(op) => &op.result,
            Operation::QkvProjection(op) => &op.query,
            Operation::Attention(op) => &op.result,
            Operation::OutProjection(op) => &op.result,
            Operation::Mlp(op) => &op.output,
            Operation::AllReduce(op) | Operation::ReduceScatter(op) => &op.result,
            Operation::AllGather(op) => &op.result,
            Operation::Residual(op) => &op.result,
            Operation::LmHead(op) => &op.result,
        }
    }
}
