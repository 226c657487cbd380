//! Runs lowered graphs on the placed cores.
//!
//! Compute ops run on every core in parallel against that core's shard.
//! Collectives exchange a named activation between all cores. Context
//! encoding is dispatched to the smallest bucket holding the prompt, each
//! generated token to the smallest bucket holding its position. Rows past
//! the real sequence length are padding; they are masked out and never
//! computed, only reported.

use crate::collectives::{
    all_gather_columns, all_gather_rows, all_reduce, reduce_scatter_rows, scatter_rows,
};
use crate::placement::CoreState;
use anyhow::{anyhow, bail, ensure, Context, Result};
use ndarray::{s, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tpforge_config::Buckets;
use tpforge_ir::{
    AttentionOp, GatherAxis, GraphKind, LoweredGraph, LoweredOp, ModelDims, NormSite, Operation,
    ShardLayout,
};
use tpforge_kernels::attention::PartialAttention;
use tpforge_kernels::config::{ActivationKind, DataType};
use tpforge_kernels::matmul::MatmulInputs;
use tpforge_kernels::norm::normalize;
use tpforge_kernels::registry::KernelRegistry;
use tpforge_llm::{QkvWeights, Rope};
use tracing::trace;

/// Which graph served a step and how much of its bucket was padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub kind: GraphKind,
    pub bucket: usize,
    pub rows: usize,
    pub padded_rows: usize,
}

/// Per-core activations, addressed by the tensor names the graph uses.
#[derive(Debug, Default)]
struct Slots {
    hidden: Array2<f32>,
    normed: Array2<f32>,
    delta: Array2<f32>,
    q: Array2<f32>,
    k: Array2<f32>,
    v: Array2<f32>,
    attn: Array2<f32>,
    logits: Array2<f32>,
}

impl Slots {
    fn named(&mut self, name: &str) -> Result<&mut Array2<f32>> {
        Ok(match name {
            "hidden" => &mut self.hidden,
            "normed" => &mut self.normed,
            "delta" => &mut self.delta,
            "logits" => &mut self.logits,
            other => bail!("no activation slot named '{}'", other),
        })
    }
}

/// Position of the first row and the sequence slot a graph run serves.
#[derive(Debug, Clone, Copy)]
struct RunContext {
    sequence: usize,
    first_position: usize,
    rows: usize,
}

pub struct Executor {
    dims: ModelDims,
    layout: ShardLayout,
    buckets: Buckets,
    dtype: DataType,
    graphs: HashMap<(GraphKind, usize), LoweredGraph>,
    registry: KernelRegistry,
    rope: Rope,
    cores: Vec<CoreState>,
}

impl Executor {
    pub fn new(
        dims: ModelDims,
        layout: ShardLayout,
        buckets: Buckets,
        dtype: DataType,
        graphs: Vec<LoweredGraph>,
        cores: Vec<CoreState>,
    ) -> Result<Self> {
        ensure!(
            cores.len() == layout.tp_degree,
            "{} placed cores for tp_degree {}",
            cores.len(),
            layout.tp_degree
        );
        let graphs: HashMap<_, _> = graphs
            .into_iter()
            .map(|graph| ((graph.kind, graph.bucket), graph))
            .collect();
        for bucket in buckets.iter() {
            for kind in [GraphKind::ContextEncoding, GraphKind::TokenGeneration] {
                ensure!(
                    graphs.contains_key(&(kind, bucket)),
                    "no {} graph compiled for bucket {}",
                    kind.as_str(),
                    bucket
                );
            }
        }
        let rope = Rope::new(dims.head_dim(), dims.rope_theta);
        Ok(Self {
            dims,
            layout,
            buckets,
            dtype,
            graphs,
            registry: KernelRegistry::with_default_matmul_kernels(),
            rope,
            cores,
        })
    }

    pub fn tp_degree(&self) -> usize {
        self.layout.tp_degree
    }

    pub fn vocab_size(&self) -> usize {
        self.dims.vocab_size
    }

    pub fn reset_cache(&mut self) {
        self.cores
            .par_iter_mut()
            .for_each(|core| core.cache.reset());
    }

    /// Encodes `tokens` into the cache of `sequence` and returns the logits
    /// of the last position.
    pub fn prefill(&mut self, sequence: usize, tokens: &[usize]) -> Result<(Vec<f32>, StepReport)> {
        ensure!(!tokens.is_empty(), "cannot encode an empty prompt");
        let bucket = self.buckets.select(tokens.len()).ok_or_else(|| {
            anyhow!(
                "prompt of {} tokens exceeds the largest bucket {}",
                tokens.len(),
                self.buckets.largest()
            )
        })?;
        let ctx = RunContext {
            sequence,
            first_position: 0,
            rows: tokens.len(),
        };
        let logits = self.run(GraphKind::ContextEncoding, bucket, ctx, tokens)?;
        Ok((
            logits,
            StepReport {
                kind: GraphKind::ContextEncoding,
                bucket,
                rows: tokens.len(),
                padded_rows: bucket - tokens.len(),
            },
        ))
    }

    /// Appends `token` at `position` and returns the next-token logits.
    pub fn decode(
        &mut self,
        sequence: usize,
        token: usize,
        position: usize,
    ) -> Result<(Vec<f32>, StepReport)> {
        let bucket = self.buckets.select(position + 1).ok_or_else(|| {
            anyhow!(
                "position {} exceeds the largest bucket {}",
                position,
                self.buckets.largest()
            )
        })?;
        let ctx = RunContext {
            sequence,
            first_position: position,
            rows: 1,
        };
        let logits = self.run(GraphKind::TokenGeneration, bucket, ctx, &[token])?;
        Ok((
            logits,
            StepReport {
                kind: GraphKind::TokenGeneration,
                bucket,
                rows: 1,
                padded_rows: 0,
            },
        ))
    }

    fn run(
        &mut self,
        kind: GraphKind,
        bucket: usize,
        ctx: RunContext,
        tokens: &[usize],
    ) -> Result<Vec<f32>> {
        let vocab = self.dims.vocab_size;
        if let Some(&bad) = tokens.iter().find(|&&t| t >= vocab) {
            bail!("token id {} is outside the vocabulary of {}", bad, vocab);
        }

        let Executor {
            layout,
            dtype,
            graphs,
            registry,
            rope,
            cores,
            ..
        } = self;
        let graph = graphs
            .get(&(kind, bucket))
            .with_context(|| format!("no {} graph for bucket {}", kind.as_str(), bucket))?;
        let env = Env {
            layout,
            dtype: *dtype,
            registry,
            rope,
        };

        let mut slots: Vec<Slots> = (0..cores.len()).map(|_| Slots::default()).collect();
        for op in &graph.operations {
            trace!(graph = %graph.id(), op = op.name.as_str(), "executing");
            env.execute(op, ctx, tokens, cores, &mut slots)
                .with_context(|| format!("{} failed in graph {}", op.name, graph.id()))?;
        }

        let logits = &slots[0].logits;
        ensure!(
            logits.dim() == (1, vocab),
            "graph {} produced logits of shape {:?}",
            graph.id(),
            logits.dim()
        );
        Ok(logits.row(0).to_vec())
    }
}

struct Env<'a> {
    layout: &'a ShardLayout,
    dtype: DataType,
    registry: &'a KernelRegistry,
    rope: &'a Rope,
}

impl Env<'_> {
    fn execute(
        &self,
        op: &LoweredOp,
        ctx: RunContext,
        tokens: &[usize],
        cores: &mut [CoreState],
        slots: &mut [Slots],
    ) -> Result<()> {
        match &op.operation {
            Operation::Embedding(_) => on_cores(cores, slots, |core, slot| {
                slot.hidden = core.weights.embed_tokens.select(Axis(0), tokens);
                Ok(())
            }),
            Operation::ScatterRows(scatter) => exchange(slots, &scatter.input.name, |parts| {
                scatter_rows(parts);
                Ok(())
            }),
            Operation::Norm(norm) => on_cores(cores, slots, |core, slot| {
                let weight = match (norm.site, norm.layer) {
                    (NormSite::PreAttention, Some(layer)) => &core.weights.layers[layer].attn_norm,
                    (NormSite::PreMlp, Some(layer)) => &core.weights.layers[layer].mlp_norm,
                    (NormSite::Final, _) => &core.weights.final_norm,
                    (site, None) => bail!("{:?} norm without a layer index", site),
                };
                let mut normed =
                    normalize(norm.kind, slot.hidden.view(), weight.view(), None, norm.epsilon)?;
                self.dtype.round_inplace(&mut normed);
                slot.normed = normed;
                Ok(())
            }),
            Operation::QkvProjection(qkv) => on_cores(cores, slots, |core, slot| {
                let layer = &core.weights.layers[qkv.layer];
                let input = slot.normed.view();
                let (mut q, mut k, v) = match &layer.qkv {
                    QkvWeights::Fused {
                        weight,
                        q_cols,
                        kv_cols,
                    } => {
                        let fused = self.matmul(op, 0, input, weight.view(), ActivationKind::None)?;
                        let (q_end, k_end) = (*q_cols, q_cols + kv_cols);
                        (
                            fused.slice(s![.., ..q_end]).to_owned(),
                            fused.slice(s![.., q_end..k_end]).to_owned(),
                            fused.slice(s![.., k_end..]).to_owned(),
                        )
                    }
                    QkvWeights::Separate { q, k, v } => (
                        self.matmul(op, 0, input, q.view(), ActivationKind::None)?,
                        self.matmul(op, 1, input, k.view(), ActivationKind::None)?,
                        self.matmul(op, 2, input, v.view(), ActivationKind::None)?,
                    ),
                };
                self.rope.apply(q.view_mut(), ctx.first_position);
                self.rope.apply(k.view_mut(), ctx.first_position);
                self.dtype.round_inplace(&mut q);
                self.dtype.round_inplace(&mut k);
                slot.q = q;
                slot.k = k;
                slot.v = v;
                Ok(())
            }),
            Operation::Attention(attention) => self.attention(attention, ctx, cores, slots),
            Operation::OutProjection(proj) => on_cores(cores, slots, |core, slot| {
                let weight = &core.weights.layers[proj.layer].o_proj;
                slot.delta = self.matmul(op, 0, slot.attn.view(), weight.view(), ActivationKind::None)?;
                Ok(())
            }),
            Operation::Mlp(mlp) => on_cores(cores, slots, |core, slot| {
                let layer = &core.weights.layers[mlp.layer];
                let input = slot.normed.view();
                let (hidden, down_index) = if mlp.gated {
                    let gate = self.matmul(op, 0, input, layer.gate_proj.view(), mlp.activation)?;
                    let up = self.matmul(op, 1, input, layer.up_proj.view(), ActivationKind::None)?;
                    (gate * up, 2)
                } else {
                    (self.matmul(op, 0, input, layer.up_proj.view(), mlp.activation)?, 1)
                };
                slot.delta = self.matmul(
                    op,
                    down_index,
                    hidden.view(),
                    layer.down_proj.view(),
                    ActivationKind::None,
                )?;
                Ok(())
            }),
            Operation::AllReduce(reduce) => exchange(slots, &reduce.input.name, all_reduce),
            Operation::ReduceScatter(reduce) => {
                exchange(slots, &reduce.input.name, reduce_scatter_rows)
            }
            Operation::AllGather(gather) => match gather.axis {
                GatherAxis::Rows => exchange(slots, &gather.input.name, all_gather_rows),
                GatherAxis::Columns => exchange(slots, &gather.input.name, all_gather_columns),
            },
            Operation::Residual(_) => on_cores(cores, slots, |_, slot| {
                ensure!(
                    slot.hidden.dim() == slot.delta.dim(),
                    "residual of {:?} onto {:?}",
                    slot.delta.dim(),
                    slot.hidden.dim()
                );
                slot.hidden += &slot.delta;
                self.dtype.round_inplace(&mut slot.hidden);
                Ok(())
            }),
            Operation::LmHead(_) => on_cores(cores, slots, |core, slot| {
                let rows = slot.normed.nrows();
                ensure!(rows > 0, "lm head has no rows to read");
                let last = slot.normed.slice(s![rows - 1.., ..]);
                slot.logits =
                    self.matmul(op, 0, last, core.weights.lm_head.view(), ActivationKind::None)?;
                Ok(())
            }),
        }
    }

    /// Writes this step's keys/values into the owning caches, then attends
    /// every local query head over all chunks of its kv head.
    fn attention(
        &self,
        op: &AttentionOp,
        ctx: RunContext,
        cores: &mut [CoreState],
        slots: &mut [Slots],
    ) -> Result<()> {
        let hd = self.layout.head_dim;
        let layer = op.layer;

        cores
            .par_iter_mut()
            .zip(slots.par_iter())
            .try_for_each(|(core, slot)| -> Result<()> {
                for r in 0..ctx.rows {
                    let position = ctx.first_position + r;
                    if !core.cache.owns(position) {
                        continue;
                    }
                    for local in 0..core.cache.heads().len() {
                        let cols = local * hd..(local + 1) * hd;
                        core.cache.write(
                            layer,
                            ctx.sequence,
                            local,
                            position,
                            slot.k.slice(s![r, cols.clone()]),
                            slot.v.slice(s![r, cols]),
                        )?;
                    }
                }
                Ok(())
            })?;

        let cores: &[CoreState] = cores;
        let queries: Vec<&Array2<f32>> = slots.iter().map(|slot| &slot.q).collect();
        let outputs = queries
            .par_iter()
            .enumerate()
            .map(|(core, q)| self.attend(op, ctx, core, cores, q))
            .collect::<Result<Vec<_>>>()?;
        for (slot, output) in slots.iter_mut().zip(outputs) {
            slot.attn = output;
        }
        Ok(())
    }

    fn attend(
        &self,
        op: &AttentionOp,
        ctx: RunContext,
        core: usize,
        cores: &[CoreState],
        q: &Array2<f32>,
    ) -> Result<Array2<f32>> {
        let hd = self.layout.head_dim;
        let heads = self.layout.q_heads(core);
        let mut output = Array2::<f32>::zeros((ctx.rows, heads.len() * hd));

        for (local, head) in heads.enumerate() {
            let kv_head = self.layout.kv_head_for(head);
            let holders = if self.layout.seq_shards > 1 {
                self.layout.replicas_of(kv_head)
            } else {
                vec![core]
            };
            let cols = local * hd..(local + 1) * hd;
            for r in 0..ctx.rows {
                let upto = ctx.first_position + r + 1;
                let query = q.slice(s![r, cols.clone()]);
                let mut merged = PartialAttention::empty(hd);
                for &holder in &holders {
                    let cache = &cores[holder].cache;
                    let slot = cache.slot_of(kv_head).with_context(|| {
                        format!("core {} does not cache kv head {}", holder, kv_head)
                    })?;
                    let (keys, values) = cache.span(op.layer, ctx.sequence, slot, upto)?;
                    merged = merged.merge(PartialAttention::over(query, keys, values, op.scale)?);
                }
                output
                    .slice_mut(s![r, cols.clone()])
                    .assign(&merged.finish());
            }
        }
        self.dtype.round_inplace(&mut output);
        Ok(output)
    }

    fn matmul<'v>(
        &self,
        op: &LoweredOp,
        index: usize,
        lhs: ArrayView2<'v, f32>,
        rhs: ArrayView2<'v, f32>,
        activation: ActivationKind,
    ) -> Result<Array2<f32>> {
        let inputs = MatmulInputs::new(lhs, rhs, activation);
        let problem = inputs.problem(self.dtype);
        let kernel = op
            .kernel_for(index)
            .and_then(|name| self.registry.find_matmul_kernel(name))
            .filter(|kernel| kernel.supports(&problem))
            .unwrap_or_else(|| self.registry.fallback_matmul_kernel());
        let mut output = kernel.run(&problem, &inputs)?;
        self.dtype.round_inplace(&mut output);
        Ok(output)
    }
}

fn on_cores<F>(cores: &[CoreState], slots: &mut [Slots], f: F) -> Result<()>
where
    F: Fn(&CoreState, &mut Slots) -> Result<()> + Send + Sync,
{
    cores
        .par_iter()
        .zip(slots.par_iter_mut())
        .try_for_each(|(core, slot)| f(core, slot))
}

/// Runs a collective over the activation `name` of every core.
fn exchange<F>(slots: &mut [Slots], name: &str, collective: F) -> Result<()>
where
    F: FnOnce(&mut [Array2<f32>]) -> Result<()>,
{
    let mut parts = slots
        .iter_mut()
        .map(|slot| slot.named(name).map(std::mem::take))
        .collect::<Result<Vec<_>>>()?;
    collective(&mut parts)?;
    for (slot, part) in slots.iter_mut().zip(parts) {
        *slot.named(name)? = part;
    }
    Ok(())
}
