//! Placement of heads, kv heads, MLP columns and vocabulary over cores.

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tpforge_config::{AcceleratorConfig, Buckets, KvCacheSharding};
use tpforge_kernels::config::{ActivationKind, DataType};
use tpforge_kernels::norm::NormKind;
use tracing::warn;

/// Shape of a decoder-only model as far as graph building cares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDims {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub intermediate_size: usize,
    pub norm: NormKind,
    pub norm_epsilon: f32,
    pub activation: ActivationKind,
    pub gated_mlp: bool,
    pub rope_theta: f32,
}

impl ModelDims {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.n_heads
    }

    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim()
    }
}

/// Split `total` into `parts` contiguous ranges whose sizes differ by at
/// most one; the first ranges take the remainder.
pub fn split_range(total: usize, parts: usize, index: usize) -> Range<usize> {
    let parts = parts.max(1);
    let base = total / parts;
    let extra = total % parts;
    let start = index * base + index.min(extra);
    let len = base + usize::from(index < extra);
    start..(start + len).min(total)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardLayout {
    pub tp_degree: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub heads_per_core: usize,
    pub kv_sharding: KvCacheSharding,
    /// Cores holding each kv head.
    pub kv_replicas: usize,
    /// Number of sequence chunks a replicated kv head is split into.
    pub seq_shards: usize,
    pub sequence_parallel_norm: bool,
    pub intermediate_per_core: usize,
    pub vocab_size: usize,
    core_kv_heads: Vec<Vec<usize>>,
}

impl ShardLayout {
    /// Builds the layout and rejects head/degree/bucket combinations the
    /// cores cannot execute.
    pub fn new(
        dims: &ModelDims,
        config: &AcceleratorConfig,
        tp_degree: usize,
        buckets: &Buckets,
    ) -> Result<Self> {
        ensure!(tp_degree >= 1, "tp_degree must be at least 1");
        ensure!(
            dims.n_heads > 0 && dims.hidden_size % dims.n_heads == 0,
            "hidden size {} is not divisible by {} attention heads",
            dims.hidden_size,
            dims.n_heads
        );
        ensure!(
            dims.n_kv_heads > 0 && dims.n_heads % dims.n_kv_heads == 0,
            "{} attention heads cannot be grouped over {} kv heads",
            dims.n_heads,
            dims.n_kv_heads
        );
        ensure!(
            dims.n_heads % tp_degree == 0,
            "{} attention heads cannot be split over tp_degree {}",
            dims.n_heads,
            tp_degree
        );
        ensure!(
            dims.intermediate_size % tp_degree == 0,
            "intermediate size {} cannot be split over tp_degree {}",
            dims.intermediate_size,
            tp_degree
        );

        let heads_per_core = dims.n_heads / tp_degree;
        let n_kv = dims.n_kv_heads;

        let (core_kv_heads, kv_replicas): (Vec<Vec<usize>>, usize) = match config.kv_cache_sharding
        {
            KvCacheSharding::ShardOverHeads => {
                if n_kv % tp_degree != 0 {
                    bail!(
                        "shard_over_heads needs kv heads ({}) divisible by tp_degree ({}); \
                         use replicated_heads or all_gather_heads",
                        n_kv,
                        tp_degree
                    );
                }
                (Self::disjoint_kv_heads(n_kv, tp_degree), 1)
            }
            KvCacheSharding::ReplicatedHeads => {
                if n_kv >= tp_degree {
                    ensure!(
                        n_kv % tp_degree == 0,
                        "replicated_heads needs kv heads ({}) divisible by tp_degree ({})",
                        n_kv,
                        tp_degree
                    );
                    (Self::disjoint_kv_heads(n_kv, tp_degree), 1)
                } else {
                    ensure!(
                        tp_degree % n_kv == 0,
                        "replicated_heads needs tp_degree ({}) divisible by kv heads ({})",
                        tp_degree,
                        n_kv
                    );
                    let replicas = tp_degree / n_kv;
                    let heads = (0..tp_degree).map(|core| vec![core / replicas]).collect();
                    (heads, replicas)
                }
            }
            KvCacheSharding::AllGatherHeads => {
                let all: Vec<usize> = (0..n_kv).collect();
                (vec![all; tp_degree], tp_degree)
            }
        };

        let seq_shards = if config.shard_over_sequence {
            if kv_replicas == 1 {
                warn!(
                    kv_sharding = config.kv_cache_sharding.as_str(),
                    tp_degree, "shard_over_sequence has no effect without replicated kv heads"
                );
            }
            kv_replicas
        } else {
            1
        };

        for bucket in buckets.iter() {
            if seq_shards > 1 {
                ensure!(
                    bucket % seq_shards == 0,
                    "bucket {} is not divisible into {} sequence shards",
                    bucket,
                    seq_shards
                );
            }
            if config.sequence_parallel_norm {
                ensure!(
                    bucket % tp_degree == 0,
                    "sequence_parallel_norm needs bucket {} divisible by tp_degree {}",
                    bucket,
                    tp_degree
                );
            }
        }

        Ok(Self {
            tp_degree,
            n_heads: dims.n_heads,
            n_kv_heads: n_kv,
            head_dim: dims.head_dim(),
            heads_per_core,
            kv_sharding: config.kv_cache_sharding,
            kv_replicas,
            seq_shards,
            sequence_parallel_norm: config.sequence_parallel_norm,
            intermediate_per_core: dims.intermediate_size / tp_degree,
            vocab_size: dims.vocab_size,
            core_kv_heads,
        })
    }

    fn disjoint_kv_heads(n_kv: usize, tp_degree: usize) -> Vec<Vec<usize>> {
        let per_core = n_kv / tp_degree;
        (0..tp_degree)
            .map(|core| (core * per_core..(core + 1) * per_core).collect())
            .collect()
    }

    pub fn q_heads(&self, core: usize) -> Range<usize> {
        core * self.heads_per_core..(core + 1) * self.heads_per_core
    }

    pub fn kv_head_for(&self, q_head: usize) -> usize {
        q_head / (self.n_heads / self.n_kv_heads)
    }

    /// Kv heads whose keys/values `core` computes and caches.
    pub fn kv_heads(&self, core: usize) -> &[usize] {
        &self.core_kv_heads[core]
    }

    /// Cores caching `kv_head`, in replica order.
    pub fn replicas_of(&self, kv_head: usize) -> Vec<usize> {
        (0..self.tp_degree)
            .filter(|&core| self.core_kv_heads[core].contains(&kv_head))
            .collect()
    }

    /// Positions of a `capacity`-long cache held by replica `replica`.
    pub fn sequence_chunk(&self, capacity: usize, replica: usize) -> Range<usize> {
        if self.seq_shards <= 1 {
            return 0..capacity;
        }
        let chunk = capacity.div_ceil(self.seq_shards);
        let start = (replica * chunk).min(capacity);
        start..(start + chunk).min(capacity)
    }

    /// Replica index of `core` among the holders of `kv_head`.
    pub fn replica_index(&self, kv_head: usize, core: usize) -> Option<usize> {
        self.replicas_of(kv_head).iter().position(|&c| c == core)
    }

    pub fn vocab_range(&self, core: usize) -> Range<usize> {
        split_range(self.vocab_size, self.tp_degree, core)
    }

    pub fn intermediate_range(&self, core: usize) -> Range<usize> {
        core * self.intermediate_per_core..(core + 1) * self.intermediate_per_core
    }

    /// Per-core device memory needed to hold the weight shard, a kv cache of
    /// `capacity` positions for `batch` sequences, and activations for
    /// `activation_rows` rows.
    pub fn memory_estimate(
        &self,
        dims: &ModelDims,
        capacity: usize,
        batch: usize,
        activation_rows: usize,
        dtype: DataType,
    ) -> MemoryEstimate {
        let elem = dtype.element_size_bytes() as u64;
        let hidden = dims.hidden_size as u64;
        let hd = self.head_dim as u64;
        let q_cols = (self.heads_per_core * self.head_dim) as u64;
        let kv_cols = self.core_kv_heads.iter().map(Vec::len).max().unwrap_or(0) as u64 * hd;
        let inter = self.intermediate_per_core as u64;
        let mlp_mats = if dims.gated_mlp { 3 } else { 2 };
        let vocab_cols = self.vocab_range(0).len() as u64;

        let per_layer = hidden * q_cols
            + 2 * hidden * kv_cols
            + q_cols * hidden
            + mlp_mats * hidden * inter
            + 2 * hidden;
        let weight_bytes = elem
            * (dims.n_layers as u64 * per_layer
                + dims.vocab_size as u64 * hidden
                + hidden * vocab_cols
                + hidden);

        let cached_positions = if self.seq_shards > 1 {
            capacity.div_ceil(self.seq_shards)
        } else {
            capacity
        } as u64;
        let kv_cache_bytes =
            elem * 2 * dims.n_layers as u64 * batch as u64 * cached_positions * kv_cols;

        let rows = activation_rows as u64;
        let activation_bytes = elem
            * rows
            * (3 * hidden + q_cols + 2 * kv_cols + inter * if dims.gated_mlp { 2 } else { 1 })
            + elem * vocab_cols * rows;

        MemoryEstimate {
            weight_bytes,
            kv_cache_bytes,
            activation_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MemoryEstimate {
    pub weight_bytes: u64,
    pub kv_cache_bytes: u64,
    pub activation_bytes: u64,
}

impl MemoryEstimate {
    pub fn total_bytes(&self) -> u64 {
        self.weight_bytes + self.kv_cache_bytes + self.activation_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(n_heads: usize, n_kv_heads: usize) -> ModelDims {
        ModelDims {
            vocab_size: 1000,
            hidden_size: n_heads * 4,
            n_layers: 2,
            n_heads,
            n_kv_heads,
            intermediate_size: 256,
            norm: NormKind::RmsNorm,
            norm_epsilon: 1e-5,
            activation: ActivationKind::Silu,
            gated_mlp: true,
            rope_theta: 10000.0,
        }
    }

    fn buckets() -> Buckets {
        Buckets::new([64, 128]).unwrap()
    }

    #[test]
    fn split_range_spreads_remainder() {
        assert_eq!(split_range(10, 4, 0), 0..3);
        assert_eq!(split_range(10, 4, 1), 3..6);
        assert_eq!(split_range(10, 4, 2), 6..8);
        assert_eq!(split_range(10, 4, 3), 8..10);
        assert_eq!(split_range(2, 4, 3), 2..2);
    }

    #[test]
    fn shard_over_heads_assigns_disjoint_kv_heads() {
        let layout =
            ShardLayout::new(&dims(8, 4), &AcceleratorConfig::default(), 4, &buckets()).unwrap();
        assert_eq!(layout.heads_per_core, 2);
        assert_eq!(layout.kv_heads(2), &[2]);
        for core in 0..4 {
            for q in layout.q_heads(core) {
                assert!(layout.kv_heads(core).contains(&layout.kv_head_for(q)));
            }
        }
    }

    #[test]
    fn shard_over_heads_rejects_uneven_kv_heads() {
        let err = ShardLayout::new(&dims(8, 2), &AcceleratorConfig::default(), 4, &buckets())
            .unwrap_err();
        assert!(err.to_string().contains("shard_over_heads"));
    }

    #[test]
    fn replicated_heads_groups_cores_per_kv_head() {
        let config =
            AcceleratorConfig::default().with_kv_cache_sharding(KvCacheSharding::ReplicatedHeads);
        let layout = ShardLayout::new(&dims(8, 2), &config, 8, &buckets()).unwrap();
        assert_eq!(layout.kv_replicas, 4);
        assert_eq!(layout.replicas_of(1), vec![4, 5, 6, 7]);
        for core in 0..8 {
            for q in layout.q_heads(core) {
                assert!(layout.kv_heads(core).contains(&layout.kv_head_for(q)));
            }
        }
    }

    #[test]
    fn shard_over_sequence_splits_positions_among_replicas() {
        let config = AcceleratorConfig::long_context();
        let layout = ShardLayout::new(&dims(8, 2), &config, 8, &buckets()).unwrap();
        assert_eq!(layout.seq_shards, 4);
        assert_eq!(layout.sequence_chunk(128, 0), 0..32);
        assert_eq!(layout.sequence_chunk(128, 3), 96..128);
        assert_eq!(layout.replica_index(0, 2), Some(2));
        assert_eq!(layout.replica_index(0, 5), None);
    }

    #[test]
    fn sequence_parallel_norm_needs_divisible_buckets() {
        let config = AcceleratorConfig::default().with_sequence_parallel_norm(true);
        let bad = Buckets::new([60]).unwrap();
        assert!(ShardLayout::new(&dims(8, 8), &config, 8, &bad).is_err());
        assert!(ShardLayout::new(&dims(8, 8), &config, 4, &bad).is_ok());
    }

    #[test]
    fn memory_shrinks_with_wider_groups() {
        let d = dims(8, 8);
        let config = AcceleratorConfig::default();
        let one = ShardLayout::new(&d, &config, 1, &buckets()).unwrap();
        let four = ShardLayout::new(&d, &config, 4, &buckets()).unwrap();
        let m1 = one.memory_estimate(&d, 128, 1, 128, DataType::F32);
        let m4 = four.memory_estimate(&d, 128, 1, 128, DataType::F32);
        assert!(m4.weight_bytes < m1.weight_bytes);
        assert_eq!(m4.kv_cache_bytes * 4, m1.kv_cache_bytes);
    }
}
