//! Accelerator execution options.
//!
//! These are the switches that decide how a decoder is laid out across the
//! cores of a tensor-parallel group. None of them change the math; they
//! change where tensors live and which collectives move them.

use serde::{Deserialize, Serialize};

/// Physical axis order of the KV cache buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AttentionLayout {
    /// (batch, sequence, hidden): heads are contiguous per position.
    #[default]
    #[serde(rename = "BSH")]
    Bsh,
    /// (head, sequence, batch): positions are contiguous per head.
    #[serde(rename = "HSB")]
    Hsb,
}

impl AttentionLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionLayout::Bsh => "BSH",
            AttentionLayout::Hsb => "HSB",
        }
    }
}

/// How key/value heads are distributed over the cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KvCacheSharding {
    /// Each core owns a disjoint slice of kv heads.
    #[default]
    ShardOverHeads,
    /// With fewer kv heads than cores, each kv head lives on several cores.
    ReplicatedHeads,
    /// Every core caches every kv head.
    AllGatherHeads,
}

impl KvCacheSharding {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvCacheSharding::ShardOverHeads => "shard_over_heads",
            KvCacheSharding::ReplicatedHeads => "replicated_heads",
            KvCacheSharding::AllGatherHeads => "all_gather_heads",
        }
    }
}

/// Configuration record consumed by the model loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AcceleratorConfig {
    pub attention_layout: AttentionLayout,
    /// Fuse the Q, K and V projections into a single matmul.
    pub fuse_qkv: bool,
    pub kv_cache_sharding: KvCacheSharding,
    /// Run residual + norm on a per-core sequence chunk between a
    /// reduce-scatter and an all-gather.
    pub sequence_parallel_norm: bool,
    /// Split cached positions of a replicated kv head across its replicas.
    pub shard_over_sequence: bool,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            attention_layout: AttentionLayout::Bsh,
            fuse_qkv: false,
            kv_cache_sharding: KvCacheSharding::ShardOverHeads,
            sequence_parallel_norm: false,
            shard_over_sequence: false,
        }
    }
}

impl AcceleratorConfig {
    /// Setup used for long-context sampling on a wide tensor-parallel group.
    pub fn long_context() -> Self {
        Self {
            attention_layout: AttentionLayout::Bsh,
            fuse_qkv: true,
            kv_cache_sharding: KvCacheSharding::ReplicatedHeads,
            sequence_parallel_norm: true,
            shard_over_sequence: true,
        }
    }

    pub fn with_attention_layout(mut self, layout: AttentionLayout) -> Self {
        self.attention_layout = layout;
        self
    }

    pub fn with_fuse_qkv(mut self, enabled: bool) -> Self {
        self.fuse_qkv = enabled;
        self
    }

    pub fn with_kv_cache_sharding(mut self, sharding: KvCacheSharding) -> Self {
        self.kv_cache_sharding = sharding;
        self
    }

    pub fn with_sequence_parallel_norm(mut self, enabled: bool) -> Self {
        self.sequence_parallel_norm = enabled;
        self
    }

    pub fn with_shard_over_sequence(mut self, enabled: bool) -> Self {
        self.shard_over_sequence = enabled;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_plain_head_sharding() {
        let config = AcceleratorConfig::default();
        assert_eq!(config.attention_layout, AttentionLayout::Bsh);
        assert_eq!(config.kv_cache_sharding, KvCacheSharding::ShardOverHeads);
        assert!(!config.fuse_qkv);
    }

    #[test]
    fn layout_uses_upper_case_names_on_the_wire() {
        let json = serde_json::to_string(&AttentionLayout::Hsb).unwrap();
        assert_eq!(json, "\"HSB\"");
        let parsed: AttentionLayout = serde_json::from_str("\"BSH\"").unwrap();
        assert_eq!(parsed, AttentionLayout::Bsh);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = AcceleratorConfig::long_context().with_attention_layout(AttentionLayout::Hsb);
        let parsed = AcceleratorConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn unknown_sharding_mode_is_rejected() {
        let json = r#"{
            "attention_layout": "BSH",
            "fuse_qkv": true,
            "kv_cache_sharding": "shard_over_batch",
            "sequence_parallel_norm": false,
            "shard_over_sequence": false
        }"#;
        assert!(AcceleratorConfig::from_json(json).is_err());
    }
}
