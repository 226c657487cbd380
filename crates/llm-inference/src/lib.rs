//! Decoder-only language model pieces used by the sharded runtime.
//!
//! - [`config::ModelConfig`]: Hugging Face style model config
//! - [`weights::ModelWeights`]: safetensors checkpoints and per-core shards
//! - [`kv_cache::KvCache`]: per-core cache in BSH or HSB order
//! - [`sampling`]: top-k sampling with seeded streams

pub mod config;
pub mod kv_cache;
pub mod rope;
pub mod sampling;
pub mod weights;

pub use config::ModelConfig;
pub use kv_cache::KvCache;
pub use rope::Rope;
pub use sampling::{top_k_filter, SamplingParams, TopKSampler};
pub use weights::{LayerShard, ModelWeights, QkvWeights, ShardWeights};
