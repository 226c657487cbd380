//! Configuration assembly for tensor-parallel model loading.
//!
//! - [`accelerator::AcceleratorConfig`]: attention layout, kv-cache sharding,
//!   fusion and sequence-parallel switches
//! - [`options::LoadOptions`]: buckets, tensor-parallel degree, precision,
//!   batch size and per-core memory budget

pub mod accelerator;
pub mod options;

pub use accelerator::{AcceleratorConfig, AttentionLayout, KvCacheSharding};
pub use options::{Buckets, LoadOptions, DEFAULT_CORE_MEMORY_BYTES};
pub use tpforge_kernels::config::DataType;
