//! Bucketed tensor-parallel compile, sampling and artifact persistence for
//! decoder-only language models.
//!
//! The workflow is: assemble an [`AcceleratorConfig`] and [`LoadOptions`],
//! create a [`ModelHandle`], `compile` it (or `load` saved artifacts first),
//! then `sample`:
//!
//! ```no_run
//! use std::path::Path;
//! use tpforge::{AcceleratorConfig, Buckets, DataType, LoadOptions, ModelHandle, SamplingParams};
//!
//! # fn main() -> anyhow::Result<()> {
//! let buckets = Buckets::new([2048, 4096, 8192, 16384, 32768, 65536])?;
//! let options = LoadOptions::new(buckets, 32, DataType::BF16);
//! let mut handle =
//!     ModelHandle::from_pretrained(Path::new("llama-2-7b"), AcceleratorConfig::long_context(), options)?;
//! handle.compile()?;
//! handle.save(Path::new("llama-2-7b-compiled"))?;
//! let out = handle.sample(&[vec![1, 450, 4996]], &SamplingParams::new(65536, 10))?;
//! # let _ = out;
//! # Ok(())
//! # }
//! ```

pub use tpforge_compiler::{
    CompilerConfig, EvaluationReport, EvaluationSuite, Generation, GenerationMetrics, HandleState, Metric,
    MetricsFile, ModelHandle, Throughput,
};
pub use tpforge_config::{
    AcceleratorConfig, AttentionLayout, Buckets, DataType, KvCacheSharding, LoadOptions,
};
pub use tpforge_llm::{ModelConfig, ModelWeights, SamplingParams};
