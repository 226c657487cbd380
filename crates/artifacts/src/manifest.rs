//! Description of what a compiled artifact directory was built for.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tpforge_config::{AcceleratorConfig, Buckets, LoadOptions};
use tpforge_kernels::config::DataType;
use tpforge_llm::ModelConfig;

/// Bumped whenever the graph or manifest encoding changes.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub crate_version: String,
    pub created_unix_ms: u64,
    pub model: ModelConfig,
    pub accelerator: AcceleratorConfig,
    pub tp_degree: usize,
    pub buckets: Buckets,
    #[serde(rename = "amp")]
    pub precision: DataType,
    pub batch_size: usize,
}

impl Manifest {
    pub fn new(model: &ModelConfig, accelerator: &AcceleratorConfig, options: &LoadOptions) -> Self {
        let created_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            format_version: FORMAT_VERSION,
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            created_unix_ms,
            model: model.clone(),
            accelerator: accelerator.clone(),
            tp_degree: options.tp_degree,
            buckets: options.buckets.clone(),
            precision: options.precision,
            batch_size: options.batch_size,
        }
    }

    /// Rejects artifacts built for a different group, bucket set,
    /// precision, batch, model or accelerator configuration.
    pub fn ensure_compatible(&self, expected: &Manifest) -> Result<()> {
        ensure!(
            self.format_version == FORMAT_VERSION,
            "artifact format version {} is not supported (expected {})",
            self.format_version,
            FORMAT_VERSION
        );
        ensure!(
            self.tp_degree == expected.tp_degree,
            "artifacts were compiled for tp_degree {}, handle uses {}",
            self.tp_degree,
            expected.tp_degree
        );
        ensure!(
            self.buckets == expected.buckets,
            "artifacts were compiled for buckets {}, handle uses {}",
            self.buckets,
            expected.buckets
        );
        ensure!(
            self.precision == expected.precision,
            "artifacts were compiled for {} precision, handle uses {}",
            self.precision,
            expected.precision
        );
        ensure!(
            self.batch_size == expected.batch_size,
            "artifacts were compiled for batch size {}, handle uses {}",
            self.batch_size,
            expected.batch_size
        );
        ensure!(
            self.model == expected.model,
            "artifacts were compiled for a different model configuration"
        );
        ensure!(
            self.accelerator == expected.accelerator,
            "artifacts were compiled with accelerator config {:?}, handle uses {:?}",
            self.accelerator,
            expected.accelerator
        );
        Ok(())
    }

    pub fn options_summary(&self) -> String {
        format!(
            "tp={} buckets={} amp={} batch={}",
            self.tp_degree, self.buckets, self.precision, self.batch_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(tp: usize) -> Manifest {
        let options = LoadOptions::new(Buckets::new([64, 128]).unwrap(), tp, DataType::BF16);
        Manifest::new(&ModelConfig::tiny(), &AcceleratorConfig::default(), &options)
    }

    #[test]
    fn identical_setup_is_compatible() {
        manifest(4).ensure_compatible(&manifest(4)).unwrap();
    }

    #[test]
    fn tp_mismatch_is_rejected() {
        let err = manifest(4).ensure_compatible(&manifest(2)).unwrap_err();
        assert!(err.to_string().contains("tp_degree 4"));
    }

    #[test]
    fn future_format_is_rejected() {
        let mut stored = manifest(1);
        stored.format_version = FORMAT_VERSION + 1;
        assert!(stored.ensure_compatible(&manifest(1)).is_err());
    }

    #[test]
    fn accelerator_mismatch_is_rejected() {
        let mut stored = manifest(1);
        stored.accelerator = AcceleratorConfig::default().with_fuse_qkv(true);
        let err = stored.ensure_compatible(&manifest(1)).unwrap_err();
        assert!(err.to_string().contains("accelerator config"));
    }
}
