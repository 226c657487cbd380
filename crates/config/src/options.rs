//! Model loading options: tensor-parallel degree, precompiled length
//! buckets and numeric precision.

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tpforge_kernels::config::DataType;

/// 16 GiB of device memory per core.
pub const DEFAULT_CORE_MEMORY_BYTES: u64 = 16 * 1024 * 1024 * 1024;

/// Ascending set of sequence lengths for which a graph is compiled ahead of
/// time. A request is dispatched to the smallest bucket that fits it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct Buckets(Vec<usize>);

impl Buckets {
    /// Sorts and deduplicates; rejects an empty set or a zero length.
    pub fn new(lengths: impl IntoIterator<Item = usize>) -> Result<Self> {
        let mut lengths: Vec<usize> = lengths.into_iter().collect();
        ensure!(!lengths.is_empty(), "at least one bucket length is required");
        ensure!(
            lengths.iter().all(|&len| len > 0),
            "bucket lengths must be positive, got {:?}",
            lengths
        );
        lengths.sort_unstable();
        lengths.dedup();
        Ok(Self(lengths))
    }

    /// Powers of two from 128 up to `max_len`, with `max_len` itself as the
    /// last bucket.
    pub fn power_of_two_up_to(max_len: usize) -> Result<Self> {
        ensure!(max_len > 0, "maximum bucket length must be positive");
        let mut lengths = Vec::new();
        let mut len = 128usize;
        while len < max_len {
            lengths.push(len);
            len *= 2;
        }
        lengths.push(max_len);
        Self::new(lengths)
    }

    pub fn lengths(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn largest(&self) -> usize {
        self.0.last().copied().unwrap_or(0)
    }

    /// Smallest bucket that can hold `len` positions.
    pub fn select(&self, len: usize) -> Option<usize> {
        self.0.iter().copied().find(|&bucket| bucket >= len)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }
}

impl TryFrom<Vec<usize>> for Buckets {
    type Error = anyhow::Error;

    fn try_from(value: Vec<usize>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Buckets> for Vec<usize> {
    fn from(value: Buckets) -> Self {
        value.0
    }
}

impl fmt::Display for Buckets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|len| len.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "[{}]", joined)
    }
}

impl std::str::FromStr for Buckets {
    type Err = anyhow::Error;

    /// Parses `"2048,4096,8192"` (brackets optional).
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('[').trim_end_matches(']');
        let mut lengths = Vec::new();
        for part in trimmed.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.parse::<usize>() {
                Ok(len) => lengths.push(len),
                Err(_) => bail!("invalid bucket length '{}'", part),
            }
        }
        Self::new(lengths)
    }
}

/// Parameters the loader needs besides the configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadOptions {
    pub buckets: Buckets,
    pub tp_degree: usize,
    #[serde(rename = "amp")]
    pub precision: DataType,
    pub batch_size: usize,
    pub core_memory_bytes: u64,
}

impl LoadOptions {
    pub fn new(buckets: Buckets, tp_degree: usize, precision: DataType) -> Self {
        Self {
            buckets,
            tp_degree,
            precision,
            batch_size: 1,
            core_memory_bytes: DEFAULT_CORE_MEMORY_BYTES,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_core_memory_bytes(mut self, bytes: u64) -> Self {
        self.core_memory_bytes = bytes;
        self
    }

    /// Range checks only. Whether the degree suits a given model is decided
    /// by the loader.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.tp_degree >= 1, "tp_degree must be at least 1");
        ensure!(self.batch_size >= 1, "batch_size must be at least 1");
        ensure!(
            self.core_memory_bytes > 0,
            "core memory budget must be positive"
        );
        ensure!(!self.buckets.is_empty(), "at least one bucket is required");
        Ok(())
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
    fn buckets_are_sorted_and_deduplicated() {
        let buckets = Buckets::new([4096, 2048, 4096, 8192]).unwrap();
        assert_eq!(buckets.lengths(), &[2048, 4096, 8192]);
        assert_eq!(buckets.largest(), 8192);
    }

    #[test]
    fn bucket_selection_picks_smallest_fit() {
        let buckets = Buckets::new([2048, 4096, 8192, 16384, 32768, 65536]).unwrap();
        assert_eq!(buckets.select(1), Some(2048));
        assert_eq!(buckets.select(2048), Some(2048));
        assert_eq!(buckets.select(2049), Some(4096));
        assert_eq!(buckets.select(56_000), Some(65536));
        assert_eq!(buckets.select(65537), None);
    }

    #[test]
    fn invalid_bucket_sets_are_rejected() {
        assert!(Buckets::new(Vec::<usize>::new()).is_err());
        assert!(Buckets::new([0, 128]).is_err());
        assert!("128,abc".parse::<Buckets>().is_err());
        assert!(serde_json::from_str::<Buckets>("[]").is_err());
    }

    #[test]
    fn buckets_parse_from_cli_string() {
        let buckets: Buckets = "[2048, 4096,8192]".parse().unwrap();
        assert_eq!(buckets.lengths(), &[2048, 4096, 8192]);
        assert_eq!(buckets.to_string(), "[2048,4096,8192]");
    }

    #[test]
    fn power_of_two_buckets_end_at_max() {
        let buckets = Buckets::power_of_two_up_to(1000).unwrap();
        assert_eq!(buckets.lengths(), &[128, 256, 512, 1000]);
    }

    #[test]
    fn options_serialize_precision_as_amp() {
        let options = LoadOptions::new(Buckets::new([128]).unwrap(), 2, DataType::BF16);
        let json = options.to_json().unwrap();
        assert!(json.contains("\"amp\": \"bf16\""));
        assert_eq!(LoadOptions::from_json(&json).unwrap(), options);
    }

    #[test]
    fn zero_degree_fails_validation() {
        let mut options = LoadOptions::new(Buckets::new([128]).unwrap(), 0, DataType::F32);
        assert!(options.validate().is_err());
        options.tp_degree = 8;
        assert!(options.validate().is_ok());
        options.batch_size = 0;
        assert!(options.validate().is_err());
    }
}
