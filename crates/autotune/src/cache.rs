//! Tuning results keyed by local matmul shape.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tpforge_kernels::config::{KernelProfile, MatmulProblem};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AutotuneCache {
    matmul: BTreeMap<String, KernelProfile>,
}

impl AutotuneCache {
    pub fn new() -> Self {
        Self {
            matmul: BTreeMap::new(),
        }
    }

    pub fn get_matmul(&self, problem: &MatmulProblem) -> Option<&KernelProfile> {
        self.matmul.get(&problem_key(problem))
    }

    pub fn insert_matmul(&mut self, profile: KernelProfile) {
        let key = problem_key(&profile.problem);
        self.matmul.insert(key, profile);
    }

    pub fn len(&self) -> usize {
        self.matmul.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matmul.is_empty()
    }

    pub fn profiles(&self) -> impl Iterator<Item = &KernelProfile> {
        self.matmul.values()
    }

    /// A missing file is an empty cache.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let cache = serde_json::from_slice(&data)
            .with_context(|| format!("malformed autotune cache {}", path.display()))?;
        Ok(cache)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob)?;
        Ok(())
    }
}

fn problem_key(problem: &MatmulProblem) -> String {
    format!(
        "{}x{}x{}:{}",
        problem.m,
        problem.n,
        problem.k,
        problem.dtype.as_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpforge_kernels::config::DataType;

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("autotune.json");
        let problem = MatmulProblem::new(32, 64, 128, DataType::BF16);

        let mut cache = AutotuneCache::new();
        cache.insert_matmul(KernelProfile::new("blocked", problem, 0.5));
        cache.save_to_file(&path).unwrap();

        let restored = AutotuneCache::load_from_file(&path).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get_matmul(&problem).unwrap().kernel, "blocked");
        let other = MatmulProblem::new(32, 64, 128, DataType::F32);
        assert!(restored.get_matmul(&other).is_none());
    }

    #[test]
    fn missing_file_is_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AutotuneCache::load_from_file(&dir.path().join("absent.json")).unwrap();
        assert!(cache.is_empty());
    }
}
