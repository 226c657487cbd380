//! Processing cores of a tensor-parallel group and their memory budgets.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Core {
    pub id: usize,
    budget_bytes: u64,
    allocations: Vec<(String, u64)>,
}

impl Core {
    pub fn new(id: usize, budget_bytes: u64) -> Self {
        Self {
            id,
            budget_bytes,
            allocations: Vec::new(),
        }
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocations.iter().map(|(_, bytes)| bytes).sum()
    }

    pub fn free_bytes(&self) -> u64 {
        self.budget_bytes.saturating_sub(self.allocated_bytes())
    }

    pub fn allocate(&mut self, label: &str, bytes: u64) -> Result<()> {
        ensure!(
            bytes <= self.free_bytes(),
            "core {} out of memory: {} needs {} bytes, {} of {} free",
            self.id,
            label,
            bytes,
            self.free_bytes(),
            self.budget_bytes
        );
        self.allocations.push((label.to_string(), bytes));
        debug!(core = self.id, label, bytes, "allocated device memory");
        Ok(())
    }

    pub fn release(&mut self) {
        self.allocations.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreMemory {
    pub core: usize,
    pub allocated_bytes: u64,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Mesh {
    cores: Vec<Core>,
}

impl Mesh {
    pub fn new(tp_degree: usize, budget_bytes: u64) -> Self {
        Self {
            cores: (0..tp_degree).map(|id| Core::new(id, budget_bytes)).collect(),
        }
    }

    pub fn tp_degree(&self) -> usize {
        self.cores.len()
    }

    pub fn core_mut(&mut self, id: usize) -> Option<&mut Core> {
        self.cores.get_mut(id)
    }

    pub fn memory(&self) -> Vec<CoreMemory> {
        self.cores
            .iter()
            .map(|core| CoreMemory {
                core: core.id,
                allocated_bytes: core.allocated_bytes(),
                budget_bytes: core.budget_bytes,
            })
            .collect()
    }

    pub fn release(&mut self) {
        self.cores.iter_mut().for_each(Core::release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_beyond_budget_fails() {
        let mut mesh = Mesh::new(2, 100);
        let core = mesh.core_mut(1).unwrap();
        core.allocate("weights", 60).unwrap();
        let err = core.allocate("kv cache", 50).unwrap_err();
        assert!(err.to_string().contains("core 1 out of memory"));
        assert_eq!(mesh.memory()[1].allocated_bytes, 60);
        mesh.release();
        assert_eq!(mesh.memory()[1].allocated_bytes, 0);
    }
}
