//! Puts weight shards and kv caches on the cores.

use crate::mesh::Mesh;
use anyhow::{ensure, Result};
use rayon::prelude::*;
use tpforge_config::AcceleratorConfig;
use tpforge_ir::ShardLayout;
use tpforge_kernels::config::DataType;
use tpforge_llm::{KvCache, ModelWeights, ShardWeights};
use tracing::info;

/// What one core holds once placement is done.
#[derive(Debug, Clone)]
pub struct CoreState {
    pub weights: ShardWeights,
    pub cache: KvCache,
}

#[derive(Debug, Clone, Copy)]
pub struct PlacementRequest<'a> {
    pub weights: &'a ModelWeights,
    pub layout: &'a ShardLayout,
    pub accelerator: &'a AcceleratorConfig,
    pub n_layers: usize,
    /// Cached positions per sequence; the largest bucket.
    pub capacity: usize,
    pub batch_size: usize,
    pub dtype: DataType,
}

pub fn place(request: PlacementRequest<'_>, mesh: &mut Mesh) -> Result<Vec<CoreState>> {
    let tp = request.layout.tp_degree;
    ensure!(
        mesh.tp_degree() == tp,
        "mesh has {} cores, layout expects {}",
        mesh.tp_degree(),
        tp
    );

    let cores = (0..tp)
        .into_par_iter()
        .map(|core| {
            let fuse_qkv = request.accelerator.fuse_qkv;
            let weights = request.weights.shard(request.layout, core, fuse_qkv)?;
            let cache = KvCache::for_core(
                request.layout,
                request.accelerator.attention_layout,
                core,
                request.n_layers,
                request.capacity,
                request.batch_size,
            );
            Ok(CoreState { weights, cache })
        })
        .collect::<Result<Vec<_>>>()?;

    let element = request.dtype.element_size_bytes();
    for (index, state) in cores.iter().enumerate() {
        if let Some(core) = mesh.core_mut(index) {
            core.allocate("weights", state.weights.num_bytes(request.dtype))?;
            core.allocate("kv cache", state.cache.num_bytes(element))?;
        }
    }

    let peak = mesh
        .memory()
        .iter()
        .map(|m| m.allocated_bytes)
        .max()
        .unwrap_or(0);
    info!(
        tp_degree = tp,
        capacity = request.capacity,
        batch = request.batch_size,
        peak_core_bytes = peak,
        "placed shards"
    );
    Ok(cores)
}
