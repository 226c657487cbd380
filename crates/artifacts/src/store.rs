//! Reading and writing a compiled artifact directory.
//!
//! ```text
//! <dir>/manifest.json
//! <dir>/graph-ctx-b{bucket}.json
//! <dir>/graph-tkg-b{bucket}.json
//! <dir>/autotune.json
//! ```

use crate::manifest::Manifest;
use anyhow::{ensure, Context, Result};
use std::fs;
use std::path::Path;
use tpforge_autotune::AutotuneCache;
use tpforge_ir::{GraphKind, LoweredGraph};
use tracing::info;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const AUTOTUNE_FILE: &str = "autotune.json";

pub fn graph_file_name(kind: GraphKind, bucket: usize) -> String {
    format!("graph-{}-b{}.json", kind.as_str(), bucket)
}

#[derive(Debug, Clone)]
pub struct CompiledArtifacts {
    pub manifest: Manifest,
    pub graphs: Vec<LoweredGraph>,
    pub autotune: AutotuneCache,
}

impl CompiledArtifacts {
    pub fn graph(&self, kind: GraphKind, bucket: usize) -> Option<&LoweredGraph> {
        self.graphs
            .iter()
            .find(|graph| graph.kind == kind && graph.bucket == bucket)
    }

    /// Every bucket of the manifest needs both graph kinds.
    pub fn check_complete(&self) -> Result<()> {
        for bucket in self.manifest.buckets.iter() {
            for kind in [GraphKind::ContextEncoding, GraphKind::TokenGeneration] {
                ensure!(
                    self.graph(kind, bucket).is_some(),
                    "missing {} graph for bucket {}",
                    kind.as_str(),
                    bucket
                );
            }
        }
        Ok(())
    }

    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        self.check_complete()?;
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create artifact dir {}", dir.display()))?;

        write_json(&dir.join(MANIFEST_FILE), &self.manifest)?;
        for graph in &self.graphs {
            write_json(&dir.join(graph_file_name(graph.kind, graph.bucket)), graph)?;
        }
        self.autotune.save_to_file(&dir.join(AUTOTUNE_FILE))?;

        info!(
            dir = %dir.display(),
            graphs = self.graphs.len(),
            summary = %self.manifest.options_summary(),
            "saved compiled artifacts"
        );
        Ok(())
    }

    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        ensure!(
            dir.is_dir(),
            "artifact directory {} does not exist",
            dir.display()
        );
        let manifest: Manifest = read_json(&dir.join(MANIFEST_FILE))?;

        let mut graphs = Vec::with_capacity(manifest.buckets.len() * 2);
        for bucket in manifest.buckets.iter() {
            for kind in [GraphKind::ContextEncoding, GraphKind::TokenGeneration] {
                let graph: LoweredGraph = read_json(&dir.join(graph_file_name(kind, bucket)))?;
                ensure!(
                    graph.kind == kind
                        && graph.bucket == bucket
                        && graph.tp_degree == manifest.tp_degree,
                    "graph file for {} bucket {} describes {} (tp {})",
                    kind.as_str(),
                    bucket,
                    graph.id(),
                    graph.tp_degree
                );
                graphs.push(graph);
            }
        }
        let autotune = AutotuneCache::load_from_file(&dir.join(AUTOTUNE_FILE))?;

        info!(dir = %dir.display(), summary = %manifest.options_summary(), "loaded compiled artifacts");
        Ok(Self {
            manifest,
            graphs,
            autotune,
        })
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let blob = serde_json::to_vec_pretty(value)?;
    fs::write(path, blob).with_context(|| format!("failed to write {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("malformed artifact file {}", path.display()))
}
