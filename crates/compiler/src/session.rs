//! Model handle: load, compile onto the mesh, sample, persist.
//!
//! A handle starts uninitialized. `compile` builds the shard layout, compiles
//! one context-encoding and one token-generation graph per bucket (unless a
//! compiled artifact directory was loaded first), checks the per-core memory
//! budget and places the weight shards, leaving the handle ready. `save`
//! writes the compiled artifacts; `load` stages artifacts from disk so the
//! next `compile` only places weights.

use crate::metrics::Throughput;
use crate::pipeline::{check_core_memory, CompilerConfig, CompilerPipeline};
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tpforge_artifacts::{CompiledArtifacts, Manifest};
use tpforge_autotune::AutotuneCache;
use tpforge_config::{AcceleratorConfig, LoadOptions};
use tpforge_ir::{ModelDims, ShardLayout};
use tpforge_llm::weights::CONFIG_FILE;
use tpforge_llm::{ModelConfig, ModelWeights, SamplingParams, TopKSampler};
use tpforge_runtime::{place, CoreMemory, Executor, Mesh, PlacementRequest, StepReport};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Uninitialized,
    Ready { persisted: bool },
}

impl HandleState {
    pub fn is_ready(&self) -> bool {
        matches!(self, HandleState::Ready { .. })
    }
}

/// Timing and bucket usage of one `sample` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub prefill_ms: f64,
    pub decode_ms: f64,
    pub tokens_generated: usize,
    pub tokens_per_sec: f64,
    /// Decode throughput over the last few steps.
    pub windowed_tokens_per_sec: f64,
    /// Bucket positions computed for nothing but padding.
    pub padded_positions: usize,
    /// Graph id to number of runs.
    pub bucket_usage: BTreeMap<String, usize>,
}

impl GenerationMetrics {
    fn record(&mut self, report: &StepReport) {
        self.padded_positions += report.padded_rows;
        let id = format!("{}_b{}", report.kind.as_str(), report.bucket);
        *self.bucket_usage.entry(id).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    /// One sequence per prompt, prompt included.
    pub sequences: Vec<Vec<usize>>,
    pub metrics: GenerationMetrics,
}

struct Runtime {
    executor: Executor,
    mesh: Mesh,
}

pub struct ModelHandle {
    model: ModelConfig,
    dims: ModelDims,
    weights: ModelWeights,
    accelerator: AcceleratorConfig,
    options: LoadOptions,
    compiler: CompilerConfig,
    artifacts: Option<CompiledArtifacts>,
    /// The staged artifacts match a directory on disk.
    artifacts_persisted: bool,
    runtime: Option<Runtime>,
    state: HandleState,
}

impl ModelHandle {
    /// Reads `config.json` and the safetensors files of `dir`.
    pub fn from_pretrained(
        dir: &Path,
        accelerator: AcceleratorConfig,
        options: LoadOptions,
    ) -> Result<Self> {
        ensure!(dir.is_dir(), "model directory {} does not exist", dir.display());
        let model = ModelConfig::from_file(&dir.join(CONFIG_FILE))
            .with_context(|| format!("failed to load model config from {}", dir.display()))?;
        let weights = ModelWeights::load_dir(dir, &model)?;
        Self::from_weights(model, weights, accelerator, options)
    }

    pub fn from_weights(
        model: ModelConfig,
        mut weights: ModelWeights,
        accelerator: AcceleratorConfig,
        options: LoadOptions,
    ) -> Result<Self> {
        options.validate()?;
        model.validate()?;
        weights.check_shapes(&model)?;
        ensure!(
            options.buckets.largest() <= model.max_position_embeddings,
            "largest bucket {} exceeds the model's {} positions",
            options.buckets.largest(),
            model.max_position_embeddings
        );
        let dims = model.dims()?;
        weights.round_to(options.precision);

        info!(
            parameters = weights.parameter_count(),
            layers = dims.n_layers,
            tp_degree = options.tp_degree,
            buckets = %options.buckets,
            amp = %options.precision,
            "model loaded"
        );
        Ok(Self {
            model,
            dims,
            weights,
            accelerator,
            options,
            compiler: CompilerConfig::default(),
            artifacts: None,
            artifacts_persisted: false,
            runtime: None,
            state: HandleState::Uninitialized,
        })
    }

    pub fn with_compiler_config(mut self, config: CompilerConfig) -> Self {
        self.compiler = config;
        self
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub fn accelerator(&self) -> &AcceleratorConfig {
        &self.accelerator
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Compiled or loaded artifacts, if any.
    pub fn artifacts(&self) -> Option<&CompiledArtifacts> {
        self.artifacts.as_ref()
    }

    pub fn core_memory(&self) -> Vec<CoreMemory> {
        self.runtime
            .as_ref()
            .map(|rt| rt.mesh.memory())
            .unwrap_or_default()
    }

    fn manifest(&self) -> Manifest {
        Manifest::new(&self.model, &self.accelerator, &self.options)
    }

    /// Completes initialization; a no-op on a ready handle.
    pub fn compile(&mut self) -> Result<()> {
        if self.state.is_ready() {
            debug!("handle already ready; skipping compile");
            return Ok(());
        }
        let start = Instant::now();
        let options = &self.options;
        let layout = ShardLayout::new(
            &self.dims,
            &self.accelerator,
            options.tp_degree,
            &options.buckets,
        )?;
        let estimate = check_core_memory(&layout, &self.dims, options)?;

        let artifacts = match &self.artifacts {
            Some(loaded) => {
                info!(
                    graphs = loaded.graphs.len(),
                    "compiled artifacts present; skipping graph compilation"
                );
                loaded.clone()
            }
            None => {
                let compiler = CompilerConfig {
                    dtype: options.precision,
                    ..self.compiler
                };
                let pipeline = CompilerPipeline::new(&self.accelerator, compiler);
                let output =
                    pipeline.compile(&self.dims, &layout, &options.buckets, AutotuneCache::new())?;
                CompiledArtifacts {
                    manifest: self.manifest(),
                    graphs: output.graphs,
                    autotune: output.autotune,
                }
            }
        };
        artifacts.check_complete()?;

        let mut mesh = Mesh::new(options.tp_degree, options.core_memory_bytes);
        let request = PlacementRequest {
            weights: &self.weights,
            layout: &layout,
            accelerator: &self.accelerator,
            n_layers: self.dims.n_layers,
            capacity: options.buckets.largest(),
            batch_size: options.batch_size,
            dtype: options.precision,
        };
        let cores = place(request, &mut mesh)?;
        let executor = Executor::new(
            self.dims.clone(),
            layout,
            options.buckets.clone(),
            options.precision,
            artifacts.graphs.clone(),
            cores,
        )?;

        let reused = self.artifacts.is_some();
        let persisted = reused && self.artifacts_persisted;
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            estimated_core_bytes = estimate.total_bytes(),
            reused_artifacts = reused,
            persisted,
            "model ready"
        );
        self.artifacts_persisted = persisted;
        self.artifacts = Some(artifacts);
        self.runtime = Some(Runtime { executor, mesh });
        self.state = HandleState::Ready { persisted };
        Ok(())
    }

    /// Writes the compiled artifacts of a ready handle to `dir`.
    pub fn save(&mut self, dir: &Path) -> Result<()> {
        let artifacts = match (&self.state, &self.artifacts) {
            (HandleState::Ready { .. }, Some(artifacts)) => artifacts,
            _ => bail!("save requires a compiled handle; call compile first"),
        };
        artifacts.save_to_dir(dir)?;
        info!(dir = %dir.display(), "compiled artifacts saved");
        self.artifacts_persisted = true;
        self.state = HandleState::Ready { persisted: true };
        Ok(())
    }

    /// Stages compiled artifacts from `dir`; the next `compile` reuses them.
    pub fn load(&mut self, dir: &Path) -> Result<()> {
        ensure!(
            self.state == HandleState::Uninitialized,
            "load requires an uninitialized handle; release it first"
        );
        let artifacts = CompiledArtifacts::load_from_dir(dir)?;
        artifacts
            .manifest
            .ensure_compatible(&self.manifest())
            .with_context(|| format!("cannot load compiled artifacts from {}", dir.display()))?;
        info!(
            dir = %dir.display(),
            options = %artifacts.manifest.options_summary(),
            "compiled artifacts loaded"
        );
        self.artifacts = Some(artifacts);
        self.artifacts_persisted = true;
        Ok(())
    }

    /// Drops the placed shards; compiled artifacts are kept for the next
    /// `compile`.
    pub fn release(&mut self) {
        if let Some(mut runtime) = self.runtime.take() {
            runtime.mesh.release();
            info!("device state released");
        }
        self.state = HandleState::Uninitialized;
    }

    /// Autoregressive sampling; one prompt per batch row.
    pub fn sample(&mut self, prompts: &[Vec<usize>], params: &SamplingParams) -> Result<Generation> {
        params.validate()?;
        let largest = self.options.buckets.largest();
        let vocab = self.model.vocab_size;
        let batch = self.options.batch_size;
        let runtime = match (&self.state, self.runtime.as_mut()) {
            (HandleState::Ready { .. }, Some(runtime)) => runtime,
            _ => bail!("sample requires a compiled handle; call compile first"),
        };
        ensure!(
            prompts.len() == batch,
            "got {} prompts for a handle compiled with batch size {}",
            prompts.len(),
            batch
        );
        ensure!(
            params.max_length <= largest,
            "max_length {} exceeds the largest bucket {}",
            params.max_length,
            largest
        );
        for (row, prompt) in prompts.iter().enumerate() {
            ensure!(!prompt.is_empty(), "prompt {} is empty", row);
            ensure!(
                prompt.len() <= params.max_length,
                "prompt {} has {} tokens, more than max_length {}",
                row,
                prompt.len(),
                params.max_length
            );
            if let Some(&bad) = prompt.iter().find(|&&t| t >= vocab) {
                bail!("prompt {} holds token {} outside the vocabulary of {}", row, bad, vocab);
            }
        }

        let executor = &mut runtime.executor;
        executor.reset_cache();
        let mut metrics = GenerationMetrics::default();
        let mut throughput = Throughput::new(1, 16);
        let mut sequences = Vec::with_capacity(prompts.len());

        for (row, prompt) in prompts.iter().enumerate() {
            let mut sequence = prompt.clone();
            if sequence.len() >= params.max_length {
                sequences.push(sequence);
                continue;
            }
            let mut sampler = TopKSampler::new(params, row);

            let start = Instant::now();
            let (mut logits, report) = executor.prefill(row, prompt)?;
            metrics.prefill_ms += start.elapsed().as_secs_f64() * 1000.0;
            metrics.record(&report);

            let start = Instant::now();
            loop {
                let next = sampler.sample(&logits);
                sequence.push(next);
                metrics.tokens_generated += 1;
                if sequence.len() >= params.max_length || params.eos_token == Some(next) {
                    break;
                }
                let (step_logits, report) = executor.decode(row, next, sequence.len() - 1)?;
                logits = step_logits;
                metrics.record(&report);
                metrics.windowed_tokens_per_sec = throughput.step();
            }
            metrics.decode_ms += start.elapsed().as_secs_f64() * 1000.0;
            sequences.push(sequence);
        }

        let total_ms = metrics.prefill_ms + metrics.decode_ms;
        if total_ms > 0.0 {
            metrics.tokens_per_sec = metrics.tokens_generated as f64 * 1000.0 / total_ms;
        }
        debug!(
            generated = metrics.tokens_generated,
            padded = metrics.padded_positions,
            "sampling finished"
        );
        Ok(Generation { sequences, metrics })
    }
}
