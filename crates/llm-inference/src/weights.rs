//! Full model weights, safetensors I/O and per-core sharding.
//!
//! Projections are stored `(in, out)` so activations multiply on the left.
//! Checkpoints on disk use the Hugging Face llama names and `(out, in)`
//! layout; loading and saving transpose.

use crate::config::ModelConfig;
use anyhow::{bail, ensure, Context, Result};
use half::{bf16, f16};
use ndarray::{concatenate, s, Array1, Array2, ArrayD, Axis, Ix1, Ix2};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::fs;
use std::path::{Path, PathBuf};
use tpforge_ir::ShardLayout;
use tpforge_kernels::config::DataType;
use tracing::{debug, info};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub attn_norm: Array1<f32>,
    pub q_proj: Array2<f32>,
    pub k_proj: Array2<f32>,
    pub v_proj: Array2<f32>,
    pub o_proj: Array2<f32>,
    pub mlp_norm: Array1<f32>,
    pub gate_proj: Array2<f32>,
    pub up_proj: Array2<f32>,
    pub down_proj: Array2<f32>,
}

#[derive(Debug, Clone)]
pub struct ModelWeights {
    /// (vocab_size, hidden_size)
    pub embed_tokens: Array2<f32>,
    pub layers: Vec<LayerWeights>,
    pub final_norm: Array1<f32>,
    /// (hidden_size, vocab_size)
    pub lm_head: Array2<f32>,
}

impl ModelWeights {
    /// Seeded uniform initialization scaled by fan-in.
    pub fn random(config: &ModelConfig, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut matrix = |rows: usize, cols: usize| {
            let bound = 1.0 / (rows as f32).sqrt();
            Array2::from_shape_simple_fn((rows, cols), || (rng.f32() * 2.0 - 1.0) * bound)
        };

        let hidden = config.hidden_size;
        let q_cols = config.num_attention_heads * config.head_dim();
        let kv_cols = config.kv_heads() * config.head_dim();
        let inter = config.intermediate_size;

        let embed_tokens = matrix(config.vocab_size, hidden) * (hidden as f32).sqrt();
        let layers = (0..config.num_hidden_layers)
            .map(|_| LayerWeights {
                attn_norm: Array1::ones(hidden),
                q_proj: matrix(hidden, q_cols),
                k_proj: matrix(hidden, kv_cols),
                v_proj: matrix(hidden, kv_cols),
                o_proj: matrix(q_cols, hidden),
                mlp_norm: Array1::ones(hidden),
                gate_proj: matrix(hidden, inter),
                up_proj: matrix(hidden, inter),
                down_proj: matrix(inter, hidden),
            })
            .collect();
        let lm_head = matrix(hidden, config.vocab_size) * 4.0;

        Self {
            embed_tokens,
            layers,
            final_norm: Array1::ones(hidden),
            lm_head,
        }
    }

    pub fn check_shapes(&self, config: &ModelConfig) -> Result<()> {
        let hidden = config.hidden_size;
        let q_cols = config.num_attention_heads * config.head_dim();
        let kv_cols = config.kv_heads() * config.head_dim();
        let inter = config.intermediate_size;

        ensure!(
            self.embed_tokens.dim() == (config.vocab_size, hidden),
            "embedding is {:?}, expected ({}, {})",
            self.embed_tokens.dim(),
            config.vocab_size,
            hidden
        );
        ensure!(
            self.lm_head.dim() == (hidden, config.vocab_size),
            "lm_head is {:?}, expected ({}, {})",
            self.lm_head.dim(),
            hidden,
            config.vocab_size
        );
        ensure!(self.final_norm.len() == hidden, "final norm has wrong width");
        ensure!(
            self.layers.len() == config.num_hidden_layers,
            "checkpoint has {} layers, config says {}",
            self.layers.len(),
            config.num_hidden_layers
        );
        for (index, layer) in self.layers.iter().enumerate() {
            let expected = [
                ("q_proj", layer.q_proj.dim(), (hidden, q_cols)),
                ("k_proj", layer.k_proj.dim(), (hidden, kv_cols)),
                ("v_proj", layer.v_proj.dim(), (hidden, kv_cols)),
                ("o_proj", layer.o_proj.dim(), (q_cols, hidden)),
                ("gate_proj", layer.gate_proj.dim(), (hidden, inter)),
                ("up_proj", layer.up_proj.dim(), (hidden, inter)),
                ("down_proj", layer.down_proj.dim(), (inter, hidden)),
            ];
            for (name, actual, wanted) in expected {
                ensure!(
                    actual == wanted,
                    "layer {} {} is {:?}, expected {:?}",
                    index,
                    name,
                    actual,
                    wanted
                );
            }
            ensure!(
                layer.attn_norm.len() == hidden && layer.mlp_norm.len() == hidden,
                "layer {} norm weights have wrong width",
                index
            );
        }
        Ok(())
    }

    /// Round every parameter through `dtype`.
    pub fn round_to(&mut self, dtype: DataType) {
        dtype.round_inplace(&mut self.embed_tokens);
        dtype.round_inplace(&mut self.final_norm);
        dtype.round_inplace(&mut self.lm_head);
        for layer in self.layers.iter_mut() {
            dtype.round_inplace(&mut layer.attn_norm);
            dtype.round_inplace(&mut layer.q_proj);
            dtype.round_inplace(&mut layer.k_proj);
            dtype.round_inplace(&mut layer.v_proj);
            dtype.round_inplace(&mut layer.o_proj);
            dtype.round_inplace(&mut layer.mlp_norm);
            dtype.round_inplace(&mut layer.gate_proj);
            dtype.round_inplace(&mut layer.up_proj);
            dtype.round_inplace(&mut layer.down_proj);
        }
    }

    pub fn parameter_count(&self) -> usize {
        let per_layer: usize = self
            .layers
            .iter()
            .map(|l| {
                l.attn_norm.len()
                    + l.q_proj.len()
                    + l.k_proj.len()
                    + l.v_proj.len()
                    + l.o_proj.len()
                    + l.mlp_norm.len()
                    + l.gate_proj.len()
                    + l.up_proj.len()
                    + l.down_proj.len()
            })
            .sum();
        self.embed_tokens.len() + per_layer + self.final_norm.len() + self.lm_head.len()
    }

    /// Reads every `*.safetensors` file in `dir`.
    pub fn load_dir(dir: &Path, config: &ModelConfig) -> Result<Self> {
        let files = safetensors_files(dir)?;
        let buffers = files
            .iter()
            .map(|path| fs::read(path).with_context(|| format!("failed to read {}", path.display())))
            .collect::<Result<Vec<_>>>()?;
        let archives = buffers
            .iter()
            .zip(&files)
            .map(|(data, path)| {
                SafeTensors::deserialize(data)
                    .with_context(|| format!("failed to parse {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        let store = TensorStore { archives };

        let linear = |name: &str| -> Result<Array2<f32>> {
            let hf = store.matrix(name)?;
            Ok(hf.reversed_axes().as_standard_layout().into_owned())
        };

        let embed_tokens = store.matrix("model.embed_tokens.weight")?;
        let lm_head = if store.contains("lm_head.weight") {
            linear("lm_head.weight")?
        } else if config.tie_word_embeddings {
            embed_tokens.t().as_standard_layout().into_owned()
        } else {
            bail!("checkpoint has no lm_head.weight and embeddings are not tied");
        };

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let p = format!("model.layers.{}", i);
            layers.push(LayerWeights {
                attn_norm: store.vector(&format!("{}.input_layernorm.weight", p))?,
                q_proj: linear(&format!("{}.self_attn.q_proj.weight", p))?,
                k_proj: linear(&format!("{}.self_attn.k_proj.weight", p))?,
                v_proj: linear(&format!("{}.self_attn.v_proj.weight", p))?,
                o_proj: linear(&format!("{}.self_attn.o_proj.weight", p))?,
                mlp_norm: store.vector(&format!("{}.post_attention_layernorm.weight", p))?,
                gate_proj: linear(&format!("{}.mlp.gate_proj.weight", p))?,
                up_proj: linear(&format!("{}.mlp.up_proj.weight", p))?,
                down_proj: linear(&format!("{}.mlp.down_proj.weight", p))?,
            });
        }

        let weights = Self {
            embed_tokens,
            layers,
            final_norm: store.vector("model.norm.weight")?,
            lm_head,
        };
        weights.check_shapes(config)?;
        info!(
            dir = %dir.display(),
            files = files.len(),
            parameters = weights.parameter_count(),
            "loaded checkpoint"
        );
        Ok(weights)
    }

    /// Writes `config.json` and a single f32 `model.safetensors`.
    pub fn save_dir(&self, dir: &Path, config: &ModelConfig) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        config.save(&dir.join(CONFIG_FILE))?;

        let mut tensors: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        let mut matrix = |name: String, array: &Array2<f32>, transpose: bool| {
            let array = if transpose {
                array.t().as_standard_layout().into_owned()
            } else {
                array.as_standard_layout().into_owned()
            };
            tensors.push((name, array.shape().to_vec(), f32_bytes(array.iter())));
        };
        matrix("model.embed_tokens.weight".to_string(), &self.embed_tokens, false);
        matrix("lm_head.weight".to_string(), &self.lm_head, true);
        for (i, layer) in self.layers.iter().enumerate() {
            let p = format!("model.layers.{}", i);
            matrix(format!("{}.self_attn.q_proj.weight", p), &layer.q_proj, true);
            matrix(format!("{}.self_attn.k_proj.weight", p), &layer.k_proj, true);
            matrix(format!("{}.self_attn.v_proj.weight", p), &layer.v_proj, true);
            matrix(format!("{}.self_attn.o_proj.weight", p), &layer.o_proj, true);
            matrix(format!("{}.mlp.gate_proj.weight", p), &layer.gate_proj, true);
            matrix(format!("{}.mlp.up_proj.weight", p), &layer.up_proj, true);
            matrix(format!("{}.mlp.down_proj.weight", p), &layer.down_proj, true);
        }
        let mut vector = |name: String, array: &Array1<f32>| {
            tensors.push((name, vec![array.len()], f32_bytes(array.iter())));
        };
        vector("model.norm.weight".to_string(), &self.final_norm);
        for (i, layer) in self.layers.iter().enumerate() {
            let p = format!("model.layers.{}", i);
            vector(format!("{}.input_layernorm.weight", p), &layer.attn_norm);
            vector(format!("{}.post_attention_layernorm.weight", p), &layer.mlp_norm);
        }

        let views = tensors
            .iter()
            .map(|(name, shape, data)| {
                TensorView::new(Dtype::F32, shape.clone(), data)
                    .map(|view| (name.clone(), view))
                    .with_context(|| format!("invalid tensor {}", name))
            })
            .collect::<Result<Vec<_>>>()?;
        let path = dir.join(WEIGHTS_FILE);
        safetensors::serialize_to_file(views, &None, &path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), tensors = tensors.len(), "wrote checkpoint");
        Ok(())
    }

    /// Slice out what `core` holds under `layout`.
    pub fn shard(&self, layout: &ShardLayout, core: usize, fuse_qkv: bool) -> Result<ShardWeights> {
        ensure!(
            core < layout.tp_degree,
            "core {} outside tensor-parallel group of {}",
            core,
            layout.tp_degree
        );
        let hd = layout.head_dim;
        let q_cols = layout.q_heads(core);
        let q_range = q_cols.start * hd..q_cols.end * hd;
        let inter = layout.intermediate_range(core);
        let vocab = layout.vocab_range(core);

        let kv_columns = |matrix: &Array2<f32>| -> Result<Array2<f32>> {
            let views: Vec<_> = layout
                .kv_heads(core)
                .iter()
                .map(|&head| matrix.slice(s![.., head * hd..(head + 1) * hd]))
                .collect();
            Ok(concatenate(Axis(1), &views)?)
        };

        let layers = self
            .layers
            .iter()
            .map(|layer| {
                let q = layer.q_proj.slice(s![.., q_range.clone()]).to_owned();
                let k = kv_columns(&layer.k_proj)?;
                let v = kv_columns(&layer.v_proj)?;
                let qkv = if fuse_qkv {
                    QkvWeights::Fused {
                        weight: concatenate(Axis(1), &[q.view(), k.view(), v.view()])?,
                        q_cols: q.ncols(),
                        kv_cols: k.ncols(),
                    }
                } else {
                    QkvWeights::Separate { q, k, v }
                };
                Ok(LayerShard {
                    attn_norm: layer.attn_norm.clone(),
                    qkv,
                    o_proj: layer.o_proj.slice(s![q_range.clone(), ..]).to_owned(),
                    mlp_norm: layer.mlp_norm.clone(),
                    gate_proj: layer.gate_proj.slice(s![.., inter.clone()]).to_owned(),
                    up_proj: layer.up_proj.slice(s![.., inter.clone()]).to_owned(),
                    down_proj: layer.down_proj.slice(s![inter.clone(), ..]).to_owned(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ShardWeights {
            core,
            embed_tokens: self.embed_tokens.clone(),
            layers,
            final_norm: self.final_norm.clone(),
            lm_head: self.lm_head.slice(s![.., vocab.clone()]).to_owned(),
            vocab_offset: vocab.start,
        })
    }
}

#[derive(Debug, Clone)]
pub enum QkvWeights {
    /// Columns are `[q | k | v]`.
    Fused {
        weight: Array2<f32>,
        q_cols: usize,
        kv_cols: usize,
    },
    Separate {
        q: Array2<f32>,
        k: Array2<f32>,
        v: Array2<f32>,
    },
}

impl QkvWeights {
    pub fn num_elements(&self) -> usize {
        match self {
            QkvWeights::Fused { weight, .. } => weight.len(),
            QkvWeights::Separate { q, k, v } => q.len() + k.len() + v.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayerShard {
    pub attn_norm: Array1<f32>,
    pub qkv: QkvWeights,
    /// Rows of `o_proj` for this core's heads.
    pub o_proj: Array2<f32>,
    pub mlp_norm: Array1<f32>,
    pub gate_proj: Array2<f32>,
    pub up_proj: Array2<f32>,
    pub down_proj: Array2<f32>,
}

/// Weights resident on one core.
#[derive(Debug, Clone)]
pub struct ShardWeights {
    pub core: usize,
    pub embed_tokens: Array2<f32>,
    pub layers: Vec<LayerShard>,
    pub final_norm: Array1<f32>,
    /// Columns `vocab_offset..vocab_offset + lm_head.ncols()`.
    pub lm_head: Array2<f32>,
    pub vocab_offset: usize,
}

impl ShardWeights {
    pub fn num_bytes(&self, dtype: DataType) -> u64 {
        let layers: usize = self
            .layers
            .iter()
            .map(|l| {
                l.attn_norm.len()
                    + l.qkv.num_elements()
                    + l.o_proj.len()
                    + l.mlp_norm.len()
                    + l.gate_proj.len()
                    + l.up_proj.len()
                    + l.down_proj.len()
            })
            .sum();
        let elements = self.embed_tokens.len() + layers + self.final_norm.len() + self.lm_head.len();
        (elements * dtype.element_size_bytes()) as u64
    }
}

struct TensorStore<'data> {
    archives: Vec<SafeTensors<'data>>,
}

impl<'data> TensorStore<'data> {
    fn contains(&self, name: &str) -> bool {
        self.archives.iter().any(|a| a.tensor(name).is_ok())
    }

    fn tensor(&self, name: &str) -> Result<ArrayD<f32>> {
        let view = self
            .archives
            .iter()
            .find_map(|archive| archive.tensor(name).ok())
            .with_context(|| format!("tensor '{}' not found in checkpoint", name))?;
        let data = view.data();
        let values: Vec<f32> = match view.dtype() {
            Dtype::F32 => data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => data
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            Dtype::BF16 => data
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            other => bail!("tensor '{}' has unsupported dtype {:?}", name, other),
        };
        ArrayD::from_shape_vec(view.shape().to_vec(), values)
            .with_context(|| format!("tensor '{}' data does not match its shape", name))
    }

    fn matrix(&self, name: &str) -> Result<Array2<f32>> {
        self.tensor(name)?
            .into_dimensionality::<Ix2>()
            .with_context(|| format!("expected 2D tensor for {}", name))
    }

    fn vector(&self, name: &str) -> Result<Array1<f32>> {
        self.tensor(name)?
            .into_dimensionality::<Ix1>()
            .with_context(|| format!("expected 1D tensor for {}", name))
    }
}

fn safetensors_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read model dir {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("safetensors") {
            files.push(path);
        }
    }
    ensure!(
        !files.is_empty(),
        "no .safetensors files in {}",
        dir.display()
    );
    files.sort();
    Ok(files)
}

fn f32_bytes<'a>(values: impl Iterator<Item = &'a f32>) -> Vec<u8> {
    values.flat_map(|v| v.to_le_bytes()).collect()
}
