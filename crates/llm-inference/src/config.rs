//! Model configuration in the Hugging Face `config.json` vocabulary.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tpforge_ir::ModelDims;
use tpforge_kernels::config::ActivationKind;
use tpforge_kernels::norm::NormKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    #[serde(alias = "d_model")]
    pub hidden_size: usize,
    #[serde(alias = "n_layers")]
    pub num_hidden_layers: usize,
    #[serde(alias = "n_heads")]
    pub num_attention_heads: usize,
    /// Defaults to `num_attention_heads` (no grouped-query attention).
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(alias = "d_ff")]
    pub intermediate_size: usize,
    #[serde(alias = "max_seq_len", default = "default_max_positions")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_norm_eps")]
    pub rms_norm_eps: f32,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_max_positions() -> usize {
    4096
}

fn default_rope_theta() -> f32 {
    10000.0
}

fn default_norm_eps() -> f32 {
    1e-5
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

impl ModelConfig {
    /// Small llama-shaped model for tests and demos.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 256,
            hidden_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 8,
            num_key_value_heads: Some(2),
            intermediate_size: 128,
            max_position_embeddings: 65536,
            rope_theta: 10000.0,
            rms_norm_eps: 1e-5,
            hidden_act: "silu".to_string(),
            tie_word_embeddings: false,
        }
    }

    /// Llama-2 7B shape.
    pub fn llama2_7b() -> Self {
        Self {
            vocab_size: 32000,
            hidden_size: 4096,
            num_hidden_layers: 32,
            num_attention_heads: 32,
            num_key_value_heads: Some(32),
            intermediate_size: 11008,
            max_position_embeddings: 4096,
            rope_theta: 10000.0,
            rms_norm_eps: 1e-5,
            hidden_act: "silu".to_string(),
            tie_word_embeddings: false,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read model config {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("malformed model config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write model config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.vocab_size > 0, "vocab_size must be positive");
        ensure!(self.num_hidden_layers > 0, "model needs at least one layer");
        ensure!(
            self.num_attention_heads > 0 && self.hidden_size % self.num_attention_heads == 0,
            "hidden_size {} is not divisible by {} heads",
            self.hidden_size,
            self.num_attention_heads
        );
        ensure!(
            self.head_dim() % 2 == 0,
            "rotary embeddings need an even head dim, got {}",
            self.head_dim()
        );
        let kv = self.kv_heads();
        ensure!(
            kv > 0 && self.num_attention_heads % kv == 0,
            "{} heads cannot be grouped over {} kv heads",
            self.num_attention_heads,
            kv
        );
        self.activation()?;
        Ok(())
    }

    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn activation(&self) -> Result<ActivationKind> {
        match self.hidden_act.as_str() {
            "silu" | "swish" => Ok(ActivationKind::Silu),
            "gelu" | "gelu_new" | "gelu_pytorch_tanh" => Ok(ActivationKind::Gelu),
            other => anyhow::bail!("unsupported hidden_act '{}'", other),
        }
    }

    pub fn dims(&self) -> Result<ModelDims> {
        Ok(ModelDims {
            vocab_size: self.vocab_size,
            hidden_size: self.hidden_size,
            n_layers: self.num_hidden_layers,
            n_heads: self.num_attention_heads,
            n_kv_heads: self.kv_heads(),
            intermediate_size: self.intermediate_size,
            norm: NormKind::RmsNorm,
            norm_epsilon: self.rms_norm_eps,
            activation: self.activation()?,
            gated_mlp: true,
            rope_theta: self.rope_theta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hugging_face_config() {
        let json = r#"{
            "architectures": ["LlamaForCausalLM"],
            "vocab_size": 32000,
            "hidden_size": 4096,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "intermediate_size": 14336,
            "max_position_embeddings": 32768,
            "rope_theta": 1000000.0,
            "rms_norm_eps": 1e-5,
            "hidden_act": "silu",
            "torch_dtype": "bfloat16"
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.kv_heads(), 8);
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.dims().unwrap().n_kv_heads, 8);
    }

    #[test]
    fn kv_heads_default_to_attention_heads() {
        let json = r#"{"vocab_size": 10, "d_model": 16, "n_layers": 1, "n_heads": 4, "d_ff": 32}"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kv_heads(), 4);
        assert_eq!(config.hidden_act, "silu");
    }

    #[test]
    fn unsupported_activation_is_rejected() {
        let mut config = ModelConfig::tiny();
        config.hidden_act = "relu6".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        ModelConfig::tiny().save(&path).unwrap();
        assert_eq!(ModelConfig::from_file(&path).unwrap(), ModelConfig::tiny());
    }
}
