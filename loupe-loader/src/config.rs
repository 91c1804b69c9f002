use std::path::Path;

use loupe_core::{CaptionerConfig, DType, Result};
use serde::Deserialize;
use tracing::info;

/// Captioner architecture as stored in an optional `config.json` next to the
/// checkpoint. Every field has the published CLIPtion default.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptionerFileConfig {
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_vision_embed_dim")]
    pub vision_embed_dim: usize,
    #[serde(default = "default_memory_len")]
    pub memory_len: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
}

fn default_hidden_dim() -> usize {
    768
}
fn default_num_heads() -> usize {
    8
}
fn default_num_blocks() -> usize {
    6
}
fn default_max_length() -> usize {
    77
}
fn default_vision_embed_dim() -> usize {
    1024
}
fn default_memory_len() -> usize {
    257
}
fn default_layer_norm_eps() -> f32 {
    1e-5
}

impl Default for CaptionerFileConfig {
    fn default() -> Self {
        Self {
            hidden_dim: default_hidden_dim(),
            num_heads: default_num_heads(),
            num_blocks: default_num_blocks(),
            max_length: default_max_length(),
            vision_embed_dim: default_vision_embed_dim(),
            memory_len: default_memory_len(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

impl CaptionerFileConfig {
    /// Read `config.json` from `model_dir`, falling back to defaults when the
    /// file is absent. A checkpoint file path uses its parent directory.
    pub fn load_or_default(model_path: &Path) -> Result<Self> {
        let dir = if model_path.is_file() {
            model_path.parent().unwrap_or(model_path)
        } else {
            model_path
        };
        let config_path = dir.join("config.json");
        if !config_path.exists() {
            info!("No config.json in {}, using CLIPtion defaults", dir.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&config_path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// `vocab_size` comes from the external tokenizer, not the checkpoint.
    pub fn to_captioner_config(&self, vocab_size: usize) -> Result<CaptionerConfig> {
        let config = CaptionerConfig {
            hidden_dim: self.hidden_dim,
            num_heads: self.num_heads,
            num_blocks: self.num_blocks,
            max_length: self.max_length,
            vision_embed_dim: self.vision_embed_dim,
            memory_len: self.memory_len,
            vocab_size,
            layer_norm_eps: self.layer_norm_eps,
            dtype: DType::F32,
        };
        config.validate()?;
        Ok(config)
    }
}
