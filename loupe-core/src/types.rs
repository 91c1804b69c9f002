use serde::{Deserialize, Serialize};

use crate::{LoupeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }
}

/// Architecture of the caption decoder.
#[derive(Debug, Clone)]
pub struct CaptionerConfig {
    pub hidden_dim: usize,
    pub num_heads: usize,
    pub num_blocks: usize,
    /// Token buffer length; also the side of the causal mask.
    pub max_length: usize,
    /// Per-patch feature width produced by the vision encoder.
    pub vision_embed_dim: usize,
    /// Number of patches (including the class token) the positional table covers.
    pub memory_len: usize,
    pub vocab_size: usize,
    pub layer_norm_eps: f32,
    pub dtype: DType,
}

impl CaptionerConfig {
    /// Reject architectures the decoder cannot be built from.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("hidden_dim", self.hidden_dim),
            ("num_heads", self.num_heads),
            ("num_blocks", self.num_blocks),
            ("vision_embed_dim", self.vision_embed_dim),
            ("memory_len", self.memory_len),
            ("vocab_size", self.vocab_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(LoupeError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.hidden_dim % self.num_heads != 0 {
            return Err(LoupeError::InvalidConfig(format!(
                "hidden_dim {} is not divisible by num_heads {}",
                self.hidden_dim, self.num_heads
            )));
        }
        if self.max_length < 2 {
            return Err(LoupeError::InvalidConfig(format!(
                "max_length must be at least 2, got {}",
                self.max_length
            )));
        }
        if !self.layer_norm_eps.is_finite() || self.layer_norm_eps <= 0.0 {
            return Err(LoupeError::InvalidConfig(format!(
                "layer_norm_eps must be a positive finite number, got {}",
                self.layer_norm_eps
            )));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.num_heads
    }

    pub fn ffn_dim(&self) -> usize {
        self.hidden_dim * 4
    }
}

/// BOS/EOS ids of the external vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: u32,
    pub eos: u32,
}

/// Per-call decode settings. Never stored globally.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub temperature: f32,
    /// Independent sampled rows per image.
    pub best_of: usize,
    pub beam_width: usize,
    /// Suppress EOS so generation runs through the whole buffer.
    pub ramble: bool,
    /// Buffer length for this call; `None` uses the model's mask size.
    pub max_length: Option<usize>,
    pub seed: u64,
    /// Exponent on hypothesis length when ranking finished beams.
    pub length_penalty: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            best_of: 1,
            beam_width: 4,
            ramble: false,
            max_length: None,
            seed: 42,
            length_penalty: 1.0,
        }
    }
}

impl GenerationConfig {
    /// Check the config against a model whose causal mask covers
    /// `model_max_length` positions. Returns the effective buffer length.
    pub fn validate(&self, model_max_length: usize) -> Result<usize> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(LoupeError::InvalidConfig(format!(
                "temperature must be a positive finite number, got {}",
                self.temperature
            )));
        }
        if self.best_of == 0 {
            return Err(LoupeError::InvalidConfig("best_of must be at least 1".into()));
        }
        if self.beam_width == 0 {
            return Err(LoupeError::InvalidConfig(
                "beam_width must be at least 1".into(),
            ));
        }
        if !self.length_penalty.is_finite() {
            return Err(LoupeError::InvalidConfig(format!(
                "length_penalty must be finite, got {}",
                self.length_penalty
            )));
        }
        let max_length = self.max_length.unwrap_or(model_max_length);
        if max_length < 2 || max_length > model_max_length {
            return Err(LoupeError::InvalidConfig(format!(
                "max_length must be in 2..={model_max_length}, got {max_length}"
            )));
        }
        Ok(max_length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EosToken,
    MaxLength,
}
