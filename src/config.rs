//! Llama model configuration.

use crate::error::{LlamaError, Result};

/// Transformer hyperparameters, aligned with LlamaConfig in Hugging Face Transformers.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct LlamaConfig {
    /// Transformer embedding dimension (hidden_size)
    pub dim: i32,
    /// FFN intermediate dimension (intermediate_size)
    pub hidden_dim: i32,
    /// Number of decoder layers (num_hidden_layers)
    pub n_layers: i32,
    /// Number of query attention heads (num_attention_heads)
    pub n_heads: i32,
    /// Number of key/value heads for GQA (num_key_value_heads)
    pub n_kv_heads: i32,
    /// Vocabulary size (vocab_size)
    pub vocab_size: i32,
    /// Maximum context length (max_position_embeddings)
    pub seq_len: i32,
    /// RMSNorm epsilon (rms_norm_eps)
    pub rms_norm_eps: f32,
    /// RoPE base frequency. The conventional LLaMA value is 10000; some
    /// checkpoints trained against a fused kernel instead assume 50000.
    /// Defaults to 10000 since that matches ordinary trained weights; set
    /// explicitly when loading a checkpoint known to use the other base.
    pub rope_base: f32,
}

impl LlamaConfig {
    /// Returns the key/value dimension per head group.
    #[inline]
    pub fn kv_dim(&self) -> usize {
        ((self.dim * self.n_kv_heads) / self.n_heads) as usize
    }

    /// Returns the head size.
    #[inline]
    pub fn head_size(&self) -> usize {
        (self.dim / self.n_heads) as usize
    }

    /// Returns the number of heads per KV group (for GQA).
    #[inline]
    pub fn group_size(&self) -> usize {
        (self.n_heads / self.n_kv_heads) as usize
    }

    /// Checks the invariants from the data model:
    ///
    /// - I1: `n_heads / n_kv_heads` is an exact integer (`group_size`).
    /// - I2: `dim == n_heads * head_size`.
    /// - I3: `head_size` is even (RoPE rotates dimensions in pairs).
    pub fn validate(&self) -> Result<()> {
        if self.dim <= 0 || self.hidden_dim <= 0 || self.n_layers <= 0 {
            return Err(LlamaError::ConfigurationInvalid(
                "dim, hidden_dim and n_layers must be positive".into(),
            ));
        }
        if self.n_heads <= 0 || self.n_kv_heads <= 0 {
            return Err(LlamaError::ConfigurationInvalid(
                "n_heads and n_kv_heads must be positive".into(),
            ));
        }
        if self.n_kv_heads > self.n_heads {
            return Err(LlamaError::ConfigurationInvalid(format!(
                "n_kv_heads ({}) must not exceed n_heads ({})",
                self.n_kv_heads, self.n_heads
            )));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(LlamaError::ConfigurationInvalid(format!(
                "n_heads ({}) must be an integer multiple of n_kv_heads ({})",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.dim % self.n_heads != 0 {
            return Err(LlamaError::ConfigurationInvalid(format!(
                "dim ({}) must be divisible by n_heads ({})",
                self.dim, self.n_heads
            )));
        }
        if self.head_size() % 2 != 0 {
            return Err(LlamaError::ConfigurationInvalid(format!(
                "head_size ({}) must be even for RoPE pairing",
                self.head_size()
            )));
        }
        if self.vocab_size <= 0 || self.seq_len <= 0 {
            return Err(LlamaError::ConfigurationInvalid(
                "vocab_size and seq_len must be positive".into(),
            ));
        }
        if self.rms_norm_eps <= 0.0 {
            return Err(LlamaError::ConfigurationInvalid(
                "rms_norm_eps must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Checks I4: `position` must address a slot inside the allocated cache.
    pub fn check_position(&self, position: i32) -> Result<()> {
        if position < 0 || position >= self.seq_len {
            return Err(LlamaError::PositionOutOfRange {
                position: position as usize,
                context_length: self.seq_len as usize,
            });
        }
        Ok(())
    }
}
