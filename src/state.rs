//! Runtime state buffers for Llama inference: the mutable, per-session
//! counterpart to the immutable `LlamaConfig`/`LlamaWeights` (§3).

use crate::config::LlamaConfig;
use crate::error::Result;

/// Token id used to seed `latest_token`, matching the tokenizer's own BOS id.
pub const BOS_TOKEN: i32 = 1;

/// Runtime buffers for inference, aligned with forward pass states.
#[derive(Debug, Clone)]
pub struct LlamaState {
    /// Current hidden state / residual stream (hidden_states)
    pub x: Vec<f32>,
    /// Buffer for attention output before projection
    pub xb: Vec<f32>,
    /// Temp buffer for attention projection output
    pub xb2: Vec<f32>,
    /// FFN gate activation buffer
    pub hb: Vec<f32>,
    /// FFN up activation buffer
    pub hb2: Vec<f32>,
    /// Query vector
    pub q: Vec<f32>,
    /// Key vector
    pub k: Vec<f32>,
    /// Value vector
    pub v: Vec<f32>,
    /// Attention scores scratch, flat `[n_heads][seq_len]` per §3.
    pub att: Vec<f32>,
    /// Output logits
    pub logits: Vec<f32>,
    /// Key cache `[n_layers][seq_len * kv_dim]`
    pub key_cache: Vec<Vec<f32>>,
    /// Value cache `[n_layers][seq_len * kv_dim]`
    pub value_cache: Vec<Vec<f32>>,
    /// Last token id emitted by this session; seeded with the
    /// beginning-of-text id on creation (§3).
    pub latest_token: i32,
}

impl LlamaState {
    /// Allocate inference buffers based on config. Returns
    /// `ConfigurationInvalid` if `config` violates the invariants in §3
    /// (I1-I3) — caught here rather than deep inside the forward pass.
    pub fn new(config: &LlamaConfig) -> Result<Self> {
        config.validate()?;

        let dim = config.dim as usize;
        let hdim = config.hidden_dim as usize;
        let n_heads = config.n_heads as usize;
        let n_layers = config.n_layers as usize;
        let seq_len = config.seq_len as usize;
        let kv_dim = config.kv_dim();
        let vocab_size = config.vocab_size as usize;

        let key_cache = (0..n_layers)
            .map(|_| vec![0.0f32; seq_len * kv_dim])
            .collect();
        let value_cache = (0..n_layers)
            .map(|_| vec![0.0f32; seq_len * kv_dim])
            .collect();

        Ok(LlamaState {
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            xb2: vec![0.0; dim],
            hb: vec![0.0; hdim],
            hb2: vec![0.0; hdim],
            q: vec![0.0; dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; n_heads * seq_len],
            logits: vec![0.0; vocab_size],
            key_cache,
            value_cache,
            latest_token: BOS_TOKEN,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LlamaConfig {
        LlamaConfig {
            dim: 8,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 2,
            vocab_size: 10,
            seq_len: 16,
            rms_norm_eps: 1e-5,
            rope_base: 10000.0,
        }
    }

    #[test]
    fn allocates_buffers_to_spec_sizes() {
        let c = cfg();
        let s = LlamaState::new(&c).unwrap();
        assert_eq!(s.x.len(), 8);
        assert_eq!(s.hb.len(), 16);
        assert_eq!(s.k.len(), c.kv_dim());
        assert_eq!(s.att.len(), (c.n_heads as usize) * (c.seq_len as usize));
        assert_eq!(s.logits.len(), 10);
        assert_eq!(s.key_cache.len(), 2);
        assert_eq!(s.key_cache[0].len(), (c.seq_len as usize) * c.kv_dim());
        assert_eq!(s.latest_token, BOS_TOKEN);
    }

    #[test]
    fn rejects_invalid_config() {
        let mut c = cfg();
        c.n_heads = 3; // 3 % 2 != 0
        assert!(LlamaState::new(&c).is_err());
    }
}
