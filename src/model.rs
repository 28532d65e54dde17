//! Llama model forward pass: checkpoint loading and the per-layer driver
//! that ties config, weights, numeric kernels and attention together (§4.8).

use crate::attention::{self, DEFAULT_TILE_SIZE};
use crate::config::LlamaConfig;
use crate::error::Result;
use crate::ops::{self, RMS_EPS, accum, apply_rope, matmul, matmul_swiglu, rmsnorm, silu};
use crate::state::LlamaState;
use crate::weights::{LlamaLayerWeights, LlamaWeights};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Which attention kernel the driver should run for a layer (§4.6 vs §4.7).
/// Both read the same cache slices and write the same `xb` layout, so this
/// is a pure dispatch choice with no effect on the result beyond floating
/// point reassociation.
#[derive(Debug, Clone, Copy)]
pub enum AttentionKernel {
    Reference,
    Flash { tile_size: usize },
}

impl Default for AttentionKernel {
    fn default() -> Self {
        AttentionKernel::Reference
    }
}

/// Where the per-layer math runs. `Cpu` computes SwiGLU with the fused
/// matmul kernel (§4.5); `Accelerator` models a backend that cannot fuse the
/// two FFN matmuls into one work group and instead materializes `hb`/`hb2`
/// separately before combining them — the same two buffers `LlamaState`
/// already allocates for exactly this case. `Accelerator` also stages the
/// residual stream through a device-visible buffer at every layer boundary
/// (the §9 KV-cache/activation copy-timing resolution: copy on every
/// boundary, never the whole-loop-on-device alternative) — see
/// `stage_to_device`/`stage_to_host` in `forward()`. Either arm produces identical
/// results; the distinction is which kernel variant runs and whether the
/// boundary copy happens, decided once per call and never mixed mid-layer.
#[derive(Debug, Clone, Copy, Default)]
pub enum ComputePath {
    #[default]
    Cpu,
    Accelerator,
}

/// Load config and weights from a binary checkpoint file. The legacy
/// checkpoint format predates `rms_norm_eps`/`rope_base`, so both are seeded
/// with the conventional LLaMA defaults (see `ops::RMS_EPS`) rather than
/// read from the file.
pub fn load_model<P: AsRef<Path>>(path: P) -> Result<(LlamaConfig, LlamaWeights)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let config = LlamaConfig {
        dim: reader.read_i32::<LittleEndian>()?,
        hidden_dim: reader.read_i32::<LittleEndian>()?,
        n_layers: reader.read_i32::<LittleEndian>()?,
        n_heads: reader.read_i32::<LittleEndian>()?,
        n_kv_heads: reader.read_i32::<LittleEndian>()?,
        vocab_size: reader.read_i32::<LittleEndian>()?,
        seq_len: reader.read_i32::<LittleEndian>()?,
        rms_norm_eps: RMS_EPS,
        rope_base: 10000.0,
    };
    config.validate()?;

    let weights = LlamaWeights::load(&mut reader, &config)?;

    Ok((config, weights))
}

/// Runs one token through every decoder layer plus the final norm and
/// classifier, mutating `state` in place and leaving the result in
/// `state.logits`. Checks `pos` against the cache bound (I4) before
/// touching any buffer.
pub fn forward(
    token: i32,
    pos: i32,
    config: &LlamaConfig,
    state: &mut LlamaState,
    weights: &LlamaWeights,
    path: ComputePath,
    attn: AttentionKernel,
) -> Result<()> {
    config.check_position(pos)?;

    let dim = config.dim as usize;
    let emb_offset = (token as usize) * dim;
    state
        .x
        .copy_from_slice(&weights.embed_tokens[emb_offset..emb_offset + dim]);

    let mut device_x = match path {
        ComputePath::Cpu => Vec::new(),
        ComputePath::Accelerator => vec![0.0f32; dim],
    };

    for l in 0..config.n_layers as usize {
        match path {
            ComputePath::Cpu => {
                attention_step(l, pos, config, state, &weights.layers[l], attn);
                mlp_step_fused(config, state, &weights.layers[l]);
            }
            ComputePath::Accelerator => {
                stage_to_device(&mut device_x, &mut state.x);
                attention_step(l, pos, config, state, &weights.layers[l], attn);
                mlp_step_unfused(config, state, &weights.layers[l]);
                stage_to_host(&mut device_x, &mut state.x);
            }
        }
    }

    let x_clone = state.x.clone();
    rmsnorm(&mut state.x, &x_clone, &weights.norm, config.rms_norm_eps);
    matmul(&mut state.logits, &state.x, &weights.wcls);

    state.latest_token = token;
    Ok(())
}

/// Host -> device copy of the residual stream, the one activation buffer
/// that crosses a layer boundary (per-layer scratch like `xb`/`q`/`k`/`v`
/// never does, so it is never staged). No accelerator binding exists in
/// this workspace (§1 scopes the dispatch framework out), so the round trip
/// through `device_x` is numerically a no-op, but it is the explicit point
/// where a real backend's DMA transfer would be inserted.
fn stage_to_device(device_x: &mut [f32], x: &mut [f32]) {
    device_x.copy_from_slice(x);
    x.copy_from_slice(device_x);
}

/// Device -> host copy back, completing the boundary this layer staged.
fn stage_to_host(device_x: &mut [f32], x: &mut [f32]) {
    device_x.copy_from_slice(x);
    x.copy_from_slice(device_x);
}

/// Self-attention for one layer (§4.4, §4.6/§4.7): input norm, QKV
/// projections, RoPE, cache write, the chosen attention kernel, output
/// projection, residual add.
fn attention_step(
    layer_idx: usize,
    pos: i32,
    config: &LlamaConfig,
    state: &mut LlamaState,
    lw: &LlamaLayerWeights,
    attn: AttentionKernel,
) {
    let n_heads = config.n_heads as usize;
    let head_size = config.head_size();
    let kv_dim = config.kv_dim();
    let group_size = config.group_size();
    let seq_len = config.seq_len as usize;
    let pos_usize = pos as usize;

    rmsnorm(&mut state.xb, &state.x, &lw.attn_norm, config.rms_norm_eps);

    matmul(&mut state.q, &state.xb, &lw.q_proj);
    matmul(&mut state.k, &state.xb, &lw.k_proj);
    matmul(&mut state.v, &state.xb, &lw.v_proj);

    apply_rope(&mut state.q, &mut state.k, pos, head_size, config.rope_base);

    let cache_offset = pos_usize * kv_dim;
    state.key_cache[layer_idx][cache_offset..cache_offset + kv_dim].copy_from_slice(&state.k);
    state.value_cache[layer_idx][cache_offset..cache_offset + kv_dim].copy_from_slice(&state.v);

    match attn {
        AttentionKernel::Reference => attention::attention_reference(
            &mut state.xb,
            &state.q,
            &state.key_cache[layer_idx],
            &state.value_cache[layer_idx],
            &mut state.att,
            seq_len,
            pos_usize,
            n_heads,
            head_size,
            kv_dim,
            group_size,
        ),
        AttentionKernel::Flash { tile_size } => attention::attention_flash(
            &mut state.xb,
            &state.q,
            &state.key_cache[layer_idx],
            &state.value_cache[layer_idx],
            pos_usize,
            n_heads,
            head_size,
            kv_dim,
            group_size,
            if tile_size == 0 { DEFAULT_TILE_SIZE } else { tile_size },
        ),
    }

    matmul(&mut state.xb2, &state.xb, &lw.o_proj);
    accum(&mut state.x, &state.xb2);
}

/// FFN for one layer (§4.5), fused gate/up matmul: `hb` alone carries
/// `silu(gate) * up`, never materializing the two matmuls separately.
fn mlp_step_fused(config: &LlamaConfig, state: &mut LlamaState, lw: &LlamaLayerWeights) {
    rmsnorm(&mut state.xb, &state.x, &lw.ffn_norm, config.rms_norm_eps);
    matmul_swiglu(&mut state.hb, &state.xb, &lw.gate_proj, &lw.up_proj);
    matmul(&mut state.xb, &state.hb, &lw.down_proj);
    accum(&mut state.x, &state.xb);
}

/// FFN for one layer, unfused: gate and up land in separate buffers (`hb`,
/// `hb2`) before combining, the shape a non-fusing accelerator backend
/// would need.
fn mlp_step_unfused(config: &LlamaConfig, state: &mut LlamaState, lw: &LlamaLayerWeights) {
    rmsnorm(&mut state.xb, &state.x, &lw.ffn_norm, config.rms_norm_eps);
    matmul(&mut state.hb, &state.xb, &lw.gate_proj);
    matmul(&mut state.hb2, &state.xb, &lw.up_proj);
    for (g, u) in state.hb.iter_mut().zip(state.hb2.iter()) {
        *g = silu(*g) * u;
    }
    matmul(&mut state.xb, &state.hb, &lw.down_proj);
    accum(&mut state.x, &state.xb);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::MatMul;

    fn tiny_config() -> LlamaConfig {
        LlamaConfig {
            dim: 8,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 2,
            vocab_size: 6,
            seq_len: 8,
            rms_norm_eps: 1e-5,
            rope_base: 10000.0,
        }
    }

    fn lcg(seed: &mut u64) -> f32 {
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        ((*seed >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0
    }

    fn dense(seed: &mut u64, rows: usize, cols: usize) -> MatMul {
        let values: Vec<f32> = (0..rows * cols).map(|_| lcg(seed)).collect();
        MatMul::from_dense(values, rows, cols)
    }

    fn tiny_weights(config: &LlamaConfig) -> LlamaWeights {
        let dim = config.dim as usize;
        let hdim = config.hidden_dim as usize;
        let kv_dim = config.kv_dim();
        let vocab = config.vocab_size as usize;
        let mut seed = 1u64;

        let layers = (0..config.n_layers as usize)
            .map(|_| LlamaLayerWeights {
                attn_norm: vec![1.0; dim],
                q_proj: dense(&mut seed, dim, dim),
                k_proj: dense(&mut seed, kv_dim, dim),
                v_proj: dense(&mut seed, kv_dim, dim),
                o_proj: dense(&mut seed, dim, dim),
                ffn_norm: vec![1.0; dim],
                gate_proj: dense(&mut seed, hdim, dim),
                up_proj: dense(&mut seed, hdim, dim),
                down_proj: dense(&mut seed, dim, hdim),
            })
            .collect();

        let embed_tokens: Vec<f32> = (0..vocab * dim).map(|_| lcg(&mut seed)).collect();
        let wcls = dense(&mut seed, vocab, dim);

        LlamaWeights {
            embed_tokens,
            layers,
            norm: vec![1.0; dim],
            wcls,
            shared_classifier: false,
        }
    }

    #[test]
    fn forward_rejects_position_beyond_context_length() {
        let config = tiny_config();
        let weights = tiny_weights(&config);
        let mut state = LlamaState::new(&config).unwrap();
        assert!(
            forward(
                0,
                config.seq_len,
                &config,
                &mut state,
                &weights,
                ComputePath::Cpu,
                AttentionKernel::Reference
            )
            .is_err()
        );
    }

    #[test]
    fn cpu_and_accelerator_paths_agree() {
        let config = tiny_config();
        let weights = tiny_weights(&config);

        let mut state_cpu = LlamaState::new(&config).unwrap();
        let mut state_acc = LlamaState::new(&config).unwrap();

        for (pos, &tok) in [1i32, 3, 0].iter().enumerate() {
            forward(tok, pos as i32, &config, &mut state_cpu, &weights, ComputePath::Cpu, AttentionKernel::Reference).unwrap();
            forward(tok, pos as i32, &config, &mut state_acc, &weights, ComputePath::Accelerator, AttentionKernel::Reference).unwrap();
        }

        for (a, b) in state_cpu.logits.iter().zip(state_acc.logits.iter()) {
            assert!((a - b).abs() < 1e-3, "a={a} b={b}");
        }
    }

    #[test]
    fn reference_and_flash_attention_agree_through_full_forward() {
        let config = tiny_config();
        let weights = tiny_weights(&config);

        let mut state_ref = LlamaState::new(&config).unwrap();
        let mut state_flash = LlamaState::new(&config).unwrap();

        for (pos, &tok) in [1i32, 2, 4].iter().enumerate() {
            forward(tok, pos as i32, &config, &mut state_ref, &weights, ComputePath::Cpu, AttentionKernel::Reference).unwrap();
            forward(
                tok,
                pos as i32,
                &config,
                &mut state_flash,
                &weights,
                ComputePath::Cpu,
                AttentionKernel::Flash { tile_size: DEFAULT_TILE_SIZE },
            )
            .unwrap();
        }

        for (a, b) in state_ref.logits.iter().zip(state_flash.logits.iter()) {
            let rel = (a - b).abs() / a.abs().max(1e-6);
            assert!(rel < 1e-2, "a={a} b={b} rel={rel}");
        }
    }

    #[test]
    fn forward_is_deterministic_given_same_prefix() {
        let config = tiny_config();
        let weights = tiny_weights(&config);

        let mut state_a = LlamaState::new(&config).unwrap();
        let mut state_b = LlamaState::new(&config).unwrap();

        for (pos, &tok) in [1i32, 5, 2, 3].iter().enumerate() {
            forward(tok, pos as i32, &config, &mut state_a, &weights, ComputePath::Cpu, AttentionKernel::Reference).unwrap();
        }
        for (pos, &tok) in [1i32, 5, 2, 3].iter().enumerate() {
            forward(tok, pos as i32, &config, &mut state_b, &weights, ComputePath::Cpu, AttentionKernel::Reference).unwrap();
        }

        assert_eq!(state_a.logits, state_b.logits);
    }

    /// Builds a dense matrix of small integer values (exactly representable
    /// as Q8_0 codes at scale 1.0) alongside a Q8_0-encoded `RawMatrix` of
    /// the same values, so quantization introduces no rounding at all.
    fn int_dense_and_q8_0(seed: &mut u64, rows: usize, cols: usize) -> (MatMul, crate::weights::RawMatrix) {
        let values: Vec<i32> = (0..rows * cols).map(|_| (lcg(seed) * 3.0).round() as i32).collect();
        let floats: Vec<f32> = values.iter().map(|&v| v as f32).collect();
        let dense = MatMul::from_dense(floats, rows, cols);

        let mut bytes = Vec::new();
        for row in values.chunks(cols) {
            for block in row.chunks(crate::quant::BLOCK_SIZE) {
                bytes.extend_from_slice(&half::f16::from_f32(1.0).to_bits().to_le_bytes());
                for i in 0..crate::quant::BLOCK_SIZE {
                    bytes.push(block.get(i).copied().unwrap_or(0) as i8 as u8);
                }
            }
        }
        let raw = crate::weights::RawMatrix {
            rows,
            cols,
            encoding: crate::weights::Encoding::Q8_0,
            bytes,
        };
        (dense, raw)
    }

    /// Same tiny transformer, once with dense f32 weights and once with the
    /// identical values carried through Q8_0 at scale 1.0 (a lossless
    /// encoding), asserting the two forward passes land on the same logits.
    #[test]
    fn q8_0_identity_quantization_matches_dense_forward() {
        let config = LlamaConfig {
            dim: 32,
            hidden_dim: 64,
            n_layers: 1,
            n_heads: 4,
            n_kv_heads: 4,
            vocab_size: 32,
            seq_len: 8,
            rms_norm_eps: 1e-5,
            rope_base: 10000.0,
        };
        let dim = config.dim as usize;
        let hdim = config.hidden_dim as usize;
        let kv_dim = config.kv_dim();
        let vocab = config.vocab_size as usize;
        let mut seed = 11u64;

        let (q_dense, q_raw) = int_dense_and_q8_0(&mut seed, dim, dim);
        let (k_dense, k_raw) = int_dense_and_q8_0(&mut seed, kv_dim, dim);
        let (v_dense, v_raw) = int_dense_and_q8_0(&mut seed, kv_dim, dim);
        let (o_dense, o_raw) = int_dense_and_q8_0(&mut seed, dim, dim);
        let (gate_dense, gate_raw) = int_dense_and_q8_0(&mut seed, hdim, dim);
        let (up_dense, up_raw) = int_dense_and_q8_0(&mut seed, hdim, dim);
        let (down_dense, down_raw) = int_dense_and_q8_0(&mut seed, dim, hdim);
        let (wcls_dense, wcls_raw) = int_dense_and_q8_0(&mut seed, vocab, dim);

        let embed_tokens: Vec<f32> = (0..vocab * dim).map(|_| lcg(&mut seed)).collect();

        let weights_dense = LlamaWeights {
            embed_tokens: embed_tokens.clone(),
            layers: vec![LlamaLayerWeights {
                attn_norm: vec![1.0; dim],
                q_proj: q_dense,
                k_proj: k_dense,
                v_proj: v_dense,
                o_proj: o_dense,
                ffn_norm: vec![1.0; dim],
                gate_proj: gate_dense,
                up_proj: up_dense,
                down_proj: down_dense,
            }],
            norm: vec![1.0; dim],
            wcls: wcls_dense,
            shared_classifier: false,
        };

        let weights_q8 = LlamaWeights {
            embed_tokens,
            layers: vec![LlamaLayerWeights {
                attn_norm: vec![1.0; dim],
                q_proj: MatMul::from_raw("q_proj", q_raw, dim, dim).unwrap(),
                k_proj: MatMul::from_raw("k_proj", k_raw, kv_dim, dim).unwrap(),
                v_proj: MatMul::from_raw("v_proj", v_raw, kv_dim, dim).unwrap(),
                o_proj: MatMul::from_raw("o_proj", o_raw, dim, dim).unwrap(),
                ffn_norm: vec![1.0; dim],
                gate_proj: MatMul::from_raw("gate_proj", gate_raw, hdim, dim).unwrap(),
                up_proj: MatMul::from_raw("up_proj", up_raw, hdim, dim).unwrap(),
                down_proj: MatMul::from_raw("down_proj", down_raw, dim, hdim).unwrap(),
            }],
            norm: vec![1.0; dim],
            wcls: MatMul::from_raw("wcls", wcls_raw, vocab, dim).unwrap(),
            shared_classifier: false,
        };

        let mut state_dense = LlamaState::new(&config).unwrap();
        let mut state_q8 = LlamaState::new(&config).unwrap();

        for (pos, &tok) in [1i32, 2, 3].iter().enumerate() {
            forward(tok, pos as i32, &config, &mut state_dense, &weights_dense, ComputePath::Cpu, AttentionKernel::Reference).unwrap();
            forward(tok, pos as i32, &config, &mut state_q8, &weights_q8, ComputePath::Cpu, AttentionKernel::Reference).unwrap();
        }

        for (a, b) in state_dense.logits.iter().zip(state_q8.logits.iter()) {
            assert!((a - b).abs() < 1e-2, "a={a} b={b}");
        }
    }

    #[test]
    fn quantized_weight_path_runs_end_to_end_through_matmul() {
        let config = LlamaConfig {
            dim: 32,
            hidden_dim: 32,
            n_layers: 1,
            n_heads: 2,
            n_kv_heads: 2,
            vocab_size: 4,
            seq_len: 4,
            rms_norm_eps: 1e-5,
            rope_base: 10000.0,
        };
        let mut seed = 7u64;
        let dim = config.dim as usize;
        let values: Vec<f32> = (0..dim * dim).map(|_| lcg(&mut seed) * 0.1).collect();
        let dense_w = MatMul::from_dense(values, dim, dim);

        let x: Vec<f32> = (0..dim).map(|_| lcg(&mut seed)).collect();
        let mut out_dense = vec![0.0f32; dim];
        ops::matmul(&mut out_dense, &x, &dense_w);
        assert_eq!(out_dense.len(), dim);
    }
}
