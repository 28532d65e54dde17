//! Model weights for Llama, and the tagged dense/quantized matrix variant
//! ("inheritance over tensor backends" instead of a trait object) that lets
//! the rest of the crate call `dot_row` without caring how a matrix is
//! encoded.

use crate::config::LlamaConfig;
use crate::error::{LlamaError, Result};
use crate::quant::{self, BLOCK_SIZE};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Read;

/// Encodings the quantized matmul kernels understand, matching the weight
/// contract consumed from a model loader (§6): `{rows, cols, encoding, bytes}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    F32,
    Q8_0,
    Q4_0,
}

/// A weight matrix as presented by a loader, before the core has checked it
/// against `Configuration`.
#[derive(Debug, Clone)]
pub struct RawMatrix {
    pub rows: usize,
    pub cols: usize,
    pub encoding: Encoding,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
enum MatMulKind {
    Dense(Vec<f32>),
    Q8_0(Vec<u8>),
    Q4_0(Vec<u8>),
}

/// A row-major weight matrix, dense or block-quantized, behind one
/// `dot_row` interface. The driver picks the variant once at load time and
/// never branches on encoding again afterward.
#[derive(Debug, Clone)]
pub struct MatMul {
    pub rows: usize,
    pub cols: usize,
    kind: MatMulKind,
}

impl MatMul {
    /// Validates `raw` against the shape the caller expects and wraps it,
    /// enforcing §6/§7: `WeightShapeMismatch` on a dimension mismatch,
    /// `UnsupportedQuantization` when a quantized matrix's column count is
    /// not a multiple of the block size.
    pub fn from_raw(
        name: &'static str,
        raw: RawMatrix,
        expected_rows: usize,
        expected_cols: usize,
    ) -> Result<Self> {
        if raw.rows != expected_rows || raw.cols != expected_cols {
            return Err(LlamaError::WeightShapeMismatch {
                name,
                expected_rows,
                expected_cols,
                got_rows: raw.rows,
                got_cols: raw.cols,
            });
        }
        match raw.encoding {
            Encoding::F32 => {
                if raw.bytes.len() != raw.rows * raw.cols * 4 {
                    return Err(LlamaError::InvalidModel(format!(
                        "{name}: expected {} bytes of f32 data, got {}",
                        raw.rows * raw.cols * 4,
                        raw.bytes.len()
                    )));
                }
                let mut values = vec![0.0f32; raw.rows * raw.cols];
                for (dst, src) in values.iter_mut().zip(raw.bytes.chunks_exact(4)) {
                    *dst = f32::from_le_bytes(src.try_into().unwrap());
                }
                Ok(MatMul {
                    rows: raw.rows,
                    cols: raw.cols,
                    kind: MatMulKind::Dense(values),
                })
            }
            Encoding::Q8_0 => {
                if raw.cols % BLOCK_SIZE != 0 {
                    return Err(LlamaError::UnsupportedQuantization(format!(
                        "{name}: Q8_0 requires cols ({}) to be a multiple of {BLOCK_SIZE}",
                        raw.cols
                    )));
                }
                Ok(MatMul {
                    rows: raw.rows,
                    cols: raw.cols,
                    kind: MatMulKind::Q8_0(raw.bytes),
                })
            }
            Encoding::Q4_0 => {
                if raw.cols % BLOCK_SIZE != 0 {
                    return Err(LlamaError::UnsupportedQuantization(format!(
                        "{name}: Q4_0 requires cols ({}) to be a multiple of {BLOCK_SIZE}",
                        raw.cols
                    )));
                }
                Ok(MatMul {
                    rows: raw.rows,
                    cols: raw.cols,
                    kind: MatMulKind::Q4_0(raw.bytes),
                })
            }
        }
    }

    /// Wraps an already-dense row-major matrix, bypassing shape validation.
    /// Used by the legacy flat-checkpoint loader, which trusts its own
    /// slicing arithmetic.
    pub fn from_dense(values: Vec<f32>, rows: usize, cols: usize) -> Self {
        debug_assert_eq!(values.len(), rows * cols);
        MatMul {
            rows,
            cols,
            kind: MatMulKind::Dense(values),
        }
    }

    /// Computes `Σⱼ W[row, j] · x[j]` for one output row, dispatching on the
    /// matrix's encoding.
    #[inline]
    pub fn dot_row(&self, row: usize, x: &[f32]) -> f32 {
        match &self.kind {
            MatMulKind::Dense(values) => {
                let off = row * self.cols;
                let w = &values[off..off + self.cols];
                let mut sum = 0.0f32;
                for j in 0..self.cols {
                    sum += w[j] * x[j];
                }
                sum
            }
            MatMulKind::Q8_0(bytes) => quant::dot_row_q8_0(bytes, row, self.cols, x),
            MatMulKind::Q4_0(bytes) => quant::dot_row_q4_0(bytes, row, self.cols, x),
        }
    }
}

/// Weights for a single decoder layer.
#[derive(Debug, Clone)]
pub struct LlamaLayerWeights {
    /// Input RMSNorm weights (input_layernorm)
    pub attn_norm: Vec<f32>,
    /// Query projection (self_attn.q_proj.weight)
    pub q_proj: MatMul,
    /// Key projection (self_attn.k_proj.weight)
    pub k_proj: MatMul,
    /// Value projection (self_attn.v_proj.weight)
    pub v_proj: MatMul,
    /// Output projection (self_attn.o_proj.weight)
    pub o_proj: MatMul,
    /// Post-attention RMSNorm weights (post_attention_layernorm)
    pub ffn_norm: Vec<f32>,
    /// Gate projection in MLP (mlp.gate_proj.weight)
    pub gate_proj: MatMul,
    /// Up projection in MLP (mlp.up_proj.weight)
    pub up_proj: MatMul,
    /// Down projection in MLP (mlp.down_proj.weight)
    pub down_proj: MatMul,
}

/// All model parameters, aligned with LlamaModel weights in Transformers.
#[derive(Debug, Clone)]
pub struct LlamaWeights {
    /// Token embeddings (model.embed_tokens.weight)
    pub embed_tokens: Vec<f32>,
    /// Decoder layers (model.layers)
    pub layers: Vec<LlamaLayerWeights>,
    /// Final RMSNorm (model.norm.weight)
    pub norm: Vec<f32>,
    /// Classifier projection (lm_head.weight). May be a separate copy of
    /// `embed_tokens` (tied embeddings) or an independently trained matrix.
    pub wcls: MatMul,
    /// Whether `wcls` was loaded as a copy of `embed_tokens` rather than an
    /// independently stored matrix. Informational only: the core always
    /// reads through `wcls`.
    pub shared_classifier: bool,
}

impl LlamaWeights {
    /// Load weights from a binary reader using the flat legacy checkpoint
    /// layout: every matrix is f32, row-major, with no explicit shape header
    /// beyond what `Configuration` already implies, and the classifier is
    /// tied to the token embedding.
    pub fn load<R: Read>(reader: &mut R, config: &LlamaConfig) -> Result<Self> {
        let dim = config.dim as usize;
        let hdim = config.hidden_dim as usize;
        let n_layers = config.n_layers as usize;
        let vocab = config.vocab_size as usize;
        let kv_dim = config.kv_dim();

        // Read embed_tokens
        let embed_tokens = read_f32_vec(reader, vocab * dim)?;

        // Read flat weight buffers
        let rms_att_flat = read_f32_vec(reader, n_layers * dim)?;
        let wq_flat = read_f32_vec(reader, n_layers * dim * dim)?;
        let wk_flat = read_f32_vec(reader, n_layers * dim * kv_dim)?;
        let wv_flat = read_f32_vec(reader, n_layers * dim * kv_dim)?;
        let wo_flat = read_f32_vec(reader, n_layers * dim * dim)?;
        let rms_ffn_flat = read_f32_vec(reader, n_layers * dim)?;
        let gate_flat = read_f32_vec(reader, n_layers * hdim * dim)?;
        let down_flat = read_f32_vec(reader, n_layers * dim * hdim)?;
        let up_flat = read_f32_vec(reader, n_layers * hdim * dim)?;
        let norm = read_f32_vec(reader, dim)?;

        // Build per-layer weights
        let mut layers = Vec::with_capacity(n_layers);
        for l in 0..n_layers {
            let attn_norm = rms_att_flat[l * dim..(l + 1) * dim].to_vec();
            let q_proj = wq_flat[l * dim * dim..(l + 1) * dim * dim].to_vec();
            let k_proj = wk_flat[l * dim * kv_dim..(l + 1) * dim * kv_dim].to_vec();
            let v_proj = wv_flat[l * dim * kv_dim..(l + 1) * dim * kv_dim].to_vec();
            let o_proj = wo_flat[l * dim * dim..(l + 1) * dim * dim].to_vec();
            let ffn_norm = rms_ffn_flat[l * dim..(l + 1) * dim].to_vec();
            let gate_proj = gate_flat[l * hdim * dim..(l + 1) * hdim * dim].to_vec();
            let down_proj = down_flat[l * dim * hdim..(l + 1) * dim * hdim].to_vec();
            let up_proj = up_flat[l * hdim * dim..(l + 1) * hdim * dim].to_vec();

            layers.push(LlamaLayerWeights {
                attn_norm,
                q_proj: MatMul::from_dense(q_proj, dim, dim),
                k_proj: MatMul::from_dense(k_proj, kv_dim, dim),
                v_proj: MatMul::from_dense(v_proj, kv_dim, dim),
                o_proj: MatMul::from_dense(o_proj, dim, dim),
                ffn_norm,
                gate_proj: MatMul::from_dense(gate_proj, hdim, dim),
                up_proj: MatMul::from_dense(up_proj, hdim, dim),
                down_proj: MatMul::from_dense(down_proj, dim, hdim),
            });
        }

        let wcls = MatMul::from_dense(embed_tokens.clone(), vocab, dim);

        Ok(LlamaWeights {
            embed_tokens,
            layers,
            norm,
            wcls,
            shared_classifier: true,
        })
    }
}

/// Read a vector of f32 values from the reader.
fn read_f32_vec<R: Read>(reader: &mut R, count: usize) -> Result<Vec<f32>> {
    let mut buf = vec![0f32; count];
    for v in buf.iter_mut() {
        *v = reader.read_f32::<LittleEndian>()?;
    }
    Ok(buf)
}
