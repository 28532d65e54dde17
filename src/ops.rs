//! Core numeric kernels: RMS normalization, matrix-vector multiplication
//! against dense or quantized weights, activations, and RoPE rotation.

use crate::weights::MatMul;
use rayon::prelude::*;

/// Default RMSNorm epsilon, aligned with rms_norm_eps in Transformers. Models
/// loaded with their own epsilon should carry it on `LlamaConfig` instead;
/// this constant only backs the convenience fixed-eps callers that don't.
pub const RMS_EPS: f32 = 1e-5;

/// RMS normalization: `out[i] = weight[i] * x[i] / sqrt(mean(x^2) + eps)`.
/// Tolerates `dest` aliasing `src` (`out === x`) since the sum-of-squares
/// pass over `src` completes before `dest` is written.
#[inline]
pub fn rmsnorm(dest: &mut [f32], src: &[f32], weight: &[f32], eps: f32) {
    let n = src.len();
    let ss: f32 = src.iter().map(|v| v * v).sum();
    let inv = 1.0 / (ss / n as f32 + eps).sqrt();
    for i in 0..dest.len() {
        dest[i] = weight[i] * (inv * src[i]);
    }
}

/// Phase 1 (P1) of the two-phase accelerator RMSNorm split: writes partial
/// block sums of `x^2` to `scratch[1..=num_blocks]` and the combined scalar
/// `1/sqrt(mean(x^2) + eps)` to `scratch[0]`. `scratch` must have at least
/// `num_blocks + 1` slots, where `num_blocks = ceil(size / local_mem_size)`.
/// Unlike a work group that can only assume `local_mem_size` divides `size`
/// evenly, this combines over the true `num_blocks` partial sums and divides
/// by the true `size`, so it stays correct for any `size` regardless of
/// whether `local_mem_size` divides it evenly.
pub fn rmsnorm_reduce(scratch: &mut [f32], src: &[f32], local_mem_size: usize, eps: f32) -> usize {
    let size = src.len();
    let num_blocks = size.div_ceil(local_mem_size);
    assert!(
        scratch.len() >= num_blocks + 1,
        "rmsnorm scratch buffer too small: need {}, have {}",
        num_blocks + 1,
        scratch.len()
    );
    for b in 0..num_blocks {
        let start = b * local_mem_size;
        let end = (start + local_mem_size).min(size);
        scratch[1 + b] = src[start..end].iter().map(|v| v * v).sum();
    }
    let ss: f32 = scratch[1..=num_blocks].iter().sum();
    scratch[0] = 1.0 / (ss / size as f32 + eps).sqrt();
    num_blocks
}

/// Phase 2 (P2) of the two-phase accelerator RMSNorm split: applies the
/// scalar left in `scratch[0]` by `rmsnorm_reduce` elementwise.
#[inline]
pub fn rmsnorm_scale(dest: &mut [f32], src: &[f32], weight: &[f32], scratch: &[f32]) {
    let inv = scratch[0];
    for i in 0..dest.len() {
        dest[i] = weight[i] * (inv * src[i]);
    }
}

/// Matrix-vector multiplication: `xout[r] = W[r, :] . x`, `r` in `[0, rows)`.
/// Rows are independent (one output slot each), so they are computed across
/// a thread pool with no ordering guarantee among workers — the CPU
/// analogue of "one work group per output row" (§4.2).
#[inline]
pub fn matmul(xout: &mut [f32], x: &[f32], w: &MatMul) {
    xout.par_iter_mut()
        .enumerate()
        .for_each(|(r, out)| *out = w.dot_row(r, x));
}

/// Matrix-vector multiplication with residual accumulation:
/// `xout[r] += W[r, :] . x`, reading the old `xout[r]` exactly once.
#[inline]
pub fn matmul_accum(xout: &mut [f32], x: &[f32], w: &MatMul) {
    xout.par_iter_mut()
        .enumerate()
        .for_each(|(r, out)| *out += w.dot_row(r, x));
}

/// Fused SwiGLU matmul (§4.5): computes `g = w1 . x`, `u = w3 . x`, and
/// writes `silu(g) * u` directly, never materializing `g` and `u` in
/// separate buffers the way an unfused two-matmul-plus-elementwise path
/// would.
#[inline]
pub fn matmul_swiglu(hb: &mut [f32], x: &[f32], w1: &MatMul, w3: &MatMul) {
    hb.par_iter_mut().enumerate().for_each(|(r, out)| {
        let gate = w1.dot_row(r, x);
        let up = w3.dot_row(r, x);
        *out = silu(gate) * up;
    });
}

/// Element-wise accumulation: a += b.
#[inline]
pub fn accum(a: &mut [f32], b: &[f32]) {
    for (ai, bi) in a.iter_mut().zip(b.iter()) {
        *ai += *bi;
    }
}

/// Softmax in-place, with max-subtraction for numerical stability. Leaves an
/// empty slice untouched; does not apply the uniform-fallback defensive
/// behavior that attention-specific softmax needs on a zero denominator —
/// see `attention::softmax_causal`.
#[inline]
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let max_val = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for xi in x.iter_mut() {
        *xi = (*xi - max_val).exp();
        sum += *xi;
    }
    for xi in x.iter_mut() {
        *xi /= sum;
    }
}

/// SiLU (swish) activation: `z / (1 + e^-z)`.
#[inline]
pub fn silu(z: f32) -> f32 {
    z / (1.0 + (-z).exp())
}

/// GELU activation (tanh approximation). Provided alongside `silu` per
/// §4.5 but not used by the default SwiGLU path.
#[inline]
pub fn gelu(z: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.7978845608028654;
    0.5 * z * (1.0 + (SQRT_2_OVER_PI * (z + 0.044715 * z * z * z)).tanh())
}

/// Applies rotary position embedding to a query vector and, for the leading
/// `k.len()` dimensions shared with the key vector, to the key vector too
/// (§4.4). `head_size` must evenly divide `q.len()`; `k.len()` (kvDim) need
/// not be a multiple of `head_size` beyond what `LlamaConfig` guarantees.
#[inline]
pub fn apply_rope(q: &mut [f32], k: &mut [f32], pos: i32, head_size: usize, base: f32) {
    let kv_dim = k.len();
    let head_size_f = head_size as f32;
    let mut i = 0usize;
    while i < q.len() {
        let head_dim = (i % head_size) as f32;
        let freq = 1.0 / base.powf(head_dim / head_size_f);
        let theta = pos as f32 * freq;
        let (s, c) = theta.sin_cos();

        let (q0, q1) = rotate_pair(q[i], q[i + 1], c, s);
        q[i] = q0;
        q[i + 1] = q1;

        if i < kv_dim {
            let (k0, k1) = rotate_pair(k[i], k[i + 1], c, s);
            k[i] = k0;
            k[i + 1] = k1;
        }
        i += 2;
    }
}

#[inline]
fn rotate_pair(x0: f32, x1: f32, c: f32, s: f32) -> (f32, f32) {
    (x0 * c - x1 * s, x0 * s + x1 * c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmsnorm_zero_input_is_zero() {
        let weight = vec![1.0f32; 4];
        let x = vec![0.0f32; 4];
        let mut out = vec![0.0f32; 4];
        rmsnorm(&mut out, &x, &weight, 1e-5);
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn rmsnorm_scale_property_with_unit_weight() {
        let weight = vec![1.0f32; 6];
        let x = vec![1.0, -2.0, 3.0, 0.5, -0.5, 2.0f32];
        let eps = 1e-5f32;
        let mut out = vec![0.0f32; 6];
        rmsnorm(&mut out, &x, &weight, eps);

        let size = x.len() as f32;
        let sum_sq_x: f32 = x.iter().map(|v| v * v).sum();
        let expected_sum_sq_out = size / (1.0 + eps * size / sum_sq_x);
        let got_sum_sq_out: f32 = out.iter().map(|v| v * v).sum();
        assert!((got_sum_sq_out - expected_sum_sq_out).abs() < 1e-2);
    }

    #[test]
    fn rmsnorm_tolerates_in_place() {
        let weight = vec![2.0f32; 4];
        let mut x = vec![1.0, 2.0, 3.0, 4.0f32];
        let expected_ref = {
            let mut out = vec![0.0f32; 4];
            rmsnorm(&mut out, &x.clone(), &weight, 1e-5);
            out
        };
        let x_clone = x.clone();
        rmsnorm(&mut x, &x_clone, &weight, 1e-5);
        for (a, b) in x.iter().zip(expected_ref.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn two_phase_rmsnorm_matches_single_shot() {
        let weight = vec![1.5f32; 10];
        let x: Vec<f32> = (0..10).map(|i| i as f32 - 4.0).collect();
        let eps = 1e-5f32;

        let mut expected = vec![0.0f32; 10];
        rmsnorm(&mut expected, &x, &weight, eps);

        let local_mem_size = 3; // does not evenly divide 10
        let num_blocks = (10usize).div_ceil(local_mem_size);
        let mut scratch = vec![0.0f32; num_blocks + 1];
        rmsnorm_reduce(&mut scratch, &x, local_mem_size, eps);
        let mut got = vec![0.0f32; 10];
        rmsnorm_scale(&mut got, &x, &weight, &scratch);

        for (a, b) in got.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-4, "a={a} b={b}");
        }
    }

    #[test]
    fn matmul_is_linear() {
        let w = MatMul::from_dense(vec![1.0, -2.0, 0.5, 3.0, 1.0, -1.0], 2, 3);
        let a = [1.0f32, 2.0, 3.0];
        let b = [0.5f32, -1.0, 2.0];
        let sum: Vec<f32> = a.iter().zip(b.iter()).map(|(x, y)| x + y).collect();

        let mut out_a = vec![0.0; 2];
        let mut out_b = vec![0.0; 2];
        let mut out_sum = vec![0.0; 2];
        matmul(&mut out_a, &a, &w);
        matmul(&mut out_b, &b, &w);
        matmul(&mut out_sum, &sum, &w);

        for i in 0..2 {
            assert!((out_sum[i] - (out_a[i] + out_b[i])).abs() < 1e-4);
        }
    }

    #[test]
    fn rope_preserves_pair_norm() {
        let mut q = [3.0f32, 4.0, -1.0, 2.0];
        let mut k = [0.0f32; 0];
        let before: f32 = q.chunks(2).map(|p| p[0] * p[0] + p[1] * p[1]).sum();
        apply_rope(&mut q, &mut k, 17, 2, 10000.0);
        let after: f32 = q.chunks(2).map(|p| p[0] * p[0] + p[1] * p[1]).sum();
        assert!((before - after).abs() < 1e-3);
    }

    #[test]
    fn rope_forward_then_backward_is_identity() {
        let original = [1.0f32, 2.0, -3.0, 0.5];
        let mut q = original;
        let mut k = [0.0f32; 0];
        apply_rope(&mut q, &mut k, 5, 2, 10000.0);
        apply_rope(&mut q, &mut k, -5, 2, 10000.0);
        for (a, b) in q.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-3, "a={a} b={b}");
        }
    }

    #[test]
    fn rope_leaves_k_untouched_past_kv_dim() {
        let mut q = [1.0f32, 2.0, 3.0, 4.0];
        let mut k = [5.0f32, 6.0]; // kv_dim smaller than q's dim
        apply_rope(&mut q, &mut k, 3, 2, 10000.0);
        // k's single pair should have rotated (i=0 < kv_dim=2)
        assert_ne!(k[0], 5.0);
    }
}
