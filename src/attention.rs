//! Causal self-attention: the reference per-head formulation (§4.6) and the
//! tiled online-softmax "flash" variant (§4.7). Both read the same KV cache
//! slices and write the same `xb` layout, so the per-layer driver can swap
//! one for the other without touching anything else.

use rayon::prelude::*;

/// Default tile width `C` for the flash variant (§4.7 names 4 as the
/// example).
pub const DEFAULT_TILE_SIZE: usize = 4;

/// Reference attention: heads are embarrassingly parallel (§5), so each
/// head's score/softmax/weighted-sum is computed independently, using its
/// own disjoint slice of the persistent `att` scratch (`att_scratch`, laid
/// out `[n_heads][context_length]` per the data model in §3) and writing
/// its own disjoint slice of `xb` — no two heads ever touch the same
/// memory, so no synchronization is needed between them.
#[allow(clippy::too_many_arguments)]
pub fn attention_reference(
    xb: &mut [f32],
    q: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    att_scratch: &mut [f32],
    context_length: usize,
    pos: usize,
    n_heads: usize,
    head_size: usize,
    kv_dim: usize,
    group_size: usize,
) {
    let scale = 1.0 / (head_size as f32).sqrt();
    xb.par_chunks_mut(head_size)
        .zip(att_scratch.par_chunks_mut(context_length))
        .enumerate()
        .for_each(|(h, (xb_h, att_row))| {
            let q_off = h * head_size;
            let qh = &q[q_off..q_off + head_size];
            let kv_h = h / group_size;
            let att = &mut att_row[..=pos];

            for (t, slot) in att.iter_mut().enumerate() {
                let k_off = t * kv_dim + kv_h * head_size;
                let k = &key_cache[k_off..k_off + head_size];
                let mut score = 0.0f32;
                for i in 0..head_size {
                    score += qh[i] * k[i];
                }
                *slot = score * scale;
            }
            softmax_causal_with_fallback(att);

            xb_h.fill(0.0);
            for (t, &a) in att.iter().enumerate() {
                let v_off = t * kv_dim + kv_h * head_size;
                let v = &value_cache[v_off..v_off + head_size];
                for i in 0..head_size {
                    xb_h[i] += a * v[i];
                }
            }
        });
}

/// Softmax over `[0, pos]` with max-subtraction, falling back to a uniform
/// distribution when the denominator underflows to zero (defensive against
/// large negative scores; `NumericUnderflow` recovered locally per §7).
fn softmax_causal_with_fallback(att: &mut [f32]) {
    let max_val = att.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max_val == f32::NEG_INFINITY {
        let uniform = 1.0 / att.len() as f32;
        att.fill(uniform);
        return;
    }
    let mut sum = 0.0f32;
    for a in att.iter_mut() {
        *a = (*a - max_val).exp();
        sum += *a;
    }
    if sum == 0.0 {
        let uniform = 1.0 / att.len() as f32;
        att.fill(uniform);
    } else {
        for a in att.iter_mut() {
            *a /= sum;
        }
    }
}

/// Tiled flash attention with online softmax (§4.7). One (simulated) work
/// group per head; within a head, time positions are walked in tiles of
/// `tile_size`. The running `(max, sum, output)` triple is the accelerator's
/// per-thread state made explicit, since there is no real shared-memory
/// work group on the CPU path — the barrier comments below mark where a
/// real accelerator binding would need B1-B6 from §5.
#[allow(clippy::too_many_arguments)]
pub fn attention_flash(
    xb: &mut [f32],
    q: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    pos: usize,
    n_heads: usize,
    head_size: usize,
    kv_dim: usize,
    group_size: usize,
    tile_size: usize,
) {
    let scale = 1.0 / (head_size as f32).sqrt();
    let num_positions = pos + 1;

    let head_outputs: Vec<Vec<f32>> = (0..n_heads)
        .into_par_iter()
        .map(|h| {
            // B1: cooperative load of q into shared memory (here: a plain
            // slice reference, since this thread owns the whole head).
            let q_off = h * head_size;
            let qh = &q[q_off..q_off + head_size];
            let kv_h = h / group_size;

            let mut running_max = f32::NEG_INFINITY;
            let mut running_sum = 0.0f32;
            let mut out = vec![0.0f32; head_size];

            let mut tile_start = 0usize;
            while tile_start < num_positions {
                let tile_end = (tile_start + tile_size).min(num_positions);
                let valid_count = tile_end - tile_start;

                // B2: cooperative load of this tile's K/V rows, then each
                // thread computes one score into its own slot of s_tile.
                let mut s_tile = vec![0.0f32; valid_count];
                for (t, slot) in s_tile.iter_mut().enumerate() {
                    let abs_pos = tile_start + t;
                    let k_off = abs_pos * kv_dim + kv_h * head_size;
                    let k = &key_cache[k_off..k_off + head_size];
                    let mut score = 0.0f32;
                    for i in 0..head_size {
                        score += qh[i] * k[i];
                    }
                    *slot = score * scale;
                }
                // B3: barrier after all per-thread scores are written.

                // B4: tile-max broadcast, in a cell distinct from s_tile so
                // the max is available to every thread without racing the
                // scores it was computed from.
                let tile_max = s_tile.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

                let new_max = running_max.max(tile_max);
                if new_max > running_max && running_max != f32::NEG_INFINITY {
                    let correction = (running_max - new_max).exp();
                    running_sum *= correction;
                    for v in out.iter_mut() {
                        *v *= correction;
                    }
                }
                running_max = new_max;

                for (t, &score) in s_tile.iter().enumerate() {
                    let weight = (score - running_max).exp();
                    running_sum += weight;
                    let abs_pos = tile_start + t;
                    let v_off = abs_pos * kv_dim + kv_h * head_size;
                    let v = &value_cache[v_off..v_off + head_size];
                    for i in 0..head_size {
                        out[i] += weight * v[i];
                    }
                }
                // B5: barrier before the next tile reuses s_tile's storage.
                tile_start += tile_size;
            }

            if running_sum > 0.0 {
                let inv = 1.0 / running_sum;
                for v in out.iter_mut() {
                    *v *= inv;
                }
            } else {
                for v in out.iter_mut() {
                    *v = 0.0;
                }
            }
            out
        })
        .collect();

    for (h, out) in head_outputs.into_iter().enumerate() {
        let off = h * head_size;
        xb[off..off + head_size].copy_from_slice(&out);
    }
}
