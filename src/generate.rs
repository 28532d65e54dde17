//! Generation loop (§4.9): prompt ingestion vs. sampled decoding, stop-token
//! handling, throughput reporting. Wraps the per-token `forward` driver from
//! `model.rs` into the session-level `generate()` entry point from §6.

use crate::config::LlamaConfig;
use crate::error::Result;
use crate::model::{AttentionKernel, ComputePath, forward};
use crate::state::LlamaState;
use crate::weights::LlamaWeights;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Sampler contract from §6: a pure function from the core's perspective,
/// given `logits[vocab]` it returns a single token id. A blanket impl below
/// lets any `FnMut(&mut [f32]) -> i32` closure (e.g. `sample::sample`
/// partially applied) serve as a `Sampler` directly.
pub trait Sampler {
    fn sample(&mut self, logits: &mut [f32]) -> i32;
}

impl<F: FnMut(&mut [f32]) -> i32> Sampler for F {
    fn sample(&mut self, logits: &mut [f32]) -> i32 {
        self(logits)
    }
}

/// Wall-clock throughput over one `generate()` call (§4.9: "report wall-clock
/// prompt-eval and generation throughput on exit").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub prompt_eval_time: Duration,
    pub generated_tokens: usize,
    pub generation_time: Duration,
}

impl GenerationStats {
    pub fn prompt_tokens_per_sec(&self) -> f64 {
        if self.prompt_eval_time.is_zero() {
            return 0.0;
        }
        self.prompt_tokens as f64 / self.prompt_eval_time.as_secs_f64()
    }

    pub fn generated_tokens_per_sec(&self) -> f64 {
        if self.generation_time.is_zero() {
            return 0.0;
        }
        self.generated_tokens as f64 / self.generation_time.as_secs_f64()
    }
}

/// Result of a `generate()` call: the sampled tokens (prompt tokens forced
/// during ingestion are never included, per §4.9) plus throughput stats.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub tokens: Vec<i32>,
    pub stats: GenerationStats,
}

/// Runs the generation loop described in §4.9.
///
/// `max_tokens` is clamped to `config.seq_len` (the budget is a count of
/// *positions processed*, i.e. forward-pass steps, not just sampled tokens).
/// Ingesting the prompt consumes budget exactly like sampled decoding does:
/// once the prompt is exhausted, a token is only sampled if there is still
/// room in the budget for the forward pass that would consume it on the next
/// iteration — otherwise the loop ends without sampling. In particular, a
/// prompt exactly as long as `contextLength` leaves no budget after
/// ingestion, so `tokens` comes back empty: there was never room to run a
/// forward pass on anything sampled.
///
/// `echo` is accepted for parity with the external interface in §6/§4.9 but
/// has no effect here: forced prompt tokens are never appended to `tokens`
/// nor passed to `on_token`, unconditionally, regardless of `echo` — §4.9 is
/// explicit that the callback never sees them. A caller that wants the
/// prompt echoed back (the usual reason to set `echo`) must decode and print
/// it itself before calling `generate()`.
#[allow(clippy::too_many_arguments)]
pub fn generate<S: Sampler>(
    weights: &LlamaWeights,
    state: &mut LlamaState,
    config: &LlamaConfig,
    start_position: i32,
    prompt: &[i32],
    stop: &HashSet<i32>,
    max_tokens: usize,
    sampler: &mut S,
    _echo: bool,
    mut on_token: impl FnMut(i32),
    path: ComputePath,
    attn: AttentionKernel,
) -> Result<GenerationOutput> {
    let budget = max_tokens.min(config.seq_len as usize);
    let mut generated = Vec::new();

    if prompt.is_empty() || budget == 0 {
        return Ok(GenerationOutput {
            tokens: generated,
            stats: GenerationStats {
                prompt_tokens: 0,
                prompt_eval_time: Duration::ZERO,
                generated_tokens: 0,
                generation_time: Duration::ZERO,
            },
        });
    }

    let mut pos = start_position;
    let mut token = prompt[0];
    let mut prompt_index = 1usize;

    let loop_start = Instant::now();
    let mut prompt_eval_time = Duration::ZERO;
    let mut prompt_eval_done = false;

    loop {
        if (pos as usize) >= start_position as usize + budget {
            break;
        }

        forward(token, pos, config, state, weights, path, attn)?;
        state.latest_token = token;

        let steps_done = (pos as usize) - start_position as usize + 1;
        let have_budget_for_next = steps_done < budget;

        if prompt_index < prompt.len() {
            // Prompt ingestion: force the next token. Never appended to
            // `generated`, never passed to `on_token` — §4.9 is unconditional
            // about this, so `_echo` cannot override it here.
            let forced = prompt[prompt_index];
            prompt_index += 1;
            token = forced;
        } else {
            if !prompt_eval_done {
                prompt_eval_time = loop_start.elapsed();
                prompt_eval_done = true;
            }
            if !have_budget_for_next {
                // No room to run forward on a freshly sampled token; per
                // §4.9 there is nothing left to do.
                break;
            }
            let next = sampler.sample(&mut state.logits);
            generated.push(next);
            on_token(next);
            if stop.contains(&next) {
                pos += 1;
                break;
            }
            token = next;
        }

        pos += 1;
    }

    let total_elapsed = loop_start.elapsed();
    let generation_time = total_elapsed.saturating_sub(prompt_eval_time);
    let prompt_tokens = prompt_index.min(prompt.len());
    let generated_tokens = generated.len();

    Ok(GenerationOutput {
        tokens: generated,
        stats: GenerationStats {
            prompt_tokens,
            prompt_eval_time,
            generated_tokens,
            generation_time,
        },
    })
}
