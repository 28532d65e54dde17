//! Llama inference library in Rust
//!
//! A minimal implementation of Llama model inference, aligned with
//! LlamaModel in Hugging Face Transformers.

pub mod attention;
pub mod config;
pub mod error;
pub mod generate;
pub mod half;
pub mod model;
pub mod ops;
pub mod quant;
pub mod sample;
pub mod state;
pub mod tokenizer;
pub mod weights;

pub use config::LlamaConfig;
pub use error::{LlamaError, Result};
pub use generate::{GenerationOutput, GenerationStats, Sampler, generate};
pub use model::{AttentionKernel, ComputePath, forward, load_model};
pub use sample::sample;
pub use state::LlamaState;
pub use tokenizer::{Tokenizer, bpe_encode, load_tokenizer};
pub use weights::{LlamaLayerWeights, LlamaWeights};
