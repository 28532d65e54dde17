//! Error types for Llama inference.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlamaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid model file: {0}")]
    InvalidModel(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Configuration violates an invariant from the data model (e.g. `dim`
    /// not divisible by `n_heads`, or `n_heads` not a multiple of
    /// `n_kv_heads`). Fatal at state creation.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// A weight's declared shape disagrees with what `Configuration` expects
    /// for that matrix. Fatal at load time.
    #[error(
        "weight shape mismatch for {name}: expected {expected_rows}x{expected_cols}, got {got_rows}x{got_cols}"
    )]
    WeightShapeMismatch {
        name: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        got_rows: usize,
        got_cols: usize,
    },

    /// `position >= context_length`. Fatal for the session.
    #[error("position {position} out of range (context length {context_length})")]
    PositionOutOfRange {
        position: usize,
        context_length: usize,
    },

    /// A weight's encoding is not one the quantized matmul kernels support.
    /// Fatal at load time.
    #[error("unsupported quantization encoding: {0}")]
    UnsupportedQuantization(String),
}

pub type Result<T> = std::result::Result<T, LlamaError>;
