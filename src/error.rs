//! Error types for Voxtral realtime transcription.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Voxtral error types
#[derive(Error, Debug)]
pub enum Error {
    /// Chunk duration must be a positive number of milliseconds
    #[error("invalid chunk duration: {0} ms (must be > 0)")]
    InvalidChunkDuration(i64),

    /// Tokenizer is missing a required special token
    #[error("tokenizer is missing special token {0:?}")]
    MissingSpecialToken(String),

    /// Encoded audio is shorter than the decoder prompt
    #[error("audio too short for prompt: need {required} audio tokens, have {available}")]
    AudioTooShortForPrompt { required: usize, available: usize },

    /// Audio file format is not supported
    #[error("unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),

    /// Audio file could not be read
    #[error("failed to read audio: {0}")]
    FailedToReadAudio(String),

    /// Required model file is missing
    #[error("missing file: {0}")]
    MissingFile(String),

    /// Model directory layout is not recognized
    #[error("unsupported model format: {0}")]
    UnsupportedModelFormat(String),

    /// `--model` argument is neither a directory nor a resolvable repo id
    #[error("invalid model spec: {0}")]
    InvalidModelSpec(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// MLX error
    #[error("MLX error: {0}")]
    Mlx(#[from] mlx_rs::error::Exception),

    /// MLX IO error (from safetensors loading)
    #[error("MLX IO error: {0}")]
    MlxIo(#[from] mlx_rs::error::IoError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
