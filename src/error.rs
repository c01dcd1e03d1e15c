//! Error types shared by every training and inference entry point.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GptError>;

#[derive(Error, Debug)]
pub enum GptError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("shape mismatch for {name}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("unexpected parameter: {0}")]
    UnexpectedParameter(String),

    #[error("malformed checkpoint: {0}")]
    Checkpoint(String),

    #[error("fine-tuning needs a pretrained backbone: no checkpoint was loaded and no pretrained path was given")]
    MissingPretrained,

    #[error("device setup failed: {0}")]
    Device(#[from] rayon::ThreadPoolBuildError),
}

impl GptError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
