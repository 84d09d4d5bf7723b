//! Error types for hermes-train

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("unexpected loss_mask ({0})")]
    UnrecognizedPolicy(String),

    #[error("missing capability: {0}")]
    MissingCapability(String),

    #[error("distributed error: {0}")]
    Distributed(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns a [`Error::Precondition`] from the enclosing function when `cond` is false.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::Error::Precondition(format!($($arg)+)));
        }
    };
}
