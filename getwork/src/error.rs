//! Errors surfaced by the getwork work source.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned HTTP {0}")]
    Status(u16),

    #[error("invalid JSON in response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("field `{0}` is not valid hex")]
    BadHex(&'static str),

    #[error("field `{field}` has {got} bytes, expected {expected}")]
    BadLength { field: &'static str, expected: usize, got: usize },

    #[error("field `{0}` missing from getwork result")]
    MissingField(&'static str),

    #[error("malformed long poll URL `{url}`: {reason}")]
    LongPollUrl { url: String, reason: &'static str },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SourceError>;
