//! Error types shared by refload crates

use thiserror::Error;

/// Result type alias for refload operations
pub type Result<T> = std::result::Result<T, RefloadError>;

/// Main error type for refload
#[derive(Error, Debug)]
pub enum RefloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
