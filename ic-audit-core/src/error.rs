//! Error types for ic-audit-core

use thiserror::Error;

/// Main error type for the ic-audit-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The notifier could not reach the audit server
    #[error("connection error: {0}")]
    Connection(String),

    /// A frame received by the server was not a valid envelope
    #[error("decode error: {0}")]
    Decode(String),

    /// An envelope could not be turned into a frame
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Snapshot could not be read or written
    #[error("persistence error at {path}: {message}")]
    Persistence { path: String, message: String },
}

/// Result type alias for ic-audit-core
pub type Result<T> = std::result::Result<T, Error>;
