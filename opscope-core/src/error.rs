//! Error types for opscope-core

use thiserror::Error;

/// Main error type for the opscope-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level connection failure (retried per the feed policy)
    #[error("connection error: {0}")]
    Connection(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error for inbound payloads
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed message missing required semantic fields
    #[error("validation error on {topic}: {message}")]
    Validation { topic: String, message: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A second analysis session was requested while one is open
    #[error("analysis session already running")]
    SessionConflict,

    /// Analysis job service error (non-2xx status or malformed response)
    #[error("analysis service error: {0}")]
    RemoteService(String),
}

/// Result type alias for opscope-core
pub type Result<T> = std::result::Result<T, Error>;
