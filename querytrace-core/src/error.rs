//! Error types for querytrace-core
//!
//! None of these ever reach the instrumentation caller: the event path
//! logs and moves on. They surface from configuration loading, the
//! poster transport, and server inspection.

use thiserror::Error;

/// Main error type for the querytrace-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Monitoring endpoint transport error
    #[error("poster error: {0}")]
    Poster(String),

    /// Server inspection (uuid lookup, EXPLAIN) failed
    #[error("inspector error: {0}")]
    Inspector(String),

    /// Background runtime could not be started or stopped
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Result type alias for querytrace-core
pub type Result<T> = std::result::Result<T, Error>;
