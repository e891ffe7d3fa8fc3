//! Custom error types for code-search
//!
//! Uses thiserror for ergonomic error definitions with automatic
//! Display and Error trait implementations.

use thiserror::Error;

/// Application-specific errors for code-search
#[derive(Error, Debug)]
pub enum SearchError {
    /// IO operations failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedding model failed to load or embed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Vector store operations failed
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON parsing failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No index exists at the expected location
    #[error("No index found. Run `code-search index` first.")]
    NoIndex,

    /// Invalid file or directory path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Missing or malformed query
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker lifecycle or transport errors
    #[error("Worker error: {0}")]
    Worker(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, SearchError>;
