//! Error types for store operations

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("store parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store is closed")]
    Closed,
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
