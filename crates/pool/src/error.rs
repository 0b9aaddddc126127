//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential not found: {0}")]
    NotFound(u64),

    #[error("Token already exists (email: {0})")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] store::Error),

    /// Session exchange failed; the refresh path also disables the credential
    #[error("authentication exchange failed: {0}")]
    AuthExchange(String),

    #[error("upstream error: {0}")]
    Upstream(#[from] upstream::UpstreamError),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
