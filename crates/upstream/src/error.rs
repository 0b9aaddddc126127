//! Error types for upstream calls

/// Errors from backend calls.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Session token rejected or the exchange response was unusable
    #[error("authentication exchange failed: {0}")]
    AuthExchange(String),

    /// Backend answered 429
    #[error("HTTP Error 429: {0}")]
    RateLimited(String),

    #[error("HTTP Error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid upstream response: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Whether this failure should put the credential in rate-limit ban.
    ///
    /// The backend sometimes wraps a 429 inside another error body, so the
    /// message is checked as well as the variant.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            UpstreamError::RateLimited(_) => true,
            other => is_rate_limit_signal(&other.to_string()),
        }
    }
}

/// Detect a rate-limit signal in free-form error text.
pub fn is_rate_limit_signal(text: &str) -> bool {
    const PATTERNS: &[&str] = &["429", "resource_exhausted", "too many requests"];
    let lower = text.to_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}

/// Failure to produce a challenge token.
#[derive(Debug, thiserror::Error)]
#[error("challenge token unavailable: {0}")]
pub struct ChallengeError(pub String);

/// Result alias for upstream calls.
pub type Result<T> = std::result::Result<T, UpstreamError>;
