//! Error types for generation runs

use serde::Serialize;
use upstream::UpstreamError;
use upstream::error::is_rate_limit_signal;

/// Why a generation run ended without media.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Unknown model or image count outside the model's bounds
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NoCredentialAvailable(String),

    /// The selected credential could not be refreshed
    #[error("{0}")]
    AuthExchange(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    RateLimited(String),

    /// Slot denied at dispatch time
    #[error("{0}")]
    ConcurrencyExhausted(String),

    /// Poll budget used up
    #[error("{0}")]
    Timeout(String),
}

/// Credential health update owed for a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Penalty {
    None,
    RecordError,
    RateLimitBan,
}

impl GenerationError {
    /// Wrap a backend failure, classifying rate limits.
    pub fn from_upstream(context: &str, error: &UpstreamError) -> Self {
        let message = format!("{context}: {error}");
        if error.is_rate_limited() {
            GenerationError::RateLimited(message)
        } else {
            GenerationError::Upstream(message)
        }
    }

    /// Wrap a failure known only by its text, such as a terminal operation
    /// status. Text carrying a rate-limit signal becomes `RateLimited`.
    pub fn from_failure_text(message: String) -> Self {
        if is_rate_limit_signal(&message) {
            GenerationError::RateLimited(message)
        } else {
            GenerationError::Upstream(message)
        }
    }

    /// Metrics outcome label.
    pub fn label(&self) -> &'static str {
        match self {
            GenerationError::Validation(_) => "validation",
            GenerationError::NoCredentialAvailable(_) => "no_credential",
            GenerationError::AuthExchange(_) => "auth_exchange",
            GenerationError::Upstream(_) => "upstream",
            GenerationError::RateLimited(_) => "rate_limited",
            GenerationError::ConcurrencyExhausted(_) => "concurrency_exhausted",
            GenerationError::Timeout(_) => "timeout",
        }
    }

    pub(crate) fn penalty(&self) -> Penalty {
        match self {
            GenerationError::RateLimited(_) => Penalty::RateLimitBan,
            GenerationError::Upstream(_) | GenerationError::Timeout(_) => Penalty::RecordError,
            // A failed refresh already disabled the credential.
            GenerationError::AuthExchange(_) => Penalty::None,
            GenerationError::Validation(_)
            | GenerationError::NoCredentialAvailable(_)
            | GenerationError::ConcurrencyExhausted(_) => Penalty::None,
        }
    }

    /// Structured body for the final stream event.
    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            message: self.to_string(),
            category: "invalid_request_error",
            code: "generation_failed",
        }
    }
}

/// Error body ending a failed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(rename = "type")]
    pub category: &'static str,
    pub code: &'static str,
}

/// Media cache failure. Never fails a run; logged as a warning.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("download failed: {0}")]
    Download(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for generation runs.
pub type Result<T> = std::result::Result<T, GenerationError>;
