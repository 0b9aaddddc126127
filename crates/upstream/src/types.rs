//! Typed values crossing the upstream boundary

use chrono::{DateTime, Utc};

/// Result of exchanging a long-lived secret.
#[derive(Debug, Clone)]
pub struct SessionExchange {
    pub short_lived_secret: String,
    /// `None` when the backend did not report an expiry
    pub expires_at: Option<DateTime<Utc>>,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreditBalance {
    pub credits: i64,
    pub tier: Option<String>,
}

/// Image generation submission.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub workspace_id: String,
    pub prompt: String,
    pub model_name: String,
    pub aspect_ratio: String,
    /// Asset handles from `upload_asset`, in upload order
    pub reference_assets: Vec<String>,
    pub challenge_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageResult {
    pub result_urls: Vec<String>,
}

/// Frames or references a video is conditioned on.
#[derive(Debug, Clone, PartialEq)]
pub enum VideoInput {
    Text,
    StartEnd { start: String, end: Option<String> },
    References(Vec<String>),
}

/// Video generation submission.
#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub workspace_id: String,
    pub prompt: String,
    pub model_key: String,
    pub aspect_ratio: String,
    pub paygate_tier: String,
    pub input: VideoInput,
    pub challenge_token: Option<String>,
}

/// Opaque reference to a long-running backend operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationHandle {
    pub name: String,
    pub scene_id: Option<String>,
    pub status: Option<String>,
}

/// Outcome of a single poll.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    Pending,
    Succeeded { result_url: String },
    Failed { status: String },
}
