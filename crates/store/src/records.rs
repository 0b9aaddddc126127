//! Persisted record types
//!
//! Timestamps are UTC. Secrets are wrapped in `common::Secret` so a stray
//! `{:?}` on a credential never prints token material.

use chrono::{DateTime, NaiveDate, Utc};
use common::Secret;
use serde::{Deserialize, Serialize};

/// Kind of media an operation produces. Drives capability flags, slot
/// counters and usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn label(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

/// Why a credential was taken out of rotation.
///
/// Only `RateLimited` is eligible for automatic reactivation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanReason {
    #[default]
    None,
    RateLimited,
    ConsecutiveErrors,
}

impl BanReason {
    pub fn label(&self) -> &'static str {
        match self {
            BanReason::None => "none",
            BanReason::RateLimited => "rate_limited",
            BanReason::ConsecutiveErrors => "consecutive_errors",
        }
    }
}

/// One upstream identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: u64,
    /// Session token exchanged for short-lived access tokens
    pub long_lived_secret: Secret<String>,
    /// Current access token, absent until the first exchange
    #[serde(default)]
    pub short_lived_secret: Option<Secret<String>>,
    /// Access token expiry; `None` means unknown
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub remark: String,
    pub active: bool,
    #[serde(default)]
    pub ban_reason: BanReason,
    #[serde(default)]
    pub banned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub credit_balance: i64,
    #[serde(default)]
    pub paygate_tier: Option<String>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub current_project_id: Option<String>,
    #[serde(default)]
    pub current_project_name: Option<String>,
    pub image_enabled: bool,
    pub video_enabled: bool,
    /// Negative means unlimited
    pub image_concurrency: i32,
    /// Negative means unlimited
    pub video_concurrency: i32,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the access token has a known expiry that has already passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry < now)
    }

    /// Current access token, if one has been issued.
    pub fn short_lived(&self) -> Option<&str> {
        self.short_lived_secret
            .as_ref()
            .map(|s| s.expose().as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn supports(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Image => self.image_enabled,
            MediaKind::Video => self.video_enabled,
        }
    }

    pub fn concurrency_limit(&self, kind: MediaKind) -> i32 {
        match kind {
            MediaKind::Image => self.image_concurrency,
            MediaKind::Video => self.video_concurrency,
        }
    }

    /// Reset all health fields back to an active, unbanned state.
    pub fn reactivate(&mut self) {
        self.active = true;
        self.ban_reason = BanReason::None;
        self.banned_at = None;
    }
}

/// Lifetime and per-day counters for one credential.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub credential_id: u64,
    pub image_count: u64,
    pub video_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub today_image_count: u64,
    pub today_video_count: u64,
    pub today_success_count: u64,
    pub today_error_count: u64,
    /// Day the `today_*` counters belong to
    pub today_date: Option<NaiveDate>,
    pub consecutive_error_count: u32,
}

impl UsageStats {
    pub fn new(credential_id: u64) -> Self {
        Self {
            credential_id,
            ..Self::default()
        }
    }

    /// Zero the daily counters when the first write of a new day arrives.
    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.today_date != Some(today) {
            self.today_image_count = 0;
            self.today_video_count = 0;
            self.today_success_count = 0;
            self.today_error_count = 0;
            self.today_date = Some(today);
        }
    }

    /// Count a successful generation of the given kind.
    pub fn record_generation(&mut self, kind: MediaKind, now: DateTime<Utc>) {
        self.roll_day(now);
        match kind {
            MediaKind::Image => {
                self.image_count += 1;
                self.today_image_count += 1;
            }
            MediaKind::Video => {
                self.video_count += 1;
                self.today_video_count += 1;
            }
        }
        self.success_count += 1;
        self.today_success_count += 1;
        self.last_success_at = Some(now);
    }

    /// Count a failed operation. Returns the new consecutive error count.
    pub fn record_error(&mut self, now: DateTime<Utc>) -> u32 {
        self.roll_day(now);
        self.error_count += 1;
        self.today_error_count += 1;
        self.last_error_at = Some(now);
        self.consecutive_error_count += 1;
        self.consecutive_error_count
    }
}

/// Workspace (project) created upstream for a credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub workspace_id: String,
    pub credential_id: u64,
    pub name: String,
    pub tool_name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Processing,
    Completed,
    Failed,
}

/// One long-running video generation, keyed by the upstream operation name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub operation_name: String,
    pub credential_id: u64,
    pub model: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(default)]
    pub result_urls: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub scene_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationTask {
    pub fn complete(&mut self, url: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.result_urls = vec![url];
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, message: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error_message = Some(message);
        self.completed_at = Some(now);
    }
}
