//! Credential lifecycle: creation, freshness, statistics, ban and unban
//!
//! The store holds every credential field; the pool adds the rules around
//! them. Every mutation is a single store transaction, so "check the ban,
//! mutate, clear the ban" can never interleave with another writer.
//!
//! Health transitions:
//! - active → inactive/rate_limited (backend answered 429)
//! - active → inactive/consecutive_errors (error threshold reached)
//! - active → inactive (session exchange failed during refresh, or admin disable)
//! - inactive/rate_limited → active (12h elapsed and access token unexpired, or admin edit)
//! - any → active (admin enable)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use store::{BanReason, Credential, MediaKind, Store, UsageStats, WorkspaceRecord};
use tracing::{debug, info, warn};
use upstream::UpstreamClient;
use upstream::constants::TOOL_NAME;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::slots::SlotManager;

/// Tunables for credential health.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Consecutive errors that disable a credential
    pub error_ban_threshold: u32,
    /// Refresh the access token when it expires sooner than this
    pub refresh_window: Duration,
    /// Minimum age of a rate-limit ban before automatic reactivation
    pub rate_limit_ban: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            error_ban_threshold: 3,
            refresh_window: Duration::hours(1),
            rate_limit_ban: Duration::hours(12),
        }
    }
}

/// Admin input for a new credential.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub long_lived_secret: String,
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub remark: String,
    pub image_enabled: bool,
    pub video_enabled: bool,
    pub image_concurrency: i32,
    pub video_concurrency: i32,
}

/// Admin edit of an existing credential. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub long_lived_secret: Option<String>,
    pub short_lived_secret: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub remark: Option<String>,
    pub current_project_id: Option<String>,
    pub current_project_name: Option<String>,
    pub image_enabled: Option<bool>,
    pub video_enabled: Option<bool>,
    pub image_concurrency: Option<i32>,
    pub video_concurrency: Option<i32>,
}

/// Outcome of a bulk import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub added: usize,
    /// Already present (same long-lived secret)
    pub skipped: usize,
    pub failed: usize,
}

/// Pool of upstream credentials.
///
/// Holds the store, the backend client, the shared slot manager and a
/// clock. Workspace creation is serialized per credential so concurrent
/// requests never create two workspaces for the same identity.
pub struct CredentialPool {
    store: Arc<Store>,
    upstream: Arc<dyn UpstreamClient>,
    slots: Arc<SlotManager>,
    clock: Arc<dyn Clock>,
    settings: PoolSettings,
    workspace_locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialPool {
    pub fn new(
        store: Arc<Store>,
        upstream: Arc<dyn UpstreamClient>,
        slots: Arc<SlotManager>,
        clock: Arc<dyn Clock>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            store,
            upstream,
            slots,
            clock,
            settings,
            workspace_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn slots(&self) -> &Arc<SlotManager> {
        &self.slots
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn upstream(&self) -> &Arc<dyn UpstreamClient> {
        &self.upstream
    }

    /// Load slot limits for every stored credential. Call once at startup.
    pub async fn initialize_slots(&self) {
        let credentials = self.store.list_credentials().await;
        self.slots.initialize(&credentials);
        info!(credentials = credentials.len(), "pool initialized");
    }

    pub async fn list_all(&self) -> Vec<Credential> {
        self.store.list_credentials().await
    }

    /// Active credentials in id order.
    pub async fn list_active(&self) -> Vec<Credential> {
        self.store
            .list_credentials()
            .await
            .into_iter()
            .filter(|c| c.active)
            .collect()
    }

    pub async fn get(&self, id: u64) -> Result<Credential> {
        self.store.get_credential(id).await.ok_or(Error::NotFound(id))
    }

    pub async fn stats(&self, id: u64) -> Result<UsageStats> {
        self.store.get_stats(id).await.ok_or(Error::NotFound(id))
    }

    /// Exchange, price and persist a new credential.
    ///
    /// A workspace is created when no project id is supplied. The workspace
    /// record is stored either way.
    pub async fn add_credential(&self, new: NewCredential) -> Result<Credential> {
        if let Some(existing) = self
            .store
            .find_by_long_lived_secret(&new.long_lived_secret)
            .await
        {
            return Err(Error::Conflict(existing.email));
        }

        let exchange = self
            .upstream
            .exchange_credential(&new.long_lived_secret)
            .await
            .map_err(|e| Error::AuthExchange(e.to_string()))?;

        let balance = match self
            .upstream
            .query_credit_balance(&exchange.short_lived_secret)
            .await
        {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!(email = %exchange.email, error = %e, "credit query failed, storing zero balance");
                None
            }
        };

        let now = self.clock.now();
        let project_name = new
            .project_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| workspace_name(now));
        let project_id = match new.project_id.filter(|p| !p.is_empty()) {
            Some(id) => id,
            None => {
                let id = self
                    .upstream
                    .create_workspace(&new.long_lived_secret, &project_name)
                    .await?;
                info!(workspace_id = %id, name = %project_name, "created workspace for new credential");
                id
            }
        };

        let credential = Credential {
            id: 0,
            long_lived_secret: new.long_lived_secret.into(),
            short_lived_secret: Some(exchange.short_lived_secret.into()),
            expires_at: exchange.expires_at,
            email: exchange.email,
            name: exchange.name,
            remark: new.remark,
            active: true,
            ban_reason: BanReason::None,
            banned_at: None,
            credit_balance: balance.as_ref().map(|b| b.credits).unwrap_or(0),
            paygate_tier: balance.and_then(|b| b.tier),
            last_used_at: None,
            use_count: 0,
            current_project_id: Some(project_id.clone()),
            current_project_name: Some(project_name.clone()),
            image_enabled: new.image_enabled,
            video_enabled: new.video_enabled,
            image_concurrency: new.image_concurrency,
            video_concurrency: new.video_concurrency,
            created_at: now,
        };
        let credential = self.store.insert_credential(credential).await?;

        self.store
            .insert_workspace(WorkspaceRecord {
                workspace_id: project_id,
                credential_id: credential.id,
                name: project_name,
                tool_name: TOOL_NAME.to_string(),
                active: true,
                created_at: now,
            })
            .await?;

        self.slots.update_limits(
            credential.id,
            credential.image_concurrency,
            credential.video_concurrency,
        );
        info!(credential_id = credential.id, email = %credential.email, "credential added");
        Ok(credential)
    }

    /// Add each entry, skipping secrets that are already stored.
    pub async fn import(&self, entries: Vec<NewCredential>) -> ImportReport {
        let mut report = ImportReport::default();
        for entry in entries {
            match self.add_credential(entry).await {
                Ok(_) => report.added += 1,
                Err(Error::Conflict(email)) => {
                    debug!(email = %email, "import skipped existing credential");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(error = %e, "import entry failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            added = report.added,
            skipped = report.skipped,
            failed = report.failed,
            "import finished"
        );
        report
    }

    /// Apply an admin edit.
    ///
    /// Editing a rate-limited credential whose access token has not expired
    /// lifts the ban. New limits are pushed into the slot manager.
    pub async fn update_credential(&self, id: u64, update: CredentialUpdate) -> Result<Credential> {
        let now = self.clock.now();
        let updated = self
            .store
            .update_credential(id, move |c| {
                if let Some(secret) = update.long_lived_secret {
                    c.long_lived_secret = secret.into();
                }
                if let Some(secret) = update.short_lived_secret {
                    c.short_lived_secret = Some(secret.into());
                }
                if let Some(expiry) = update.expires_at {
                    c.expires_at = Some(expiry);
                }
                if let Some(remark) = update.remark {
                    c.remark = remark;
                }
                if let Some(project_id) = update.current_project_id {
                    c.current_project_id = Some(project_id);
                }
                if let Some(project_name) = update.current_project_name {
                    c.current_project_name = Some(project_name);
                }
                if let Some(enabled) = update.image_enabled {
                    c.image_enabled = enabled;
                }
                if let Some(enabled) = update.video_enabled {
                    c.video_enabled = enabled;
                }
                if let Some(limit) = update.image_concurrency {
                    c.image_concurrency = limit;
                }
                if let Some(limit) = update.video_concurrency {
                    c.video_concurrency = limit;
                }
                if c.ban_reason == BanReason::RateLimited && !c.is_expired(now) {
                    info!(credential_id = c.id, "credential edited, clearing rate-limit ban");
                    c.reactivate();
                }
            })
            .await
            .map_err(|e| not_found(id, e))?;

        self.slots.update_limits(
            id,
            updated.image_concurrency,
            updated.video_concurrency,
        );
        Ok(updated)
    }

    fn needs_refresh(&self, credential: &Credential, now: DateTime<Utc>) -> Option<&'static str> {
        if credential.short_lived().is_none() {
            return Some("access token missing");
        }
        match credential.expires_at {
            None => Some("access token expiry unknown"),
            Some(expiry) if expiry - now < self.settings.refresh_window => {
                Some("access token expiring soon")
            }
            Some(_) => None,
        }
    }

    /// Make sure the credential has an access token valid for at least the
    /// refresh window, exchanging the session token if not.
    ///
    /// Returns the up-to-date credential. On exchange failure the credential
    /// is disabled and `AuthExchange` is returned.
    pub async fn ensure_fresh_secret(&self, id: u64) -> Result<Credential> {
        let credential = self.get(id).await?;
        match self.needs_refresh(&credential, self.clock.now()) {
            None => Ok(credential),
            Some(reason) => {
                debug!(credential_id = id, reason, "refreshing access token");
                self.refresh_secret(id).await
            }
        }
    }

    /// Unconditionally exchange the session token for a new access token.
    ///
    /// The credit balance is refreshed afterwards on a best-effort basis.
    pub async fn refresh_secret(&self, id: u64) -> Result<Credential> {
        let credential = self.get(id).await?;

        let exchange = match self
            .upstream
            .exchange_credential(credential.long_lived_secret.expose())
            .await
        {
            Ok(exchange) => exchange,
            Err(e) => {
                warn!(credential_id = id, error = %e, "session exchange failed, disabling credential");
                self.store
                    .update_credential(id, |c| c.active = false)
                    .await
                    .map_err(|e| not_found(id, e))?;
                return Err(Error::AuthExchange(e.to_string()));
            }
        };

        let token = exchange.short_lived_secret;
        let expires_at = exchange.expires_at;
        let mut updated = self
            .store
            .update_credential(id, |c| {
                c.short_lived_secret = Some(token.as_str().into());
                c.expires_at = expires_at;
            })
            .await
            .map_err(|e| not_found(id, e))?;
        info!(credential_id = id, "access token refreshed");

        match self.upstream.query_credit_balance(&token).await {
            Ok(balance) => {
                updated = self
                    .store
                    .update_credential(id, |c| {
                        c.credit_balance = balance.credits;
                        if balance.tier.is_some() {
                            c.paygate_tier = balance.tier;
                        }
                    })
                    .await
                    .map_err(|e| not_found(id, e))?;
            }
            Err(e) => {
                debug!(credential_id = id, error = %e, "credit refresh after token refresh failed");
            }
        }
        Ok(updated)
    }

    /// Query and persist the current credit balance.
    pub async fn refresh_credit_balance(&self, id: u64) -> Result<i64> {
        let credential = self.ensure_fresh_secret(id).await?;
        let token = credential.short_lived().unwrap_or_default();
        let balance = self.upstream.query_credit_balance(token).await?;
        let credits = balance.credits;
        self.store
            .update_credential(id, |c| {
                c.credit_balance = balance.credits;
                if balance.tier.is_some() {
                    c.paygate_tier = balance.tier;
                }
            })
            .await
            .map_err(|e| not_found(id, e))?;
        debug!(credential_id = id, credits, "credit balance refreshed");
        Ok(credits)
    }

    fn workspace_lock(&self, id: u64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.workspace_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id).or_default())
    }

    /// Return the credential's workspace id, creating one if it has none.
    pub async fn ensure_project_exists(&self, id: u64) -> Result<String> {
        let lock = self.workspace_lock(id);
        let _guard = lock.lock().await;

        let credential = self.get(id).await?;
        if let Some(project_id) = credential.current_project_id.filter(|p| !p.is_empty()) {
            return Ok(project_id);
        }

        let now = self.clock.now();
        let name = workspace_name(now);
        let project_id = self
            .upstream
            .create_workspace(credential.long_lived_secret.expose(), &name)
            .await?;
        info!(credential_id = id, workspace_id = %project_id, "created workspace");

        let (pid, pname) = (project_id.clone(), name.clone());
        self.store
            .update_credential(id, move |c| {
                c.current_project_id = Some(pid);
                c.current_project_name = Some(pname);
            })
            .await
            .map_err(|e| not_found(id, e))?;
        self.store
            .insert_workspace(WorkspaceRecord {
                workspace_id: project_id.clone(),
                credential_id: id,
                name,
                tool_name: TOOL_NAME.to_string(),
                active: true,
                created_at: now,
            })
            .await?;
        Ok(project_id)
    }

    /// Stamp last use and count a successful generation.
    pub async fn record_usage(&self, id: u64, kind: MediaKind) -> Result<()> {
        let now = self.clock.now();
        self.store
            .update_with_stats(id, |c, s| {
                c.last_used_at = Some(now);
                c.use_count += 1;
                s.record_generation(kind, now);
            })
            .await
            .map_err(|e| not_found(id, e))
    }

    /// Count a failure; disables the credential once the consecutive error
    /// count reaches the threshold.
    pub async fn record_error(&self, id: u64) -> Result<()> {
        let now = self.clock.now();
        let threshold = self.settings.error_ban_threshold;
        let tripped = self
            .store
            .update_with_stats(id, |c, s| {
                let consecutive = s.record_error(now);
                if consecutive >= threshold && c.active {
                    c.active = false;
                    c.ban_reason = BanReason::ConsecutiveErrors;
                    c.banned_at = Some(now);
                    Some(consecutive)
                } else {
                    None
                }
            })
            .await
            .map_err(|e| not_found(id, e))?;

        if let Some(consecutive) = tripped {
            warn!(
                credential_id = id,
                consecutive,
                threshold,
                "consecutive error threshold reached, disabling credential"
            );
            metrics::counter!("credential_bans_total", "reason" => BanReason::ConsecutiveErrors.label())
                .increment(1);
        }
        Ok(())
    }

    pub async fn record_success(&self, id: u64) -> Result<()> {
        self.store
            .update_with_stats(id, |_, s| s.consecutive_error_count = 0)
            .await
            .map_err(|e| not_found(id, e))
    }

    /// Take the credential out of rotation after a 429.
    pub async fn ban_for_rate_limit(&self, id: u64) -> Result<()> {
        let now = self.clock.now();
        self.store
            .update_credential(id, |c| {
                c.active = false;
                c.ban_reason = BanReason::RateLimited;
                c.banned_at = Some(now);
            })
            .await
            .map_err(|e| not_found(id, e))?;
        warn!(credential_id = id, "credential banned (rate limited)");
        metrics::counter!("credential_bans_total", "reason" => BanReason::RateLimited.label())
            .increment(1);
        Ok(())
    }

    /// Reactivate rate-limited credentials whose ban is old enough and whose
    /// access token has not expired. Returns how many were reactivated.
    pub async fn auto_unban(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut unbanned = 0usize;

        for credential in self.store.list_credentials().await {
            if credential.ban_reason != BanReason::RateLimited || credential.active {
                continue;
            }
            let Some(banned_at) = credential.banned_at else {
                continue;
            };
            if credential.is_expired(now) {
                debug!(credential_id = credential.id, "access token expired, leaving banned");
                continue;
            }
            let banned_for = now - banned_at;
            if banned_for < self.settings.rate_limit_ban {
                continue;
            }

            self.store
                .update_with_stats(credential.id, |c, s| {
                    c.reactivate();
                    s.consecutive_error_count = 0;
                })
                .await?;
            info!(
                credential_id = credential.id,
                banned_hours = banned_for.num_hours(),
                "rate-limit ban lifted"
            );
            unbanned += 1;
        }
        Ok(unbanned)
    }

    /// Admin enable: active, unbanned, error streak cleared.
    pub async fn enable(&self, id: u64) -> Result<Credential> {
        let credential = self
            .store
            .update_with_stats(id, |c, s| {
                c.reactivate();
                s.consecutive_error_count = 0;
                c.clone()
            })
            .await
            .map_err(|e| not_found(id, e))?;
        info!(credential_id = id, "credential enabled");
        Ok(credential)
    }

    /// Admin disable. Clears any ban so the sweep never re-enables it.
    pub async fn disable(&self, id: u64) -> Result<Credential> {
        let credential = self
            .store
            .update_credential(id, |c| {
                c.active = false;
                c.ban_reason = BanReason::None;
                c.banned_at = None;
            })
            .await
            .map_err(|e| not_found(id, e))?;
        info!(credential_id = id, "credential disabled");
        Ok(credential)
    }

    /// Remove a credential, its statistics and workspace records.
    pub async fn delete(&self, id: u64) -> Result<()> {
        match self.store.delete_credential(id).await? {
            Some(_) => {
                self.slots.remove(id);
                self.workspace_locks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                info!(credential_id = id, "credential deleted");
                Ok(())
            }
            None => Err(Error::NotFound(id)),
        }
    }

    /// Pool health for the health endpoint.
    ///
    /// Status mapping: every credential available → healthy, some
    /// available → degraded, none → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let now = self.clock.now();
        let credentials = self.store.list_credentials().await;

        let mut entries = Vec::with_capacity(credentials.len());
        let mut available = 0usize;
        let mut rate_limited = 0usize;
        let mut disabled = 0usize;

        for c in &credentials {
            let status = if !c.active {
                match c.ban_reason {
                    BanReason::RateLimited => {
                        rate_limited += 1;
                        "rate_limited"
                    }
                    BanReason::ConsecutiveErrors => {
                        disabled += 1;
                        "error_banned"
                    }
                    BanReason::None => {
                        disabled += 1;
                        "disabled"
                    }
                }
            } else if c.is_expired(now) {
                "expired"
            } else {
                available += 1;
                "available"
            };
            entries.push(serde_json::json!({
                "id": c.id,
                "email": c.email,
                "status": status,
                "credits": c.credit_balance,
                "image_in_flight": self.slots.in_flight(MediaKind::Image, c.id),
                "video_in_flight": self.slots.in_flight(MediaKind::Video, c.id),
            }));
        }

        let total = credentials.len();
        let pool_status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": pool_status,
            "credentials_total": total,
            "credentials_available": available,
            "credentials_rate_limited": rate_limited,
            "credentials_disabled": disabled,
            "credentials": entries
        })
    }

    /// Aggregate counters across all credentials.
    pub async fn summary(&self) -> serde_json::Value {
        let today = self.clock.now().date_naive();
        let credentials = self.store.list_credentials().await;
        let stats = self.store.list_stats().await;

        let active = credentials.iter().filter(|c| c.active).count();
        let mut totals = [0u64; 3];
        let mut today_totals = [0u64; 3];
        for s in &stats {
            totals[0] += s.image_count;
            totals[1] += s.video_count;
            totals[2] += s.error_count;
            if s.today_date == Some(today) {
                today_totals[0] += s.today_image_count;
                today_totals[1] += s.today_video_count;
                today_totals[2] += s.today_error_count;
            }
        }

        serde_json::json!({
            "total_credentials": credentials.len(),
            "active_credentials": active,
            "total_images": totals[0],
            "total_videos": totals[1],
            "total_errors": totals[2],
            "today_images": today_totals[0],
            "today_videos": today_totals[1],
            "today_errors": today_totals[2],
        })
    }
}

/// Workspace title in the backend's "Jan 02 - 15:04" style.
fn workspace_name(now: DateTime<Utc>) -> String {
    now.format("%b %d - %H:%M").to_string()
}

fn not_found(id: u64, e: store::Error) -> Error {
    match e {
        store::Error::NotFound(_) => Error::NotFound(id),
        other => Error::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use upstream::{
        BoxFuture, CreditBalance, ImageRequest, ImageResult, OperationHandle, OperationStatus,
        SessionExchange, UpstreamError, VideoRequest,
    };

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    /// Backend fake counting exchanges and workspace creations.
    struct StubUpstream {
        exchange_calls: AtomicUsize,
        workspace_calls: AtomicUsize,
        fail_exchange: AtomicBool,
        fail_credits: AtomicBool,
        token_lifetime: Duration,
    }

    impl StubUpstream {
        fn new() -> Self {
            Self {
                exchange_calls: AtomicUsize::new(0),
                workspace_calls: AtomicUsize::new(0),
                fail_exchange: AtomicBool::new(false),
                fail_credits: AtomicBool::new(false),
                token_lifetime: Duration::days(7),
            }
        }
    }

    impl UpstreamClient for StubUpstream {
        fn exchange_credential<'a>(
            &'a self,
            long_lived_secret: &'a str,
        ) -> BoxFuture<'a, upstream::Result<SessionExchange>> {
            Box::pin(async move {
                let n = self.exchange_calls.fetch_add(1, Ordering::SeqCst) + 1;
                if self.fail_exchange.load(Ordering::SeqCst) {
                    return Err(UpstreamError::AuthExchange("session revoked".into()));
                }
                Ok(SessionExchange {
                    short_lived_secret: format!("at-{long_lived_secret}-{n}"),
                    expires_at: Some(start() + self.token_lifetime),
                    email: format!("{long_lived_secret}@example.com"),
                    name: "Test User".into(),
                })
            })
        }

        fn query_credit_balance<'a>(&'a self, _: &'a str) -> BoxFuture<'a, upstream::Result<CreditBalance>> {
            Box::pin(async move {
                if self.fail_credits.load(Ordering::SeqCst) {
                    return Err(UpstreamError::Http("timeout".into()));
                }
                Ok(CreditBalance {
                    credits: 500,
                    tier: Some("PAYGATE_TIER_TWO".into()),
                })
            })
        }

        fn create_workspace<'a>(&'a self, _: &'a str, _: &'a str) -> BoxFuture<'a, upstream::Result<String>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                let n = self.workspace_calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("ws-{n}"))
            })
        }

        fn upload_asset<'a>(&'a self, _: &'a str, _: &'a [u8], _: &'a str) -> BoxFuture<'a, upstream::Result<String>> {
            Box::pin(async { Err::<String, _>(UpstreamError::Decode("unused".into())) })
        }

        fn submit_image<'a>(&'a self, _: &'a str, _: &'a ImageRequest) -> BoxFuture<'a, upstream::Result<ImageResult>> {
            Box::pin(async { Err::<ImageResult, _>(UpstreamError::Decode("unused".into())) })
        }

        fn submit_video<'a>(&'a self, _: &'a str, _: &'a VideoRequest) -> BoxFuture<'a, upstream::Result<OperationHandle>> {
            Box::pin(async { Err::<OperationHandle, _>(UpstreamError::Decode("unused".into())) })
        }

        fn poll_operation<'a>(
            &'a self,
            _: &'a str,
            _: &'a OperationHandle,
        ) -> BoxFuture<'a, upstream::Result<OperationStatus>> {
            Box::pin(async { Err::<OperationStatus, _>(UpstreamError::Decode("unused".into())) })
        }
    }

    struct Harness {
        pool: Arc<CredentialPool>,
        upstream: Arc<StubUpstream>,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("store.json")).await.unwrap());
        let upstream = Arc::new(StubUpstream::new());
        let clock = Arc::new(ManualClock::new(start()));
        let pool = Arc::new(CredentialPool::new(
            store,
            upstream.clone(),
            Arc::new(SlotManager::new()),
            clock.clone(),
            PoolSettings::default(),
        ));
        Harness {
            pool,
            upstream,
            clock,
            _dir: dir,
        }
    }

    fn new_credential(secret: &str) -> NewCredential {
        NewCredential {
            long_lived_secret: secret.into(),
            project_id: Some(format!("proj-{secret}")),
            project_name: Some("Existing".into()),
            remark: String::new(),
            image_enabled: true,
            video_enabled: true,
            image_concurrency: 2,
            video_concurrency: -1,
        }
    }

    #[tokio::test]
    async fn add_credential_exchanges_and_prices() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();

        assert_eq!(cred.id, 1);
        assert!(cred.active);
        assert_eq!(cred.email, "st1@example.com");
        assert_eq!(cred.short_lived(), Some("at-st1-1"));
        assert_eq!(cred.credit_balance, 500);
        assert_eq!(cred.paygate_tier.as_deref(), Some("PAYGATE_TIER_TWO"));
        assert_eq!(cred.current_project_id.as_deref(), Some("proj-st1"));
        assert_eq!(h.upstream.workspace_calls.load(Ordering::SeqCst), 0);

        let workspaces = h.pool.store().workspaces_for(cred.id).await;
        assert_eq!(workspaces.len(), 1);
        assert_eq!(workspaces[0].tool_name, "PINHOLE");
    }

    #[tokio::test]
    async fn add_credential_creates_named_workspace_when_missing() {
        let h = harness().await;
        let mut new = new_credential("st1");
        new.project_id = None;
        new.project_name = None;

        let cred = h.pool.add_credential(new).await.unwrap();
        assert_eq!(cred.current_project_id.as_deref(), Some("ws-1"));
        assert_eq!(cred.current_project_name.as_deref(), Some("Mar 01 - 12:00"));
        assert_eq!(h.upstream.workspace_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn add_credential_tolerates_credit_failure() {
        let h = harness().await;
        h.upstream.fail_credits.store(true, Ordering::SeqCst);
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();
        assert_eq!(cred.credit_balance, 0);
        assert!(cred.paygate_tier.is_none());
    }

    #[tokio::test]
    async fn add_duplicate_secret_is_conflict_naming_email() {
        let h = harness().await;
        h.pool.add_credential(new_credential("st1")).await.unwrap();
        let err = h.pool.add_credential(new_credential("st1")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(err.to_string(), "Token already exists (email: st1@example.com)");
        assert_eq!(h.upstream.exchange_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn add_with_failed_exchange_is_auth_error() {
        let h = harness().await;
        h.upstream.fail_exchange.store(true, Ordering::SeqCst);
        let err = h.pool.add_credential(new_credential("st1")).await.unwrap_err();
        assert!(matches!(err, Error::AuthExchange(_)), "got: {err:?}");
        assert!(h.pool.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn fresh_secret_skips_exchange_when_expiry_far() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();

        h.clock.advance(Duration::days(6));
        let fresh = h.pool.ensure_fresh_secret(cred.id).await.unwrap();
        assert_eq!(fresh.short_lived(), Some("at-st1-1"));
        assert_eq!(h.upstream.exchange_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_secret_refreshes_within_one_hour() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();

        h.clock.set(cred.expires_at.unwrap() - Duration::minutes(59));
        let fresh = h.pool.ensure_fresh_secret(cred.id).await.unwrap();
        assert_eq!(fresh.short_lived(), Some("at-st1-2"));
        assert_eq!(h.upstream.exchange_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fresh_secret_refreshes_when_absent_or_unknown_expiry() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();

        h.pool
            .store()
            .update_credential(cred.id, |c| c.expires_at = None)
            .await
            .unwrap();
        h.pool.ensure_fresh_secret(cred.id).await.unwrap();
        assert_eq!(h.upstream.exchange_calls.load(Ordering::SeqCst), 2);

        h.pool
            .store()
            .update_credential(cred.id, |c| c.short_lived_secret = None)
            .await
            .unwrap();
        let fresh = h.pool.ensure_fresh_secret(cred.id).await.unwrap();
        assert_eq!(fresh.short_lived(), Some("at-st1-3"));
    }

    #[tokio::test]
    async fn refresh_failure_disables_without_ban_reason() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();
        h.pool
            .store()
            .update_credential(cred.id, |c| c.expires_at = None)
            .await
            .unwrap();
        h.upstream.fail_exchange.store(true, Ordering::SeqCst);

        let err = h.pool.ensure_fresh_secret(cred.id).await.unwrap_err();
        assert!(matches!(err, Error::AuthExchange(_)));

        let stored = h.pool.get(cred.id).await.unwrap();
        assert!(!stored.active);
        assert_eq!(stored.ban_reason, BanReason::None);
    }

    #[tokio::test]
    async fn errors_reaching_threshold_disable() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();

        h.pool.record_error(cred.id).await.unwrap();
        h.pool.record_error(cred.id).await.unwrap();
        assert!(h.pool.get(cred.id).await.unwrap().active);

        h.pool.record_error(cred.id).await.unwrap();
        let stored = h.pool.get(cred.id).await.unwrap();
        assert!(!stored.active);
        assert_eq!(stored.ban_reason, BanReason::ConsecutiveErrors);
        assert_eq!(h.pool.stats(cred.id).await.unwrap().error_count, 3);
    }

    #[tokio::test]
    async fn interleaved_success_resets_error_streak() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();

        h.pool.record_error(cred.id).await.unwrap();
        h.pool.record_error(cred.id).await.unwrap();
        h.pool.record_success(cred.id).await.unwrap();
        h.pool.record_error(cred.id).await.unwrap();
        h.pool.record_error(cred.id).await.unwrap();

        assert!(h.pool.get(cred.id).await.unwrap().active);
        assert_eq!(h.pool.stats(cred.id).await.unwrap().consecutive_error_count, 2);
    }

    #[tokio::test]
    async fn record_usage_stamps_and_counts() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();
        h.pool.record_error(cred.id).await.unwrap();

        h.pool.record_usage(cred.id, MediaKind::Video).await.unwrap();
        let stored = h.pool.get(cred.id).await.unwrap();
        assert_eq!(stored.last_used_at, Some(start()));
        assert_eq!(stored.use_count, 1);
        let stats = h.pool.stats(cred.id).await.unwrap();
        assert_eq!(stats.video_count, 1);
        assert_eq!(stats.today_video_count, 1);
        // The streak is only cleared by record_success.
        assert_eq!(stats.consecutive_error_count, 1);

        h.pool.record_success(cred.id).await.unwrap();
        assert_eq!(h.pool.stats(cred.id).await.unwrap().consecutive_error_count, 0);
    }

    #[tokio::test]
    async fn rate_limit_ban_lifts_only_after_twelve_hours() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();
        h.pool.record_error(cred.id).await.unwrap();
        h.pool.ban_for_rate_limit(cred.id).await.unwrap();

        h.clock.advance(Duration::hours(11) + Duration::minutes(59));
        assert_eq!(h.pool.auto_unban().await.unwrap(), 0);
        assert!(!h.pool.get(cred.id).await.unwrap().active);

        h.clock.advance(Duration::minutes(1));
        assert_eq!(h.pool.auto_unban().await.unwrap(), 1);
        let stored = h.pool.get(cred.id).await.unwrap();
        assert!(stored.active);
        assert_eq!(stored.ban_reason, BanReason::None);
        assert!(stored.banned_at.is_none());
        assert_eq!(h.pool.stats(cred.id).await.unwrap().consecutive_error_count, 0);

        assert_eq!(h.pool.auto_unban().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_credential_stays_banned() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();
        h.pool.ban_for_rate_limit(cred.id).await.unwrap();

        h.clock.advance(Duration::days(8));
        assert_eq!(h.pool.auto_unban().await.unwrap(), 0);
        assert!(!h.pool.get(cred.id).await.unwrap().active);
    }

    #[tokio::test]
    async fn auto_unban_ignores_error_bans_and_manual_disable() {
        let h = harness().await;
        let a = h.pool.add_credential(new_credential("a")).await.unwrap();
        let b = h.pool.add_credential(new_credential("b")).await.unwrap();
        for _ in 0..3 {
            h.pool.record_error(a.id).await.unwrap();
        }
        h.pool.disable(b.id).await.unwrap();

        h.clock.advance(Duration::hours(13));
        assert_eq!(h.pool.auto_unban().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn edit_clears_rate_limit_ban_and_updates_slots() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();
        h.pool.ban_for_rate_limit(cred.id).await.unwrap();

        let updated = h
            .pool
            .update_credential(
                cred.id,
                CredentialUpdate {
                    remark: Some("rotated".into()),
                    image_concurrency: Some(1),
                    ..CredentialUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.active);
        assert_eq!(updated.ban_reason, BanReason::None);
        assert_eq!(updated.remark, "rotated");

        assert!(h.pool.slots().acquire(MediaKind::Image, cred.id));
        assert!(!h.pool.slots().acquire(MediaKind::Image, cred.id));
    }

    #[tokio::test]
    async fn edit_keeps_ban_when_token_expired() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();
        h.pool.ban_for_rate_limit(cred.id).await.unwrap();
        h.clock.advance(Duration::days(8));

        let updated = h
            .pool
            .update_credential(cred.id, CredentialUpdate::default())
            .await
            .unwrap();
        assert!(!updated.active);
        assert_eq!(updated.ban_reason, BanReason::RateLimited);
    }

    #[tokio::test]
    async fn update_unknown_credential_is_not_found() {
        let h = harness().await;
        let err = h
            .pool
            .update_credential(9, CredentialUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(9)));
    }

    #[tokio::test]
    async fn enable_resets_error_streak() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();
        for _ in 0..3 {
            h.pool.record_error(cred.id).await.unwrap();
        }

        let enabled = h.pool.enable(cred.id).await.unwrap();
        assert!(enabled.active);
        assert_eq!(enabled.ban_reason, BanReason::None);
        assert_eq!(h.pool.stats(cred.id).await.unwrap().consecutive_error_count, 0);
    }

    #[tokio::test]
    async fn delete_cascades_and_second_delete_is_not_found() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();
        h.pool.ensure_project_exists(cred.id).await.unwrap();
        assert!(h.pool.workspace_locks.lock().unwrap().contains_key(&cred.id));

        h.pool.delete(cred.id).await.unwrap();
        assert!(!h.pool.workspace_locks.lock().unwrap().contains_key(&cred.id));
        assert!(h.pool.stats(cred.id).await.is_err());
        assert!(h.pool.store().workspaces_for(cred.id).await.is_empty());
        assert!(matches!(h.pool.delete(cred.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn concurrent_project_checks_create_one_workspace() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();
        h.pool
            .store()
            .update_credential(cred.id, |c| c.current_project_id = None)
            .await
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = h.pool.clone();
                tokio::spawn(async move { pool.ensure_project_exists(cred.id).await.unwrap() })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }

        assert!(ids.iter().all(|id| id == "ws-1"), "got: {ids:?}");
        assert_eq!(h.upstream.workspace_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.pool.store().workspaces_for(cred.id).await.len(), 2);
    }

    #[tokio::test]
    async fn refresh_credit_balance_persists() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("st1")).await.unwrap();
        h.pool
            .store()
            .update_credential(cred.id, |c| c.credit_balance = 1)
            .await
            .unwrap();

        assert_eq!(h.pool.refresh_credit_balance(cred.id).await.unwrap(), 500);
        assert_eq!(h.pool.get(cred.id).await.unwrap().credit_balance, 500);
    }

    #[tokio::test]
    async fn import_counts_added_and_skipped() {
        let h = harness().await;
        h.pool.add_credential(new_credential("a")).await.unwrap();

        let report = h
            .pool
            .import(vec![new_credential("a"), new_credential("b"), new_credential("c")])
            .await;
        assert_eq!(
            report,
            ImportReport {
                added: 2,
                skipped: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn health_reports_statuses() {
        let h = harness().await;
        let health = h.pool.health().await;
        assert_eq!(health["status"], "unhealthy");

        let a = h.pool.add_credential(new_credential("a")).await.unwrap();
        let b = h.pool.add_credential(new_credential("b")).await.unwrap();
        assert_eq!(h.pool.health().await["status"], "healthy");

        h.pool.ban_for_rate_limit(b.id).await.unwrap();
        let health = h.pool.health().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["credentials_rate_limited"], 1);
        assert_eq!(health["credentials"][1]["status"], "rate_limited");

        h.pool.disable(a.id).await.unwrap();
        assert_eq!(h.pool.health().await["status"], "unhealthy");
    }

    #[tokio::test]
    async fn summary_counts_only_todays_daily_counters() {
        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("a")).await.unwrap();
        h.pool.record_usage(cred.id, MediaKind::Image).await.unwrap();
        h.pool.record_error(cred.id).await.unwrap();

        let summary = h.pool.summary().await;
        assert_eq!(summary["today_images"], 1);
        assert_eq!(summary["today_errors"], 1);

        h.clock.advance(Duration::days(1));
        let summary = h.pool.summary().await;
        assert_eq!(summary["total_images"], 1);
        assert_eq!(summary["today_images"], 0);
    }

    #[tokio::test]
    async fn bans_are_counted_in_metrics() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let h = harness().await;
        let cred = h.pool.add_credential(new_credential("a")).await.unwrap();
        h.pool.ban_for_rate_limit(cred.id).await.unwrap();

        let output = handle.render();
        assert!(output.contains("credential_bans_total"), "got: {output}");
        assert!(output.contains("reason=\"rate_limited\""), "got: {output}");
    }
}
