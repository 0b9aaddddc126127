//! Credential selection
//!
//! Picks the best eligible credential for one request. Selection is
//! advisory: the slot is only taken later by `SlotManager::acquire`, which
//! is authoritative when two requests race for the same credential.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use store::{Credential, MediaKind};
use tracing::{debug, info};

use crate::pool::CredentialPool;

/// Bonus for a credential that has never served a request.
const NEVER_USED_BONUS: f64 = 1000.0;

pub struct Scheduler {
    pool: Arc<CredentialPool>,
}

impl Scheduler {
    pub fn new(pool: Arc<CredentialPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Highest-scoring active credential that supports `kind`, has not
    /// expired and (for a positive limit) has a free slot.
    ///
    /// Ties keep the lowest id.
    pub async fn select(&self, kind: MediaKind, model: &str) -> Option<Credential> {
        let now = self.pool.clock().now();
        let slots = self.pool.slots();

        let mut best: Option<(f64, Credential)> = None;
        for credential in self.pool.list_active().await {
            if !credential.supports(kind) {
                continue;
            }
            if credential.is_expired(now) {
                continue;
            }
            if credential.concurrency_limit(kind) > 0 && !slots.can_acquire(kind, credential.id) {
                debug!(credential_id = credential.id, kind = kind.label(), "skipping credential at slot limit");
                continue;
            }

            let score = score(&credential, now);
            if best.as_ref().is_none_or(|(best_score, _)| score > *best_score) {
                best = Some((score, credential));
            }
        }

        match best {
            Some((score, credential)) => {
                info!(
                    credential_id = credential.id,
                    email = %credential.email,
                    kind = kind.label(),
                    model,
                    score,
                    "selected credential"
                );
                Some(credential)
            }
            None => {
                debug!(kind = kind.label(), model, "no eligible credential");
                None
            }
        }
    }
}

/// Credits plus an idle bonus: minutes since last use, or a flat bonus for
/// a credential never used.
fn score(credential: &Credential, now: DateTime<Utc>) -> f64 {
    let idle = match credential.last_used_at {
        None => NEVER_USED_BONUS,
        Some(last) => (now - last).num_milliseconds() as f64 / 60_000.0,
    };
    credential.credit_balance as f64 + idle
}
