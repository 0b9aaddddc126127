//! Background rate-limit ban sweep

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::pool::CredentialPool;

/// Spawn the periodic unban sweep.
///
/// The first tick is skipped; the pool was just loaded.
pub fn spawn_unban_task(pool: Arc<CredentialPool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            unban_cycle(&pool).await;
        }
    })
}

async fn unban_cycle(pool: &CredentialPool) {
    match pool.auto_unban().await {
        Ok(0) => {}
        Ok(count) => info!(count, "rate-limit sweep reactivated credentials"),
        Err(e) => warn!(error = %e, "rate-limit sweep failed"),
    }
}
