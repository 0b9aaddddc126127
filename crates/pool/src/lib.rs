//! Credential pool for the generative-media backend
//!
//! Owns the lifecycle of upstream credentials and the in-memory concurrency
//! budget attached to each of them. The store is the single source of truth
//! for credential data; the slot manager is rebuilt from it at startup and
//! never persisted.
//!
//! Credential lifecycle:
//! 1. Admin adds a credential → session exchanged, workspace created, `active`
//! 2. Scheduler picks the best eligible credential for a request
//! 3. Access token refreshed before use when missing or within an hour of expiry
//! 4. Backend answers 429 → credential banned with reason `rate_limited`
//! 5. Consecutive errors reach the threshold → credential disabled
//! 6. Hourly sweep reactivates rate-limited credentials banned 12h+ ago

pub mod clock;
pub mod error;
pub mod pool;
pub mod scheduler;
pub mod slots;
pub mod unban;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use pool::{CredentialPool, CredentialUpdate, ImportReport, NewCredential, PoolSettings};
pub use scheduler::Scheduler;
pub use slots::{SlotGuard, SlotManager};
pub use unban::spawn_unban_task;
