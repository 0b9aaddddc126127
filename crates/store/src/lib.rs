//! Durable storage for upstream credentials and their bookkeeping
//!
//! A single JSON file holds every credential, its usage counters, the
//! workspaces created on its behalf, and the video generation tasks it ran.
//! All writes go through one tokio Mutex and land on disk with an atomic
//! temp-file + rename, so a crash never leaves a half-written file.
//!
//! Record lifecycle:
//! 1. `insert_credential` assigns the next numeric id and creates zeroed stats
//! 2. `update_credential` / `update_with_stats` mutate under the lock
//! 3. `delete_credential` cascades to stats and workspace records
//! 4. `close` flushes the in-memory state one last time

pub mod error;
pub mod records;
pub mod store;

pub use error::{Error, Result};
pub use records::{
    BanReason, Credential, GenerationTask, MediaKind, TaskStatus, UsageStats, WorkspaceRecord,
};
pub use store::Store;
