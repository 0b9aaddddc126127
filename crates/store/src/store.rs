//! JSON file store with atomic writes
//!
//! The whole dataset lives in memory behind a tokio Mutex and is rewritten to
//! disk after every mutation. Closures passed to the `update_*` methods run
//! while the lock is held, which makes each read-modify-write atomic with
//! respect to every other store call.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::records::{Credential, GenerationTask, UsageStats, WorkspaceRecord};

/// On-disk layout. `BTreeMap` keeps iteration in id order, which the
/// scheduler relies on for deterministic tie-breaking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Dataset {
    #[serde(default)]
    next_credential_id: u64,
    #[serde(default)]
    credentials: BTreeMap<u64, Credential>,
    #[serde(default)]
    stats: BTreeMap<u64, UsageStats>,
    #[serde(default)]
    workspaces: Vec<WorkspaceRecord>,
    #[serde(default)]
    tasks: BTreeMap<String, GenerationTask>,
}

struct State {
    data: Dataset,
    closed: bool,
}

/// Thread-safe store handle. Share it behind an `Arc`.
pub struct Store {
    path: PathBuf,
    state: Mutex<State>,
}

impl Store {
    /// Open the store at `path`.
    ///
    /// A missing file is a cold start: an empty dataset is written so the
    /// next open takes the normal path.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
            let data: Dataset = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing store file: {e}")))?;
            info!(
                path = %path.display(),
                credentials = data.credentials.len(),
                tasks = data.tasks.len(),
                "opened store"
            );
            data
        } else {
            info!(path = %path.display(), "store file not found, starting empty");
            let data = Dataset::default();
            write_atomic(&path, &data).await?;
            data
        };

        Ok(Self {
            path,
            state: Mutex::new(State {
                data,
                closed: false,
            }),
        })
    }

    /// Flush to disk and refuse further writes.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        write_atomic(&self.path, &state.data).await?;
        state.closed = true;
        info!(path = %self.path.display(), "store closed");
        Ok(())
    }

    // --- credentials ---

    /// Insert a new credential, assigning the next id and zeroed stats.
    pub async fn insert_credential(&self, mut credential: Credential) -> Result<Credential> {
        self.commit(|data| {
            data.next_credential_id += 1;
            let id = data.next_credential_id;
            credential.id = id;
            data.credentials.insert(id, credential.clone());
            data.stats.insert(id, UsageStats::new(id));
            debug!(credential_id = id, "inserted credential");
            Ok(credential)
        })
        .await
    }

    pub async fn get_credential(&self, id: u64) -> Option<Credential> {
        let state = self.state.lock().await;
        state.data.credentials.get(&id).cloned()
    }

    /// Look up a credential by its long-lived secret.
    pub async fn find_by_long_lived_secret(&self, secret: &str) -> Option<Credential> {
        let state = self.state.lock().await;
        state
            .data
            .credentials
            .values()
            .find(|c| c.long_lived_secret.expose() == secret)
            .cloned()
    }

    /// All credentials in id order.
    pub async fn list_credentials(&self) -> Vec<Credential> {
        let state = self.state.lock().await;
        state.data.credentials.values().cloned().collect()
    }

    /// Apply `f` to one credential and persist. Returns the updated record.
    pub async fn update_credential<F>(&self, id: u64, f: F) -> Result<Credential>
    where
        F: FnOnce(&mut Credential),
    {
        self.commit(|data| {
            let credential = data
                .credentials
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("credential {id}")))?;
            f(credential);
            debug!(credential_id = id, "updated credential");
            Ok(credential.clone())
        })
        .await
    }

    /// Apply `f` to a credential and its stats in one transaction.
    pub async fn update_with_stats<F, R>(&self, id: u64, f: F) -> Result<R>
    where
        F: FnOnce(&mut Credential, &mut UsageStats) -> R,
    {
        self.commit(|data| {
            let credential = data
                .credentials
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("credential {id}")))?;
            let stats = data.stats.entry(id).or_insert_with(|| UsageStats::new(id));
            Ok(f(credential, stats))
        })
        .await
    }

    /// Remove a credential with its stats and workspace records.
    ///
    /// Returns the removed credential if it existed.
    pub async fn delete_credential(&self, id: u64) -> Result<Option<Credential>> {
        if self.get_credential(id).await.is_none() {
            return Ok(None);
        }
        self.commit(|data| {
            let removed = data.credentials.remove(&id);
            if removed.is_some() {
                data.stats.remove(&id);
                data.workspaces.retain(|w| w.credential_id != id);
                debug!(credential_id = id, "deleted credential");
            }
            Ok(removed)
        })
        .await
    }

    // --- stats ---

    pub async fn get_stats(&self, id: u64) -> Option<UsageStats> {
        let state = self.state.lock().await;
        state.data.stats.get(&id).cloned()
    }

    /// Stats for every credential in id order.
    pub async fn list_stats(&self) -> Vec<UsageStats> {
        let state = self.state.lock().await;
        state.data.stats.values().cloned().collect()
    }

    // --- workspaces ---

    pub async fn insert_workspace(&self, record: WorkspaceRecord) -> Result<()> {
        self.commit(|data| {
            debug!(
                credential_id = record.credential_id,
                workspace_id = %record.workspace_id,
                "inserted workspace"
            );
            data.workspaces.push(record);
            Ok(())
        })
        .await
    }

    pub async fn workspaces_for(&self, credential_id: u64) -> Vec<WorkspaceRecord> {
        let state = self.state.lock().await;
        state
            .data
            .workspaces
            .iter()
            .filter(|w| w.credential_id == credential_id)
            .cloned()
            .collect()
    }

    // --- tasks ---

    pub async fn insert_task(&self, task: GenerationTask) -> Result<()> {
        self.commit(|data| {
            debug!(operation = %task.operation_name, "inserted task");
            data.tasks.insert(task.operation_name.clone(), task);
            Ok(())
        })
        .await
    }

    pub async fn get_task(&self, operation_name: &str) -> Option<GenerationTask> {
        let state = self.state.lock().await;
        state.data.tasks.get(operation_name).cloned()
    }

    pub async fn update_task<F>(&self, operation_name: &str, f: F) -> Result<GenerationTask>
    where
        F: FnOnce(&mut GenerationTask),
    {
        self.commit(|data| {
            let task = data
                .tasks
                .get_mut(operation_name)
                .ok_or_else(|| Error::NotFound(format!("task {operation_name}")))?;
            f(task);
            Ok(task.clone())
        })
        .await
    }

    /// Run `f` against a copy of the dataset and persist it. The in-memory
    /// dataset is replaced only after the write succeeds, so an `Err` leaves
    /// the store unchanged.
    async fn commit<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Dataset) -> Result<R>,
    {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }
        let mut next = state.data.clone();
        let out = f(&mut next)?;
        write_atomic(&self.path, &next).await?;
        state.data = next;
        Ok(out)
    }
}

/// Write the dataset atomically: temp file in the same directory, 0600
/// permissions, then rename over the target.
async fn write_atomic(path: &Path, data: &Dataset) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".store.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted store");
    Ok(())
}
