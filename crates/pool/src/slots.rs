//! Per-credential concurrency slots
//!
//! Counts image and video operations in flight for each credential against
//! its configured limit. A negative limit (or a credential the manager has
//! never seen) is uncapped, but in-flight work is still counted so health
//! output stays accurate.
//!
//! State is in-memory only and rebuilt from the store at startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use store::{Credential, MediaKind};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct SlotState {
    image_in_flight: u32,
    video_in_flight: u32,
    image_limit: i32,
    video_limit: i32,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            image_in_flight: 0,
            video_in_flight: 0,
            image_limit: -1,
            video_limit: -1,
        }
    }
}

impl SlotState {
    fn counter(&mut self, kind: MediaKind) -> &mut u32 {
        match kind {
            MediaKind::Image => &mut self.image_in_flight,
            MediaKind::Video => &mut self.video_in_flight,
        }
    }

    fn limit(&self, kind: MediaKind) -> i32 {
        match kind {
            MediaKind::Image => self.image_limit,
            MediaKind::Video => self.video_limit,
        }
    }

    fn has_room(&self, kind: MediaKind) -> bool {
        let limit = self.limit(kind);
        let in_flight = match kind {
            MediaKind::Image => self.image_in_flight,
            MediaKind::Video => self.video_in_flight,
        };
        limit < 0 || (in_flight as i64) < limit as i64
    }
}

/// Concurrency arbiter shared by the scheduler and the orchestrator.
///
/// Every check-and-increment happens under one mutex, so two callers can
/// never both take the last slot.
#[derive(Debug, Default)]
pub struct SlotManager {
    slots: Mutex<HashMap<u64, SlotState>>,
}

impl SlotManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, SlotState>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load limits for every credential, resetting in-flight counters.
    pub fn initialize(&self, credentials: &[Credential]) {
        let mut slots = self.lock();
        slots.clear();
        for credential in credentials {
            slots.insert(
                credential.id,
                SlotState {
                    image_limit: credential.image_concurrency,
                    video_limit: credential.video_concurrency,
                    ..SlotState::default()
                },
            );
        }
        debug!(credentials = slots.len(), "slot limits initialized");
    }

    /// Whether `acquire` would currently succeed. Does not mutate.
    pub fn can_acquire(&self, kind: MediaKind, id: u64) -> bool {
        self.lock()
            .get(&id)
            .map(|state| state.has_room(kind))
            .unwrap_or(true)
    }

    /// Take a slot if one is free. Returns false without side effects when
    /// the credential is at its limit.
    pub fn acquire(&self, kind: MediaKind, id: u64) -> bool {
        let mut slots = self.lock();
        let state = slots.entry(id).or_default();
        if !state.has_room(kind) {
            debug!(credential_id = id, kind = kind.label(), "slot denied");
            return false;
        }
        *state.counter(kind) += 1;
        true
    }

    /// Return a slot. Extra releases floor at zero.
    pub fn release(&self, kind: MediaKind, id: u64) {
        let mut slots = self.lock();
        if let Some(state) = slots.get_mut(&id) {
            let counter = state.counter(kind);
            *counter = counter.saturating_sub(1);
        }
    }

    /// Replace limits without touching in-flight counters.
    pub fn update_limits(&self, id: u64, image_limit: i32, video_limit: i32) {
        let mut slots = self.lock();
        let state = slots.entry(id).or_default();
        state.image_limit = image_limit;
        state.video_limit = video_limit;
        debug!(credential_id = id, image_limit, video_limit, "slot limits updated");
    }

    /// Forget a deleted credential.
    pub fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    pub fn in_flight(&self, kind: MediaKind, id: u64) -> u32 {
        self.lock()
            .get(&id)
            .map(|state| match kind {
                MediaKind::Image => state.image_in_flight,
                MediaKind::Video => state.video_in_flight,
            })
            .unwrap_or(0)
    }

    /// Acquire a slot that is released when the guard drops.
    pub fn try_acquire(self: &Arc<Self>, kind: MediaKind, id: u64) -> Option<SlotGuard> {
        if self.acquire(kind, id) {
            Some(SlotGuard {
                manager: Arc::clone(self),
                kind,
                id,
            })
        } else {
            None
        }
    }
}

/// Held slot. Dropping it releases the slot on every exit path.
#[derive(Debug)]
pub struct SlotGuard {
    manager: Arc<SlotManager>,
    kind: MediaKind,
    id: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.manager.release(self.kind, self.id);
    }
}
