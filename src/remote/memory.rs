//! In-process remote store.
//!
//! Handles created with [`MemoryStore::connect`] share one backend but carry
//! their own origin, so a test (or an embedding application) can stand up
//! two "devices" on the same account inside one process.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{
    apply_remove, apply_set, diff_items, usage_of, Items, RemoteStore, StorageChange, StoreLimits,
    CHANGE_CHANNEL_CAPACITY,
};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    origin: String,
}

struct Shared {
    area: String,
    limits: StoreLimits,
    changes: broadcast::Sender<StorageChange>,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    items: Items,
    writes: Vec<Items>,
    removals: Vec<Vec<String>>,
    reads: usize,
    fail_reads: bool,
    fail_writes: bool,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new(area: impl Into<String>, limits: StoreLimits) -> Self {
        Self::with_origin(area, limits, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_origin(
        area: impl Into<String>,
        limits: StoreLimits,
        origin: impl Into<String>,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                area: area.into(),
                limits,
                changes,
                state: Mutex::new(MemoryState::default()),
            }),
            origin: origin.into(),
        }
    }

    /// Another end on the same backend.
    pub fn connect(&self, origin: impl Into<String>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            origin: origin.into(),
        }
    }

    pub fn snapshot(&self) -> Items {
        self.state().items.clone()
    }

    /// Store a value directly, bypassing limits and notifications.
    pub fn insert_raw(&self, key: impl Into<String>, value: Value) {
        self.state().items.insert(key.into(), value);
    }

    /// Every successful `set` batch, oldest first.
    pub fn write_log(&self) -> Vec<Items> {
        self.state().writes.clone()
    }

    /// Every successful `remove` call, oldest first.
    pub fn removal_log(&self) -> Vec<Vec<String>> {
        self.state().removals.clone()
    }

    pub fn read_count(&self) -> usize {
        self.state().reads
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Delay every operation, simulating a slow network round trip.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn round_trip(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn notify(&self, before: &Items, after: &Items) {
        let changes = diff_items(before, after);
        if changes.is_empty() {
            return;
        }
        // No subscribers is fine.
        let _ = self.shared.changes.send(StorageChange {
            area: self.shared.area.clone(),
            origin: self.origin.clone(),
            changes,
        });
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn area(&self) -> &str {
        &self.shared.area
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn limits(&self) -> StoreLimits {
        self.shared.limits
    }

    async fn get(&self, keys: &[String]) -> Result<Items> {
        self.round_trip().await;
        let mut state = self.state();
        if state.fail_reads {
            return Err(Error::Remote("read failed".to_string()));
        }
        state.reads += 1;
        Ok(keys
            .iter()
            .filter_map(|key| {
                state
                    .items
                    .get(key)
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect())
    }

    async fn set(&self, items: Items) -> Result<()> {
        self.round_trip().await;
        let (before, after) = {
            let mut state = self.state();
            if state.fail_writes {
                return Err(Error::Remote("write failed".to_string()));
            }
            let next = apply_set(&state.items, items.clone(), self.shared.limits)?;
            let before = std::mem::replace(&mut state.items, next);
            state.writes.push(items);
            (before, state.items.clone())
        };
        self.notify(&before, &after);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        self.round_trip().await;
        let (before, after) = {
            let mut state = self.state();
            if state.fail_writes {
                return Err(Error::Remote("remove failed".to_string()));
            }
            let next = apply_remove(&state.items, keys);
            let before = std::mem::replace(&mut state.items, next);
            state.removals.push(keys.to_vec());
            (before, state.items.clone())
        };
        self.notify(&before, &after);
        Ok(())
    }

    async fn bytes_in_use(&self, keys: Option<&[String]>) -> Result<u64> {
        self.round_trip().await;
        let state = self.state();
        if state.fail_reads {
            return Err(Error::Remote("usage query failed".to_string()));
        }
        Ok(usage_of(&state.items, keys))
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.shared.changes.subscribe()
    }
}
