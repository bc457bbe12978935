//! Sync storage engine
//!
//! Persists the task collection into a quota-limited [`RemoteStore`]:
//!
//! ```text
//! tm_meta      {"chunks": 3, "updated": 1718000000000}
//! tm_tasks_0   "[{\"i\":\"01hx...\",\"t\":\"Ship v2\", ..."
//! tm_tasks_1   "...,\"p\":2,\"s\":1,\"c\":1718000000000},{..."
//! tm_tasks_2   "...}]"
//! ```
//!
//! The metadata record is the single source of truth for how many fragment
//! keys exist. A write stores all new fragments together with the new
//! metadata in one batch and only then removes fragments past the new
//! count, so an interrupted write leaves either the old metadata pointing
//! at intact old fragments, or harmless orphans.
//!
//! Writes are debounced. The write path is a small state machine:
//!
//! ```text
//! Idle --save--> Scheduled --quiet period--> Writing --done--> Idle
//!                 ^   |                         |
//!                 +---+ save: re-arm timer      +--> Scheduled, if saved meanwhile
//! ```
//!
//! Remote failures never escape: they are logged and the operation is
//! treated as not having happened. The caller's in-memory collection stays
//! authoritative and the next save retries.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::bus::{BusEvent, EventBus};
use crate::codec;
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::remote::{Items, RemoteStore, StorageChange, StorageUsage};
use crate::task::Task;

/// Contents of the metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Number of fragment keys holding the current collection
    pub chunks: usize,
    /// Milliseconds since the epoch of the write that produced them
    pub updated: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePhase {
    Idle,
    Scheduled,
    Writing,
}

/// What a physical write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub fragments: usize,
    pub bytes: usize,
    pub removed: Vec<String>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    remote: Arc<dyn RemoteStore>,
    settings: StorageConfig,
    bus: Arc<EventBus>,
    runtime: Handle,
    state: Mutex<WriteState>,
    write_done: Notify,
}

struct WriteState {
    /// Latest collection waiting to be written
    pending: Option<Vec<Task>>,
    /// Armed debounce timer, if any
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever a timer is cancelled; stale timers compare and bail
    generation: u64,
    writing: bool,
    last_write_ok: bool,
}

impl WriteState {
    fn cancel_timer(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn phase(&self) -> WritePhase {
        if self.writing {
            WritePhase::Writing
        } else if self.timer.is_some() {
            WritePhase::Scheduled
        } else {
            WritePhase::Idle
        }
    }
}

/// Ends a physical write: clears the writing flag, re-arms the timer for
/// anything saved meanwhile and wakes flushers. Runs on drop so a write
/// that is cancelled or unwinds cannot leave the engine stuck in
/// [`WritePhase::Writing`].
struct WriteGuard<'a> {
    inner: &'a Arc<EngineInner>,
    ok: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock_state();
            state.writing = false;
            state.last_write_ok = self.ok;
            if state.pending.is_some() && state.timer.is_none() {
                self.inner.arm(&mut state);
            }
        }
        self.inner.write_done.notify_waiters();
    }
}

impl SyncEngine {
    /// Create an engine. Must be called from within a tokio runtime; the
    /// debounce timers and the reconciliation task are spawned onto it.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        settings: StorageConfig,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|err| Error::NoRuntime(err.to_string()))?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                remote,
                settings,
                bus,
                runtime,
                state: Mutex::new(WriteState {
                    pending: None,
                    timer: None,
                    generation: 0,
                    writing: false,
                    last_write_ok: true,
                }),
                write_done: Notify::new(),
            }),
        })
    }

    pub fn settings(&self) -> &StorageConfig {
        &self.inner.settings
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.remote
    }

    /// Read the persisted collection. Any read or decode failure yields an
    /// empty collection; the next successful write repairs the store.
    pub async fn load(&self) -> Vec<Task> {
        self.inner.load().await
    }

    /// Schedule `tasks` to be written once the debounce period passes with
    /// no further saves. Only the latest collection is ever written.
    pub fn save(&self, tasks: Vec<Task>) {
        let mut state = self.inner.lock_state();
        state.pending = Some(tasks);
        if state.writing {
            tracing::debug!("write in flight; scheduling another once it completes");
            return;
        }
        self.inner.arm(&mut state);
    }

    /// Write any pending collection now and wait until no write is in
    /// flight. Returns whether the last physical write succeeded (`true`
    /// when there was nothing to write).
    pub async fn flush(&self) -> bool {
        enum Step<'a> {
            Wait(Notified<'a>),
            Write(Vec<Task>),
        }

        loop {
            let step = {
                let mut state = self.inner.lock_state();
                if state.writing {
                    Step::Wait(self.inner.write_done.notified())
                } else if let Some(tasks) = state.pending.take() {
                    state.cancel_timer();
                    state.writing = true;
                    Step::Write(tasks)
                } else {
                    return state.last_write_ok;
                }
            };
            match step {
                Step::Wait(notified) => notified.await,
                Step::Write(tasks) => self.inner.write(tasks).await,
            }
        }
    }

    pub fn write_phase(&self) -> WritePhase {
        self.inner.lock_state().phase()
    }

    /// Bytes in use and total quota. `None` if the store cannot say.
    pub async fn usage(&self) -> Option<StorageUsage> {
        self.inner.usage().await
    }

    /// Start reconciling with changes made by other ends.
    ///
    /// Whenever fragment or metadata keys change and the change did not
    /// come from this engine's own store handle, the collection is reloaded
    /// and published as [`BusEvent::Loaded`] followed by
    /// [`BusEvent::Changed`]. The remote state replaces the local one
    /// wholesale; there is no merge.
    pub fn watch_remote(&self) -> JoinHandle<()> {
        let mut changes = self.inner.remote.subscribe();
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if !inner.is_foreign_change(&change) {
                            continue;
                        }
                        tracing::info!(
                            origin = %change.origin,
                            keys = change.changes.len(),
                            "remote change detected; reloading tasks"
                        );
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "missed remote change notifications; reloading tasks");
                    }
                    Err(RecvError::Closed) => break,
                }
                // One reload covers every notification already queued.
                while changes.try_recv().is_ok() {}

                let tasks = inner.load().await;
                inner.bus.publish(BusEvent::Loaded(tasks.clone()));
                inner.bus.publish(BusEvent::Changed(tasks));
            }
            tracing::debug!("remote change stream closed");
        })
    }
}

impl EngineInner {
    fn lock_state(&self) -> MutexGuard<'_, WriteState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// (Re)start the debounce timer.
    fn arm(self: &Arc<Self>, state: &mut WriteState) {
        state.cancel_timer();
        let generation = state.generation;
        let inner = Arc::clone(self);
        state.timer = Some(
            self.runtime
                .spawn(async move { inner.run_scheduled(generation).await }),
        );
        tracing::debug!(
            debounce_ms = self.settings.debounce_ms,
            "write scheduled"
        );
    }

    async fn run_scheduled(self: Arc<Self>, generation: u64) {
        tokio::time::sleep(self.settings.debounce()).await;
        let tasks = {
            let mut state = self.lock_state();
            if state.generation != generation || state.writing {
                return;
            }
            state.timer = None;
            let Some(tasks) = state.pending.take() else {
                return;
            };
            state.writing = true;
            tasks
        };
        self.write(tasks).await;
    }

    /// Perform one physical write. The caller has already marked the state
    /// as writing.
    async fn write(self: &Arc<Self>, tasks: Vec<Task>) {
        let mut guard = WriteGuard {
            inner: self,
            ok: false,
        };
        guard.ok = match self.persist(&tasks).await {
            Ok(report) => {
                tracing::debug!(
                    tasks = tasks.len(),
                    fragments = report.fragments,
                    bytes = report.bytes,
                    removed = report.removed.len(),
                    "tasks written"
                );
                if let Some(usage) = self.usage().await {
                    self.bus.publish(BusEvent::Usage(usage));
                }
                true
            }
            Err(err) => {
                tracing::error!(error = %err, tasks = tasks.len(), "failed to write tasks");
                false
            }
        };
    }

    async fn persist(&self, tasks: &[Task]) -> Result<WriteReport> {
        let old_count = match self.read_metadata().await {
            Ok(metadata) => metadata.map_or(0, |metadata| metadata.chunks),
            // Overwriting repairs it; older fragments may be orphaned.
            Err(Error::CorruptData(reason)) => {
                tracing::warn!(%reason, "ignoring unreadable metadata record");
                0
            }
            Err(err) => return Err(err),
        };

        let encoded = codec::encode(tasks)?;
        let fragments = codec::chunk(&encoded, self.settings.fragment_size);
        let new_count = fragments.len();

        let mut items: Items = fragments
            .into_iter()
            .enumerate()
            .map(|(index, fragment)| (self.settings.fragment_key(index), Value::String(fragment)))
            .collect();
        let metadata = SyncMetadata {
            chunks: new_count,
            updated: Utc::now().timestamp_millis(),
        };
        items.insert(self.settings.meta_key.clone(), serde_json::to_value(metadata)?);
        self.remote.set(items).await?;

        let stale: Vec<String> = (new_count..old_count)
            .map(|index| self.settings.fragment_key(index))
            .collect();
        let removed = if stale.is_empty() {
            stale
        } else {
            let result = self.remote.remove(&stale).await;
            match result {
                Ok(()) => stale,
                Err(err) => {
                    tracing::warn!(error = %err, orphaned = stale.len(), "failed to remove stale fragments");
                    Vec::new()
                }
            }
        };

        Ok(WriteReport {
            fragments: new_count,
            bytes: encoded.len(),
            removed,
        })
    }

    async fn load(&self) -> Vec<Task> {
        match self.try_load().await {
            Ok(tasks) => {
                if let Some(usage) = self.usage().await {
                    self.bus.publish(BusEvent::Usage(usage));
                }
                tasks
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to load tasks; continuing with none");
                Vec::new()
            }
        }
    }

    async fn try_load(&self) -> Result<Vec<Task>> {
        let count = self.read_metadata().await?.map_or(0, |metadata| metadata.chunks);
        if count == 0 {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = (0..count)
            .map(|index| self.settings.fragment_key(index))
            .collect();
        let items = self.remote.get(&keys).await?;
        let mut encoded = String::new();
        for key in &keys {
            match items.get(key) {
                Some(Value::String(fragment)) => encoded.push_str(fragment),
                Some(_) => {
                    return Err(Error::CorruptData(format!("fragment {key} is not a string")))
                }
                None => return Err(Error::CorruptData(format!("fragment {key} is missing"))),
            }
        }
        codec::decode(&encoded)
    }

    async fn read_metadata(&self) -> Result<Option<SyncMetadata>> {
        let key = self.settings.meta_key.clone();
        let items = self.remote.get(std::slice::from_ref(&key)).await?;
        let Some(value) = items.get(&key) else {
            return Ok(None);
        };
        let metadata: SyncMetadata = serde_json::from_value(value.clone())
            .map_err(|err| Error::CorruptData(format!("metadata record: {err}")))?;
        // Every fragment costs at least one byte of quota.
        if metadata.chunks as u64 > self.remote.limits().total_bytes {
            return Err(Error::CorruptData(format!(
                "metadata claims {} fragments",
                metadata.chunks
            )));
        }
        Ok(Some(metadata))
    }

    async fn usage(&self) -> Option<StorageUsage> {
        match self.remote.bytes_in_use(None).await {
            Ok(bytes_in_use) => Some(StorageUsage {
                bytes_in_use,
                quota_bytes: self.remote.limits().total_bytes,
            }),
            Err(err) => {
                tracing::debug!(error = %err, "storage usage unavailable");
                None
            }
        }
    }

    fn is_foreign_change(&self, change: &StorageChange) -> bool {
        change.area == self.settings.area
            && change.origin != self.remote.origin()
            && change
                .changes
                .keys()
                .any(|key| self.settings.owns_key(key))
    }
}
