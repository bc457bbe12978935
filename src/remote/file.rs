//! File-backed remote store shared between processes.
//!
//! The whole store is one JSON document:
//!
//! ```text
//! { "writer": "<origin of the last writer>", "items": { "<key>": <value>, ... } }
//! ```
//!
//! Reads and writes happen under the document's lock file (see
//! [`crate::lock`]). Changes made through this handle are announced
//! immediately; changes made by other processes are picked up by
//! [`FileStore::poll`], which a [`FileStore::watch`] thread runs whenever
//! the filesystem reports activity next to the document.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{
    apply_remove, apply_set, diff_items, usage_of, Items, RemoteStore, StorageChange, StoreLimits,
    CHANGE_CHANNEL_CAPACITY,
};
use crate::error::{Error, Result};
use crate::lock::{self, DEFAULT_LOCK_TIMEOUT_MS};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    writer: String,
    #[serde(default)]
    items: Items,
}

#[derive(Clone)]
pub struct FileStore {
    inner: Arc<FileInner>,
}

struct FileInner {
    path: PathBuf,
    area: String,
    origin: String,
    limits: StoreLimits,
    changes: broadcast::Sender<StorageChange>,
    /// Items as of the last read or write through this handle.
    last_seen: Mutex<Items>,
}

impl FileStore {
    /// Open (or lazily create) the store document at `path`.
    pub fn open(
        path: impl Into<PathBuf>,
        area: impl Into<String>,
        limits: StoreLimits,
    ) -> Result<Self> {
        Self::open_as(path, area, limits, uuid::Uuid::new_v4().to_string())
    }

    pub fn open_as(
        path: impl Into<PathBuf>,
        area: impl Into<String>,
        limits: StoreLimits,
        origin: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let inner = FileInner {
            path,
            area: area.into(),
            origin: origin.into(),
            limits,
            changes,
            last_seen: Mutex::new(Items::new()),
        };
        let initial = inner.read_locked()?;
        *inner.last_seen() = initial.items;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Re-read the document and announce anything another process changed.
    /// Returns whether a change was announced.
    pub fn poll(&self) -> Result<bool> {
        self.inner.poll()
    }

    /// Watch the document's directory and [`poll`](Self::poll) after each
    /// quiet period of `debounce`. The watch stops when the handle drops.
    pub fn watch(&self, debounce: Duration) -> Result<WatchHandle> {
        let dir = self
            .inner
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;

        let (event_tx, event_rx) = mpsc::channel();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            let _ = event_tx.send(res);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            // Keep the watcher alive for as long as the loop runs.
            let _watcher = watcher;
            let idle_tick = Duration::from_millis(250);
            let mut pending: Option<Instant> = None;

            while !thread_stop.load(Ordering::Relaxed) {
                let timeout = pending
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                    .unwrap_or(idle_tick);
                match event_rx.recv_timeout(timeout) {
                    Ok(Ok(_)) => {
                        pending = Some(Instant::now() + debounce);
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(error = %err, "store watcher reported an error");
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if pending.take().is_some() {
                            if let Err(err) = inner.poll() {
                                tracing::warn!(
                                    error = %err,
                                    path = %inner.path.display(),
                                    "failed to re-read store document"
                                );
                            }
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            tracing::debug!(path = %inner.path.display(), "store watcher stopped");
        });

        Ok(WatchHandle { stop })
    }

    async fn blocking<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileInner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || operation(inner.as_ref()))
            .await
            .map_err(|err| Error::Remote(format!("store task failed: {err}")))?
    }
}

/// Stops the watch thread when dropped.
pub struct WatchHandle {
    stop: Arc<AtomicBool>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl FileInner {
    fn last_seen(&self) -> MutexGuard<'_, Items> {
        self.last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_document(&self) -> Result<Document> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(Document::default()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|err| {
                Error::CorruptData(format!("{}: {err}", self.path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn read_locked(&self) -> Result<Document> {
        lock::with_lock(&self.path, DEFAULT_LOCK_TIMEOUT_MS, || self.read_document())
    }

    /// Read-modify-write under the lock, then announce the difference.
    ///
    /// `last_seen` only moves while the lock is held, so a concurrent
    /// [`FileInner::poll`] sees either the state before this write or after.
    fn update(&self, change: impl FnOnce(&Items) -> Result<Items>) -> Result<()> {
        let (previously_seen, current, after) =
            lock::with_lock(&self.path, DEFAULT_LOCK_TIMEOUT_MS, || {
                let current = self.read_document()?;
                let next = Document {
                    writer: self.origin.clone(),
                    items: change(&current.items)?,
                };
                lock::write_atomic(&self.path, &serde_json::to_vec_pretty(&next)?)?;
                let previously_seen =
                    std::mem::replace(&mut *self.last_seen(), next.items.clone());
                Ok((previously_seen, current, next.items))
            })?;
        // Anything another process wrote since our last look is announced
        // under its writer first, so our own change stays attributable to us.
        self.announce(&previously_seen, &current.items, &current.writer);
        self.announce(&current.items, &after, &self.origin);
        Ok(())
    }

    fn poll(&self) -> Result<bool> {
        let (previously_seen, document) =
            lock::with_lock(&self.path, DEFAULT_LOCK_TIMEOUT_MS, || {
                let document = self.read_document()?;
                let previously_seen =
                    std::mem::replace(&mut *self.last_seen(), document.items.clone());
                Ok((previously_seen, document))
            })?;
        Ok(self.announce(&previously_seen, &document.items, &document.writer))
    }

    fn announce(&self, before: &Items, after: &Items, origin: &str) -> bool {
        let changes = diff_items(before, after);
        if changes.is_empty() {
            return false;
        }
        let origin = if origin.is_empty() { "external" } else { origin };
        let _ = self.changes.send(StorageChange {
            area: self.area.clone(),
            origin: origin.to_string(),
            changes,
        });
        true
    }
}

#[async_trait]
impl RemoteStore for FileStore {
    fn area(&self) -> &str {
        &self.inner.area
    }

    fn origin(&self) -> &str {
        &self.inner.origin
    }

    fn limits(&self) -> StoreLimits {
        self.inner.limits
    }

    async fn get(&self, keys: &[String]) -> Result<Items> {
        let keys = keys.to_vec();
        self.blocking(move |inner| {
            let document = inner.read_locked()?;
            Ok(keys
                .into_iter()
                .filter_map(|key| {
                    let value = document.items.get(&key)?.clone();
                    Some((key, value))
                })
                .collect())
        })
        .await
    }

    async fn set(&self, items: Items) -> Result<()> {
        self.blocking(move |inner| {
            let limits = inner.limits;
            inner.update(|current| apply_set(current, items, limits))
        })
        .await
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let keys = keys.to_vec();
        self.blocking(move |inner| inner.update(|current| Ok(apply_remove(current, &keys))))
            .await
    }

    async fn bytes_in_use(&self, keys: Option<&[String]>) -> Result<u64> {
        let keys = keys.map(<[String]>::to_vec);
        self.blocking(move |inner| {
            let document = inner.read_locked()?;
            Ok(usage_of(&document.items, keys.as_deref()))
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.inner.changes.subscribe()
    }
}
