//! The authoritative in-memory task collection.
//!
//! Every mutation goes through [`TaskStore`]: the cache is changed first,
//! then a debounced write is scheduled on the [`SyncEngine`], then the bus
//! is told. Reads hand out copies; nothing outside the store holds a
//! reference into the cache.
//!
//! Collections reloaded by the engine after a change on another end arrive
//! as [`BusEvent::Loaded`] and replace the cache wholesale.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::{BusEvent, EventBus, Subscription, Topic};
use crate::engine::SyncEngine;
use crate::error::Result;
use crate::task::{
    new_task_id, now_millis, sort_tasks, NewTask, SortDirection, SortField, Status, Task,
    TaskFilter, TaskPatch,
};

type Cache = Arc<Mutex<Vec<Task>>>;

/// Counts over the collection at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub total: usize,
    pub by_status: BTreeMap<Status, usize>,
    pub overdue: usize,
}

pub struct TaskStore {
    engine: SyncEngine,
    cache: Cache,
    adoption: Option<Subscription>,
}

impl TaskStore {
    /// Create an empty store on top of `engine`. Call [`initialize`] to
    /// read the persisted collection.
    ///
    /// [`initialize`]: TaskStore::initialize
    pub fn new(engine: SyncEngine) -> Self {
        let cache: Cache = Arc::new(Mutex::new(Vec::new()));
        let adopted = Arc::clone(&cache);
        let adoption = engine.bus().on(Topic::Loaded, move |event| {
            if let BusEvent::Loaded(tasks) = event {
                *lock(&adopted) = tasks.clone();
            }
        });
        Self {
            engine,
            cache,
            adoption: Some(adoption),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    fn bus(&self) -> &Arc<EventBus> {
        self.engine.bus()
    }

    /// Load the persisted collection, adopt it, and publish `Loaded`.
    pub async fn initialize(&self) -> Vec<Task> {
        let tasks = self.engine.load().await;
        *lock(&self.cache) = tasks.clone();
        self.bus().publish(BusEvent::Loaded(tasks.clone()));
        tracing::debug!(tasks = tasks.len(), "task store initialized");
        tasks
    }

    pub fn create(&self, new: NewTask) -> Result<Task> {
        let task = Task::from_new(new, new_task_id(), now_millis())?;
        let snapshot = {
            let mut cache = lock(&self.cache);
            cache.insert(0, task.clone());
            cache.clone()
        };
        tracing::info!(id = %task.id, "task created");
        self.commit(BusEvent::Created(task.clone()), snapshot);
        Ok(task)
    }

    /// Merge `patch` into the task with `id`. `Ok(None)` when no such task
    /// exists; a patch that fails validation changes nothing.
    pub fn update(&self, id: &str, patch: &TaskPatch) -> Result<Option<Task>> {
        let (updated, snapshot) = {
            let mut cache = lock(&self.cache);
            let Some(slot) = cache.iter_mut().find(|task| task.id == id) else {
                return Ok(None);
            };
            let updated = slot.apply(patch)?;
            *slot = updated.clone();
            (updated, cache.clone())
        };
        tracing::info!(id = %updated.id, "task updated");
        self.commit(BusEvent::Updated(updated.clone()), snapshot);
        Ok(Some(updated))
    }

    /// Remove the task with `id`. Returns `false` if it was not there.
    pub fn delete(&self, id: &str) -> bool {
        let (removed, snapshot) = {
            let mut cache = lock(&self.cache);
            let Some(index) = cache.iter().position(|task| task.id == id) else {
                return false;
            };
            let removed = cache.remove(index);
            (removed, cache.clone())
        };
        tracing::info!(id = %removed.id, "task deleted");
        self.commit(BusEvent::Deleted(removed), snapshot);
        true
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        lock(&self.cache).iter().find(|task| task.id == id).cloned()
    }

    /// The whole collection, newest first.
    pub fn all(&self) -> Vec<Task> {
        lock(&self.cache).clone()
    }

    pub fn filter(&self, filter: &TaskFilter) -> Vec<Task> {
        lock(&self.cache)
            .iter()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect()
    }

    pub fn sort(&self, tasks: &[Task], field: SortField, direction: SortDirection) -> Vec<Task> {
        sort_tasks(tasks, field, direction)
    }

    pub fn summary(&self, now: DateTime<Utc>) -> TaskSummary {
        let cache = lock(&self.cache);
        let mut by_status: BTreeMap<Status, usize> =
            Status::ALL.into_iter().map(|status| (status, 0)).collect();
        for task in cache.iter() {
            *by_status.entry(task.status).or_default() += 1;
        }
        TaskSummary {
            total: cache.len(),
            by_status,
            overdue: cache.iter().filter(|task| task.is_overdue(now)).count(),
        }
    }

    /// Write any pending changes now. See [`SyncEngine::flush`].
    pub async fn flush(&self) -> bool {
        self.engine.flush().await
    }

    fn commit(&self, event: BusEvent, snapshot: Vec<Task>) {
        self.engine.save(snapshot.clone());
        self.bus().publish(event);
        self.bus().publish(BusEvent::Changed(snapshot));
    }
}

impl Drop for TaskStore {
    fn drop(&mut self) {
        if let Some(adoption) = self.adoption.take() {
            adoption.unsubscribe();
        }
    }
}

fn lock(cache: &Cache) -> MutexGuard<'_, Vec<Task>> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
