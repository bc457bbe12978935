#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tasksync::bus::{BusEvent, EventBus, Topic};
use tasksync::config::StorageConfig;
use tasksync::engine::SyncEngine;
use tasksync::remote::{MemoryStore, StoreLimits};
use tasksync::store::TaskStore;
use tasksync::task::{NewTask, Task};
use tokio::sync::mpsc;

pub fn memory_store(origin: &str) -> MemoryStore {
    MemoryStore::with_origin("sync", StoreLimits::SYNC, origin)
}

pub fn settings(fragment_size: usize) -> StorageConfig {
    StorageConfig {
        fragment_size,
        ..StorageConfig::default()
    }
}

pub fn engine_on(remote: &MemoryStore, settings: StorageConfig) -> SyncEngine {
    SyncEngine::new(Arc::new(remote.clone()), settings, EventBus::new()).expect("engine")
}

pub fn store_on(remote: &MemoryStore) -> TaskStore {
    TaskStore::new(engine_on(remote, StorageConfig::default()))
}

pub fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, day, 9, 0, 0)
        .single()
        .expect("valid date")
}

pub fn task(id: &str, title: &str) -> Task {
    Task::from_new(NewTask::new(title), id.to_string(), at(1)).expect("task")
}

pub fn tasks(count: usize) -> Vec<Task> {
    (0..count)
        .map(|i| {
            Task::from_new(
                NewTask::new(format!("task number {i}"))
                    .with_description("some words to make the collection bigger"),
                format!("id-{i:04}"),
                at(1 + (i % 20) as u32),
            )
            .expect("task")
        })
        .collect()
}

/// Records every event published on a bus, in order.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<BusEvent>>>,
}

impl Recorder {
    pub fn attach(bus: &Arc<EventBus>) -> Self {
        let recorder = Self::default();
        for topic in Topic::ALL {
            let events = Arc::clone(&recorder.events);
            bus.on(topic, move |event| events.lock().unwrap().push(event.clone()));
        }
        recorder
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.events().iter().map(BusEvent::topic).collect()
    }

    pub fn count(&self, topic: Topic) -> usize {
        self.topics().into_iter().filter(|t| *t == topic).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

/// Forwards every event on `topic` to a channel the test can await.
pub fn channel_for(bus: &Arc<EventBus>, topic: Topic) -> mpsc::UnboundedReceiver<BusEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.on(topic, move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<BusEvent>) -> BusEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within timeout")
        .expect("channel open")
}
