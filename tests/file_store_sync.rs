mod support;

use std::sync::Arc;
use std::time::Duration;

use tasksync::bus::{BusEvent, EventBus, Topic};
use tasksync::config::StorageConfig;
use tasksync::engine::SyncEngine;
use tasksync::remote::{FileStore, StoreLimits};
use tasksync::store::TaskStore;
use tasksync::task::{NewTask, Status, TaskPatch};

use support::{channel_for, next_event};

fn open_store(path: &std::path::Path, origin: &str) -> (TaskStore, FileStore) {
    let remote = FileStore::open_as(path, "sync", StoreLimits::SYNC, origin).expect("open store");
    let engine = SyncEngine::new(
        Arc::new(remote.clone()),
        StorageConfig::default(),
        EventBus::new(),
    )
    .expect("engine");
    (TaskStore::new(engine), remote)
}

#[tokio::test]
async fn collection_survives_reopening() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.json");

    let (store, _) = open_store(&path, "first-run");
    store.initialize().await;
    let task = store.create(NewTask::new("remember me")).unwrap();
    store
        .update(&task.id, &TaskPatch::status(Status::InProgress))
        .unwrap();
    assert!(store.flush().await);
    let expected = store.all();
    drop(store);

    let (reopened, _) = open_store(&path, "second-run");
    assert_eq!(reopened.initialize().await, expected);
}

#[tokio::test]
async fn polling_picks_up_writes_from_another_handle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.json");

    let (store_a, _) = open_store(&path, "device-a");
    let (store_b, remote_b) = open_store(&path, "device-b");
    store_a.initialize().await;
    store_b.initialize().await;

    let mut changed = channel_for(store_b.engine().bus(), Topic::Changed);
    let watcher = store_b.engine().watch_remote();

    store_a.create(NewTask::new("written by a")).unwrap();
    assert!(store_a.flush().await);

    assert!(remote_b.poll().expect("poll"));
    match next_event(&mut changed).await {
        BusEvent::Changed(tasks) => assert_eq!(tasks, store_a.all()),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(store_b.all(), store_a.all());

    // Nothing new on disk: nothing to announce.
    assert!(!remote_b.poll().expect("poll"));
    watcher.abort();
}

#[tokio::test]
async fn watcher_reports_writes_from_another_handle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.json");

    let (store_a, _) = open_store(&path, "device-a");
    let (store_b, remote_b) = open_store(&path, "device-b");
    store_b.initialize().await;

    let mut changed = channel_for(store_b.engine().bus(), Topic::Changed);
    let _watch = remote_b.watch(Duration::from_millis(20)).expect("watch");
    let reconcile = store_b.engine().watch_remote();

    store_a.create(NewTask::new("seen through the watcher")).unwrap();
    assert!(store_a.flush().await);

    match next_event(&mut changed).await {
        BusEvent::Changed(tasks) => {
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].title, "seen through the watcher");
        }
        other => panic!("unexpected event {other:?}"),
    }
    reconcile.abort();
}
