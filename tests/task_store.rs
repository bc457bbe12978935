mod support;

use std::time::Duration;

use tasksync::bus::{BusEvent, Topic};
use tasksync::task::{
    NewTask, Priority, SortDirection, SortField, Status, TaskFilter, TaskPatch,
};

use support::{at, channel_for, memory_store, next_event, store_on, Recorder};

#[tokio::test]
async fn created_task_is_retrievable_and_filterable() {
    let store = store_on(&memory_store("device-a"));
    let recorder = Recorder::attach(store.engine().bus());

    let task = store
        .create(
            NewTask::new("Ship v2")
                .with_priority(Priority::High)
                .with_status(Status::ToDo),
        )
        .unwrap();

    assert!(!task.id.is_empty());
    assert_eq!(task.priority.ordinal(), 2);
    assert_eq!(task.status.ordinal(), 1);
    assert_eq!(store.get(&task.id), Some(task.clone()));

    let todo = store.filter(&TaskFilter {
        status: Some(Status::ToDo),
        ..TaskFilter::default()
    });
    assert_eq!(todo, vec![task]);
    assert_eq!(recorder.topics(), vec![Topic::Created, Topic::Changed]);
}

#[tokio::test]
async fn update_changes_only_the_patched_fields() {
    let store = store_on(&memory_store("device-a"));
    let original = store
        .create(NewTask::new("Ship v2").with_priority(Priority::High))
        .unwrap();
    let recorder = Recorder::attach(store.engine().bus());

    let updated = store
        .update(&original.id, &TaskPatch::status(Status::Done))
        .unwrap()
        .expect("task exists");

    assert_eq!(updated.status, Status::Done);
    assert_eq!(updated.id, original.id);
    assert_eq!(updated.created, original.created);
    assert_eq!(updated.title, original.title);
    assert_eq!(updated.priority, original.priority);
    assert_eq!(recorder.count(Topic::Changed), 1);
    assert_eq!(recorder.topics(), vec![Topic::Updated, Topic::Changed]);
}

#[tokio::test]
async fn delete_reports_whether_anything_was_removed() {
    let store = store_on(&memory_store("device-a"));
    let task = store.create(NewTask::new("short lived")).unwrap();
    let recorder = Recorder::attach(store.engine().bus());

    assert!(store.delete(&task.id));
    assert!(!store.delete(&task.id));
    assert!(store.all().is_empty());
    match recorder.events().first() {
        Some(BusEvent::Deleted(deleted)) => assert_eq!(deleted.id, task.id),
        other => panic!("expected deleted event, got {other:?}"),
    }
    assert_eq!(recorder.topics(), vec![Topic::Deleted, Topic::Changed]);
}

#[tokio::test]
async fn filters_combine_with_and() {
    let store = store_on(&memory_store("device-a"));
    let hit = store
        .create(NewTask::new("Fix the X axis").with_priority(Priority::High))
        .unwrap();
    store
        .create(NewTask::new("Fix the x label").with_priority(Priority::Low))
        .unwrap();
    let described = store
        .create(
            NewTask::new("Chart polish")
                .with_description("mentions X in the body")
                .with_priority(Priority::High),
        )
        .unwrap();
    store
        .create(NewTask::new("Unrelated").with_priority(Priority::High))
        .unwrap();

    let found = store.filter(&TaskFilter {
        search: "x".to_string(),
        priority: Some(Priority::High),
        status: None,
    });
    let ids: Vec<_> = found.iter().map(|task| task.id.clone()).collect();
    assert_eq!(ids, vec![described.id, hit.id]);
}

#[tokio::test]
async fn tasks_without_due_date_sort_last_both_ways() {
    let store = store_on(&memory_store("device-a"));
    store.create(NewTask::new("none")).unwrap();
    store
        .create(NewTask::new("third").with_due_date(at(3)))
        .unwrap();
    store
        .create(NewTask::new("first").with_due_date(at(1)))
        .unwrap();
    store.create(NewTask::new("also none")).unwrap();
    store
        .create(NewTask::new("second").with_due_date(at(2)))
        .unwrap();

    let titles = |direction| {
        store
            .sort(&store.all(), SortField::DueDate, direction)
            .into_iter()
            .map(|task| task.title)
            .collect::<Vec<_>>()
    };
    assert_eq!(
        titles(SortDirection::Asc),
        vec!["first", "second", "third", "also none", "none"]
    );
    assert_eq!(
        titles(SortDirection::Desc),
        vec!["third", "second", "first", "also none", "none"]
    );
}

#[tokio::test(start_paused = true)]
async fn rapid_edits_persist_once_with_the_latest_state() {
    let remote = memory_store("device-a");
    let store = store_on(&remote);
    store.create(NewTask::new("first")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.create(NewTask::new("second")).unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(remote.write_log().len(), 1);
    assert_eq!(store.engine().load().await, store.all());
}

#[tokio::test]
async fn initialize_adopts_the_persisted_collection() {
    let remote = memory_store("device-a");
    let writer = store_on(&remote);
    writer.create(NewTask::new("persisted")).unwrap();
    assert!(writer.flush().await);

    let reader = store_on(&remote);
    let recorder = Recorder::attach(reader.engine().bus());
    let loaded = reader.initialize().await;
    assert_eq!(loaded, writer.all());
    assert_eq!(reader.all(), writer.all());
    assert!(recorder.topics().contains(&Topic::Loaded));
}

#[tokio::test]
async fn edits_on_another_end_replace_the_local_collection() {
    let device_a = memory_store("device-a");
    let device_b = device_a.connect("device-b");
    let store_a = store_on(&device_a);
    let store_b = store_on(&device_b);
    store_a.initialize().await;
    store_b.initialize().await;

    store_a.create(NewTask::new("local only")).unwrap();
    let mut changed = channel_for(store_a.engine().bus(), Topic::Changed);
    let watcher = store_a.engine().watch_remote();

    store_b.create(NewTask::new("from b")).unwrap();
    assert!(store_b.flush().await);

    match next_event(&mut changed).await {
        BusEvent::Changed(tasks) => assert_eq!(tasks, store_b.all()),
        other => panic!("unexpected event {other:?}"),
    }
    // Last writer wins: the unsaved local task is gone.
    assert_eq!(store_a.all(), store_b.all());
    watcher.abort();
}
