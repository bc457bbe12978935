//! In-process publish/subscribe hub.
//!
//! Delivery is synchronous: `publish` calls every handler registered for the
//! event's topic, in registration order, on the caller's thread. Events with
//! no subscribers are dropped. A handler that returns an error or panics is
//! logged and skipped; the remaining handlers still run and the publisher
//! never sees the failure.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;

use crate::remote::StorageUsage;
use crate::task::Task;

/// Topics published by the task store and the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Loaded,
    Created,
    Updated,
    Deleted,
    Changed,
    Usage,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Loaded,
        Topic::Created,
        Topic::Updated,
        Topic::Deleted,
        Topic::Changed,
        Topic::Usage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Loaded => "tasks:loaded",
            Topic::Created => "task:created",
            Topic::Updated => "task:updated",
            Topic::Deleted => "task:deleted",
            Topic::Changed => "tasks:changed",
            Topic::Usage => "storage:usage",
        }
    }
}

/// An event together with its payload. The topic is implied by the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Loaded(Vec<Task>),
    Created(Task),
    Updated(Task),
    Deleted(Task),
    Changed(Vec<Task>),
    Usage(StorageUsage),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::Loaded(_) => Topic::Loaded,
            BusEvent::Created(_) => Topic::Created,
            BusEvent::Updated(_) => Topic::Updated,
            BusEvent::Deleted(_) => Topic::Deleted,
            BusEvent::Changed(_) => Topic::Changed,
            BusEvent::Usage(_) => Topic::Usage,
        }
    }
}

pub type Handler = Arc<dyn Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<Topic, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `handler` for `topic`.
    ///
    /// Registering the same handler (the same `Arc`) twice for one topic
    /// keeps a single registration; both returned subscriptions refer to it.
    pub fn subscribe(self: &Arc<Self>, topic: Topic, handler: Handler) -> Subscription {
        let mut topics = self.lock_topics();
        let registrations = topics.entry(topic).or_default();
        let existing = registrations
            .iter()
            .find(|registration| same_handler(&registration.handler, &handler))
            .map(|registration| registration.id);
        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                registrations.push(Registration { id, handler });
                id
            }
        };
        Subscription {
            bus: Arc::downgrade(self),
            topic,
            id,
        }
    }

    /// Register an infallible closure for `topic`.
    pub fn on<F>(self: &Arc<Self>, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.subscribe(
            topic,
            Arc::new(move |event: &BusEvent| -> anyhow::Result<()> {
                handler(event);
                Ok(())
            }),
        )
    }

    /// Deliver `event` to the handlers currently registered for its topic.
    /// Returns how many handlers completed without error.
    pub fn publish(&self, event: BusEvent) -> usize {
        let topic = event.topic();
        // Handlers run outside the lock so they may publish or (un)subscribe.
        let handlers: Vec<Handler> = self
            .lock_topics()
            .get(&topic)
            .map(|registrations| {
                registrations
                    .iter()
                    .map(|registration| Arc::clone(&registration.handler))
                    .collect()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    tracing::error!(topic = topic.as_str(), error = %err, "event handler failed");
                }
                Err(payload) => {
                    tracing::error!(
                        topic = topic.as_str(),
                        panic = panic_message(payload.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.lock_topics().get(&topic).map_or(0, Vec::len)
    }

    fn unsubscribe(&self, topic: Topic, id: u64) -> bool {
        let mut topics = self.lock_topics();
        let Some(registrations) = topics.get_mut(&topic) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|registration| registration.id != id);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            topics.remove(&topic);
        }
        removed
    }

    fn lock_topics(&self) -> MutexGuard<'_, HashMap<Topic, Vec<Registration>>> {
        // A poisoned map is still structurally sound; keep serving it.
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Capability to remove one registration from the bus.
///
/// Dropping a `Subscription` leaves the handler registered.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<EventBus>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Remove the registration. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.unsubscribe(self.topic, self.id))
    }
}

fn same_handler(left: &Handler, right: &Handler) -> bool {
    std::ptr::eq(
        Arc::as_ptr(left) as *const (),
        Arc::as_ptr(right) as *const (),
    )
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NewTask, Task};
    use chrono::Utc;

    fn sample() -> Task {
        Task::from_new(NewTask::new("sample"), "t1".to_string(), Utc::now()).unwrap()
    }

    fn recorder(
        bus: &Arc<EventBus>,
        topic: Topic,
        label: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) {
        let log = Arc::clone(log);
        bus.on(topic, move |_| log.lock().unwrap().push(label));
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, Topic::Created, "first", &log);
        recorder(&bus, Topic::Created, "second", &log);
        recorder(&bus, Topic::Deleted, "other-topic", &log);

        assert_eq!(bus.publish(BusEvent::Created(sample())), 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(BusEvent::Changed(Vec::new())), 0);
    }

    #[test]
    fn failing_handlers_do_not_stop_delivery() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            Topic::Changed,
            Arc::new(|_: &BusEvent| -> anyhow::Result<()> { Err(anyhow::anyhow!("boom")) }),
        );
        bus.on(Topic::Changed, |_| panic!("handler panic"));
        recorder(&bus, Topic::Changed, "survivor", &log);

        assert_eq!(bus.publish(BusEvent::Changed(Vec::new())), 1);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn unsubscribe_removes_exactly_that_registration() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first_log = Arc::clone(&log);
        let first = bus.on(Topic::Updated, move |_| first_log.lock().unwrap().push("first"));
        recorder(&bus, Topic::Updated, "second", &log);

        assert!(first.unsubscribe());
        bus.publish(BusEvent::Updated(sample()));
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
        assert_eq!(bus.subscriber_count(Topic::Updated), 1);
    }

    #[test]
    fn same_handler_subscribed_twice_is_registered_once() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let handler: Handler = Arc::new(move |_: &BusEvent| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let first = bus.subscribe(Topic::Loaded, Arc::clone(&handler));
        let second = bus.subscribe(Topic::Loaded, handler);

        bus.publish(BusEvent::Loaded(Vec::new()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(first.unsubscribe());
        assert!(!second.unsubscribe());
        assert_eq!(bus.subscriber_count(Topic::Loaded), 0);
    }

    #[test]
    fn handlers_may_publish_reentrantly() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner_bus = Arc::downgrade(&bus);
        bus.on(Topic::Created, move |_| {
            if let Some(bus) = inner_bus.upgrade() {
                bus.publish(BusEvent::Changed(Vec::new()));
            }
        });
        recorder(&bus, Topic::Changed, "changed", &log);

        bus.publish(BusEvent::Created(sample()));
        assert_eq!(*log.lock().unwrap(), vec!["changed"]);
    }
}
