//! Event output for external integrations.
//!
//! Bus events are emitted as JSON lines to stdout or a configured file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::{BusEvent, EventBus, Subscription, Topic};
use crate::error::{Error, Result};

pub const EVENT_SCHEMA_VERSION: &str = "tasksync.event.v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDestination {
    Stdout,
    File(PathBuf),
}

impl EventDestination {
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        raw.and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return None;
            }
            if trimmed == "-" {
                return Some(EventDestination::Stdout);
            }
            Some(EventDestination::File(PathBuf::from(trimmed)))
        })
    }

    pub fn open(&self) -> Result<EventSink> {
        match self {
            EventDestination::Stdout => Ok(EventSink::stdout()),
            EventDestination::File(path) => EventSink::file(path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TasksLoaded,
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    TasksChanged,
    StorageUsage,
}

impl From<Topic> for EventKind {
    fn from(topic: Topic) -> Self {
        match topic {
            Topic::Loaded => EventKind::TasksLoaded,
            Topic::Created => EventKind::TaskCreated,
            Topic::Updated => EventKind::TaskUpdated,
            Topic::Deleted => EventKind::TaskDeleted,
            Topic::Changed => EventKind::TasksChanged,
            Topic::Usage => EventKind::StorageUsage,
        }
    }
}

/// A structured event with optional payload.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub schema_version: &'static str,
    pub event: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn new(event: EventKind) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            event,
            timestamp: Utc::now(),
            data: None,
        }
    }

    /// Attach a serializable payload to the event.
    pub fn with_data<T: Serialize>(mut self, data: T) -> Result<Self> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }

    pub fn from_bus(event: &BusEvent) -> Result<Self> {
        let kind = EventKind::from(event.topic());
        match event {
            BusEvent::Loaded(tasks) | BusEvent::Changed(tasks) => {
                Event::new(kind).with_data(serde_json::json!({
                    "count": tasks.len(),
                    "tasks": tasks,
                }))
            }
            BusEvent::Created(task) | BusEvent::Updated(task) | BusEvent::Deleted(task) => {
                Event::new(kind).with_data(task)
            }
            BusEvent::Usage(usage) => Event::new(kind).with_data(serde_json::json!({
                "bytes_in_use": usage.bytes_in_use,
                "quota_bytes": usage.quota_bytes,
                "percent": usage.percent(),
            })),
        }
    }
}

/// Event sink that writes JSONL output to a destination.
pub struct EventSink {
    writer: Box<dyn Write + Send>,
}

impl EventSink {
    /// Emit events to stdout.
    pub fn stdout() -> Self {
        Self::from_writer(std::io::stdout())
    }

    /// Emit events to a file, creating it if necessary.
    pub fn file(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self::from_writer(file))
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Box::new(writer),
        }
    }

    /// Write a single event as JSONL.
    pub fn emit(&mut self, event: &Event) -> Result<()> {
        let serialized = serde_json::to_vec(event)?;
        self.writer.write_all(&serialized)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush().map_err(Error::Io)?;
        Ok(())
    }

    /// Forward every topic on `bus` to `sink`. Write failures are reported
    /// through the bus's handler error logging.
    pub fn attach(bus: &Arc<EventBus>, sink: EventSink) -> Vec<Subscription> {
        let sink = Arc::new(Mutex::new(sink));
        let handler: crate::bus::Handler = Arc::new(move |event: &BusEvent| -> anyhow::Result<()> {
            let event = Event::from_bus(event)?;
            let mut sink = sink
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sink.emit(&event)?;
            Ok(())
        });
        Topic::ALL
            .into_iter()
            .map(|topic| bus.subscribe(topic, Arc::clone(&handler)))
            .collect()
    }
}
