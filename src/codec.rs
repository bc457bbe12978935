//! Compact wire format for the task collection.
//!
//! Field names are shortened to single letters and empty optional fields
//! are left out entirely, because every byte counts against the remote
//! store's quota and decides how many fragments a collection needs.
//!
//! ```text
//! i  id            t  title        p  priority ordinal
//! s  status ord.   c  created (ms) d  description (omitted when empty)
//! j  external link (omitted when absent)
//! u  due date (ms, omitted when absent)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::{Priority, Status, Task};

/// Encoding of an empty collection; also the lone fragment of an empty stream.
pub const EMPTY_COLLECTION: &str = "[]";

#[derive(Debug, Serialize, Deserialize)]
struct WireTask {
    #[serde(rename = "i")]
    id: String,
    #[serde(rename = "t")]
    title: String,
    #[serde(rename = "p")]
    priority: i64,
    #[serde(rename = "s")]
    status: i64,
    #[serde(rename = "c")]
    created: i64,
    #[serde(rename = "d", default, skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(rename = "j", default, skip_serializing_if = "Option::is_none")]
    external_link: Option<String>,
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    due_date: Option<i64>,
}

impl From<&Task> for WireTask {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            priority: i64::from(task.priority.ordinal()),
            status: i64::from(task.status.ordinal()),
            created: task.created.timestamp_millis(),
            description: task.description.clone(),
            external_link: task
                .external_link
                .clone()
                .filter(|link| !link.is_empty()),
            due_date: task.due_date.map(|due| due.timestamp_millis()),
        }
    }
}

impl TryFrom<WireTask> for Task {
    type Error = Error;

    fn try_from(wire: WireTask) -> Result<Self> {
        let priority = Priority::from_ordinal(wire.priority).ok_or_else(|| {
            Error::CorruptData(format!(
                "task {} has invalid priority ordinal {}",
                wire.id, wire.priority
            ))
        })?;
        let status = Status::from_ordinal(wire.status).ok_or_else(|| {
            Error::CorruptData(format!(
                "task {} has invalid status ordinal {}",
                wire.id, wire.status
            ))
        })?;
        let created = millis_to_datetime(wire.created, &wire.id)?;
        let due_date = wire
            .due_date
            .map(|due| millis_to_datetime(due, &wire.id))
            .transpose()?;
        Ok(Task {
            id: wire.id,
            title: wire.title,
            description: wire.description,
            priority,
            status,
            created,
            due_date,
            external_link: wire.external_link.filter(|link| !link.is_empty()),
        })
    }
}

fn millis_to_datetime(ms: i64, task_id: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        Error::CorruptData(format!("task {task_id} has out-of-range timestamp {ms}"))
    })
}

/// Encode an ordered collection into its compact JSON form.
pub fn encode(tasks: &[Task]) -> Result<String> {
    let wire: Vec<WireTask> = tasks.iter().map(WireTask::from).collect();
    Ok(serde_json::to_string(&wire)?)
}

/// Decode a compact JSON stream back into tasks, preserving order.
pub fn decode(encoded: &str) -> Result<Vec<Task>> {
    let wire: Vec<WireTask> = serde_json::from_str(encoded)?;
    wire.into_iter().map(Task::try_from).collect()
}

/// Split `encoded` into contiguous fragments of at most `max_bytes` bytes.
///
/// Splits never land inside a UTF-8 sequence; if `max_bytes` is smaller than
/// a single character, that character becomes its own (oversized) fragment.
/// An empty input yields exactly one fragment holding an empty collection.
pub fn chunk(encoded: &str, max_bytes: usize) -> Vec<String> {
    if encoded.is_empty() {
        return vec![EMPTY_COLLECTION.to_string()];
    }
    let max_bytes = max_bytes.max(1);
    let mut fragments = Vec::with_capacity(encoded.len() / max_bytes + 1);
    let mut start = 0;
    while start < encoded.len() {
        let mut end = (start + max_bytes).min(encoded.len());
        while !encoded.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = start + 1;
            while !encoded.is_char_boundary(end) {
                end += 1;
            }
        }
        fragments.push(encoded[start..end].to_string());
        start = end;
    }
    fragments
}

/// Concatenate fragments in index order.
pub fn reassemble<S: AsRef<str>>(fragments: &[S]) -> String {
    fragments.iter().map(AsRef::as_ref).collect()
}
