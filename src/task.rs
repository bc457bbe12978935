//! Task records and the rules for filtering and ordering them.
//!
//! A [`Task`] is the only entity tasksync persists. Priorities and statuses
//! are fixed, ordered enumerations; their ordinals are what goes over the
//! wire, so the order of the variants below is part of the storage format.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Task priority, ordered from least to most urgent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Critical,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(value: i64) -> Option<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
    }

    pub fn label(self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Medium => "Medium",
            Priority::High => "High",
            Priority::Critical => "Critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if let Ok(ordinal) = trimmed.parse::<i64>() {
            return Self::from_ordinal(ordinal).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "priority ordinal {ordinal} out of range (0-{})",
                    Self::ALL.len() - 1
                ))
            });
        }
        let key = normalize_name(trimmed);
        Self::ALL
            .into_iter()
            .find(|priority| normalize_name(priority.label()) == key)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "unknown priority '{trimmed}' (expected low|medium|high|critical)"
                ))
            })
    }
}

/// Workflow status, ordered along the board from left to right.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Backlog,
    #[default]
    ToDo,
    InProgress,
    Review,
    Done,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Backlog,
        Status::ToDo,
        Status::InProgress,
        Status::Review,
        Status::Done,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(value: i64) -> Option<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::Backlog => "Backlog",
            Status::ToDo => "To Do",
            Status::InProgress => "In Progress",
            Status::Review => "Review",
            Status::Done => "Done",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if let Ok(ordinal) = trimmed.parse::<i64>() {
            return Self::from_ordinal(ordinal).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "status ordinal {ordinal} out of range (0-{})",
                    Self::ALL.len() - 1
                ))
            });
        }
        let key = normalize_name(trimmed);
        Self::ALL
            .into_iter()
            .find(|status| normalize_name(status.label()) == key)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "unknown status '{trimmed}' (expected backlog|todo|in-progress|review|done)"
                ))
            })
    }
}

fn normalize_name(raw: &str) -> String {
    raw.chars()
        .filter(|ch| !matches!(ch, ' ' | '-' | '_'))
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Priority,
    pub status: Status,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_link: Option<String>,
}

impl Task {
    /// Build a task from creation fields, applying defaults and validation.
    pub fn from_new(new: NewTask, id: String, created: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            id,
            title: normalize_title(&new.title)?,
            description: new.description.trim().to_string(),
            priority: new.priority.unwrap_or_default(),
            status: new.status.unwrap_or_default(),
            created: truncate_millis(created),
            due_date: new.due_date.map(truncate_millis),
            external_link: normalize_optional(new.external_link),
        })
    }

    /// Merge a patch into a copy of this task. `id` and `created` never change.
    pub fn apply(&self, patch: &TaskPatch) -> Result<Self> {
        let mut next = self.clone();
        if let Some(title) = &patch.title {
            next.title = normalize_title(title)?;
        }
        if let Some(description) = &patch.description {
            next.description = description.trim().to_string();
        }
        if let Some(priority) = patch.priority {
            next.priority = priority;
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(due_date) = patch.due_date {
            next.due_date = due_date.map(truncate_millis);
        }
        if let Some(link) = &patch.external_link {
            next.external_link = normalize_optional(link.clone());
        }
        Ok(next)
    }

    /// A task is overdue when its deadline has passed and it is not done.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status != Status::Done && self.due_date.is_some_and(|due| due < now)
    }
}

/// Fields accepted when creating a task. Unset fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: Option<Priority>,
    pub status: Option<Status>,
    pub due_date: Option<DateTime<Utc>>,
    pub external_link: Option<String>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_external_link(mut self, link: impl Into<String>) -> Self {
        self.external_link = Some(link.into());
        self
    }
}

/// Partial update. `None` leaves a field untouched; the nested options on
/// `due_date` and `external_link` distinguish "clear" from "keep".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub status: Option<Status>,
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub external_link: Option<Option<String>>,
}

impl TaskPatch {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Independent, AND-combined filters over the collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub search: String,
    pub priority: Option<Priority>,
    pub status: Option<Status>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if !self.search.is_empty() {
            let query = self.search.to_lowercase();
            if !task.title.to_lowercase().contains(&query)
                && !task.description.to_lowercase().contains(&query)
            {
                return false;
            }
        }
        if self.priority.is_some_and(|priority| task.priority != priority) {
            return false;
        }
        if self.status.is_some_and(|status| task.status != status) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortField {
    #[default]
    Created,
    DueDate,
    Priority,
    Status,
    Title,
}

impl FromStr for SortField {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match normalize_name(raw).as_str() {
            "created" => Ok(SortField::Created),
            "due" | "duedate" => Ok(SortField::DueDate),
            "priority" => Ok(SortField::Priority),
            "status" => Ok(SortField::Status),
            "title" => Ok(SortField::Title),
            _ => Err(Error::InvalidArgument(format!(
                "unknown sort field '{}' (expected created|due|priority|status|title)",
                raw.trim()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortDirection {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(Error::InvalidArgument(format!(
                "unknown sort direction '{other}' (expected asc|desc)"
            ))),
        }
    }
}

/// Stable sort into a new vector. Tasks without a due date always come
/// last when sorting by due date, whichever direction is requested.
pub fn sort_tasks(tasks: &[Task], field: SortField, direction: SortDirection) -> Vec<Task> {
    let mut sorted = tasks.to_vec();
    let directed = |ordering: Ordering| match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    };
    sorted.sort_by(|left, right| match field {
        SortField::DueDate => match (left.due_date, right.due_date) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(l), Some(r)) => directed(l.cmp(&r)),
        },
        SortField::Created => directed(left.created.cmp(&right.created)),
        SortField::Priority => directed(left.priority.cmp(&right.priority)),
        SortField::Status => directed(left.status.cmp(&right.status)),
        SortField::Title => directed(
            left.title
                .to_lowercase()
                .cmp(&right.title.to_lowercase())
                .then_with(|| left.title.cmp(&right.title)),
        ),
    });
    sorted
}

/// Generate a new task id: a lowercase ULID (millisecond timestamp plus
/// 80 random bits).
pub fn new_task_id() -> String {
    Ulid::new().to_string().to_lowercase()
}

/// Current time at the millisecond precision the wire format keeps.
pub fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

pub fn truncate_millis(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(value.timestamp_millis()).unwrap_or(value)
}

/// Parse a due date given as `YYYY-MM-DD` (midnight UTC) or RFC 3339.
pub fn parse_due_date(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|value| truncate_millis(value.with_timezone(&Utc)))
        .map_err(|err| {
            Error::InvalidArgument(format!(
                "invalid due date '{trimmed}' (expected YYYY-MM-DD or RFC 3339): {err}"
            ))
        })
}

fn normalize_title(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("title cannot be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

fn normalize_optional(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
