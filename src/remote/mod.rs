//! Remote key-value store contract.
//!
//! The sync engine only talks to a [`RemoteStore`]: a small, quota-limited
//! key-value space shared with other ends of the same account. Values are
//! JSON. Every write and removal is announced to subscribers as a
//! [`StorageChange`] tagged with the area and the origin that made it.
//!
//! Two backends ship with the crate:
//! - [`MemoryStore`]: in-process, with handles that act as separate ends
//! - [`FileStore`]: a locked JSON document on disk shared between processes

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

mod file;
mod memory;

pub use file::{FileStore, WatchHandle};
pub use memory::MemoryStore;

/// Key/value pairs as read from or written to a store.
pub type Items = BTreeMap<String, Value>;

/// Capacity of each store's change notification channel.
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Size limits of a store. An item costs its key length plus the length of
/// its value serialized as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLimits {
    pub item_bytes: u64,
    pub total_bytes: u64,
}

impl StoreLimits {
    /// Limits of a typical browser sync area: 8 KiB per item, 100 KiB total.
    pub const SYNC: StoreLimits = StoreLimits {
        item_bytes: 8192,
        total_bytes: 102_400,
    };
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self::SYNC
    }
}

/// Before/after values of one key. `None` means absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueChange {
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Notification that one or more keys changed.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub area: String,
    pub origin: String,
    pub changes: BTreeMap<String, ValueChange>,
}

/// Quota telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub bytes_in_use: u64,
    pub quota_bytes: u64,
}

impl StorageUsage {
    /// Fill level rounded to the nearest whole percent.
    pub fn percent(&self) -> u64 {
        if self.quota_bytes == 0 {
            return 100;
        }
        (self.bytes_in_use * 100 + self.quota_bytes / 2) / self.quota_bytes
    }

    pub fn remaining(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.bytes_in_use)
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Area tag carried by this store's change notifications.
    fn area(&self) -> &str;

    /// Identity of this end; stamped on changes it makes.
    fn origin(&self) -> &str;

    fn limits(&self) -> StoreLimits;

    /// Fetch the given keys. Missing keys are absent from the result.
    async fn get(&self, keys: &[String]) -> Result<Items>;

    /// Write all items or none of them.
    async fn set(&self, items: Items) -> Result<()>;

    async fn remove(&self, keys: &[String]) -> Result<()>;

    /// Bytes used by `keys`, or by the whole store when `None`.
    async fn bytes_in_use(&self, keys: Option<&[String]>) -> Result<u64>;

    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

pub fn item_size(key: &str, value: &Value) -> u64 {
    (key.len() + value.to_string().len()) as u64
}

pub(crate) fn total_size<'a>(items: impl IntoIterator<Item = (&'a String, &'a Value)>) -> u64 {
    items
        .into_iter()
        .map(|(key, value)| item_size(key, value))
        .sum()
}

/// Sum of the sizes of `keys` present in `items`, or of everything.
pub(crate) fn usage_of(items: &Items, keys: Option<&[String]>) -> u64 {
    match keys {
        None => total_size(items),
        Some(keys) => keys
            .iter()
            .filter_map(|key| items.get_key_value(key))
            .map(|(key, value)| item_size(key, value))
            .sum(),
    }
}

/// Apply `items` on top of `current`, enforcing both limits. Nothing is
/// returned unless the whole batch fits.
pub(crate) fn apply_set(current: &Items, items: Items, limits: StoreLimits) -> Result<Items> {
    for (key, value) in &items {
        let size = item_size(key, value);
        if size > limits.item_bytes {
            return Err(Error::QuotaExceeded {
                key: key.clone(),
                size,
                limit: limits.item_bytes,
            });
        }
    }
    let mut next = current.clone();
    next.extend(items);
    let size = total_size(&next);
    if size > limits.total_bytes {
        return Err(Error::TotalQuotaExceeded {
            size,
            limit: limits.total_bytes,
        });
    }
    Ok(next)
}

pub(crate) fn apply_remove(current: &Items, keys: &[String]) -> Items {
    let mut next = current.clone();
    for key in keys {
        next.remove(key);
    }
    next
}

/// Per-key differences between two snapshots; unchanged keys are skipped.
pub fn diff_items(before: &Items, after: &Items) -> BTreeMap<String, ValueChange> {
    let mut changes = BTreeMap::new();
    for (key, old) in before {
        match after.get(key) {
            Some(new) if new == old => {}
            new => {
                changes.insert(
                    key.clone(),
                    ValueChange {
                        old_value: Some(old.clone()),
                        new_value: new.cloned(),
                    },
                );
            }
        }
    }
    for (key, new) in after {
        if !before.contains_key(key) {
            changes.insert(
                key.clone(),
                ValueChange {
                    old_value: None,
                    new_value: Some(new.clone()),
                },
            );
        }
    }
    changes
}
