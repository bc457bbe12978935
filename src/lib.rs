//! tasksync - task tracking over a quota-constrained, synchronized store
//!
//! A remote key-value store with a small per-item limit and a small total
//! quota holds the whole task collection, sliced into fragments. Writes are
//! debounced, shrinking collections clean up their stale fragments, and
//! changes made by other ends of the same store are picked up and replace
//! the local collection.
//!
//! # Module Organization
//!
//! - `bus`: Synchronous publish/subscribe between the store and its observers
//! - `codec`: Compact wire encoding and fragmenting of the collection
//! - `engine`: Debounced, chunked persistence and remote-change reconciliation
//! - `store`: The authoritative in-memory collection with CRUD, filter and sort
//! - `remote`: The remote store contract plus in-memory and file-backed stores
//! - `task`: Task records, priorities, statuses, filters and ordering
//! - `config`: Configuration loading from `.tasksync.toml`
//! - `events`: JSON-lines event output for integrations
//! - `lock`: File locking and atomic writes for the file-backed store
//! - `cli`, `output`: The `tsk` command line

pub mod bus;
pub mod cli;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lock;
pub mod output;
pub mod remote;
pub mod store;
pub mod task;

pub use bus::{BusEvent, EventBus, Subscription, Topic};
pub use engine::{SyncEngine, WritePhase};
pub use error::{Error, Result};
pub use remote::{FileStore, MemoryStore, RemoteStore, StorageUsage, StoreLimits};
pub use store::{TaskStore, TaskSummary};
pub use task::{NewTask, Priority, Status, Task, TaskFilter, TaskPatch};
