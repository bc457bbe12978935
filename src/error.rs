//! Error types for tasksync
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, invalid config, validation failure)
//! - 4: Operation failed (remote store, I/O, corrupt data)

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the tsk CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for tasksync operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    // Operation failures (exit code 4)
    #[error("Item {key} is {size} bytes, over the per-item limit of {limit}")]
    QuotaExceeded { key: String, size: u64, limit: u64 },

    #[error("Store would hold {size} bytes, over the quota of {limit}")]
    TotalQuotaExceeded { size: u64, limit: u64 },

    #[error("Corrupt data in remote store: {0}")]
    CorruptData(String),

    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::InvalidConfig(_)
            | Error::InvalidArgument(_)
            | Error::Validation(_)
            | Error::TaskNotFound(_) => exit_codes::USER_ERROR,

            // Operation failures
            Error::QuotaExceeded { .. }
            | Error::TotalQuotaExceeded { .. }
            | Error::CorruptData(_)
            | Error::Remote(_)
            | Error::NoRuntime(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::Watch(_)
            | Error::LockFailed(_)
            | Error::OperationFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Structured details for JSON error output, when the variant has any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::QuotaExceeded { key, size, limit } => Some(serde_json::json!({
                "key": key,
                "size": size,
                "limit": limit,
            })),
            Error::TotalQuotaExceeded { size, limit } => Some(serde_json::json!({
                "size": size,
                "limit": limit,
            })),
            Error::TaskNotFound(id) => Some(serde_json::json!({ "id": id })),
            _ => None,
        }
    }
}

/// Result type alias for tasksync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for displaying errors in JSON format
#[derive(serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        JsonError {
            error: err.to_string(),
            code: err.exit_code(),
            details: err.details(),
        }
    }
}
