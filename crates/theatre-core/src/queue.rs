use crate::notification::NotificationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const NOTIFICATIONS_PATH: &str = "/api/notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WriteMethod {
    Post,
    Put,
    Patch,
    Delete,
}

impl WriteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMethod::Post => "POST",
            WriteMethod::Put => "PUT",
            WriteMethod::Patch => "PATCH",
            WriteMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for WriteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteMethod {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "POST" => Ok(WriteMethod::Post),
            "PUT" => Ok(WriteMethod::Put),
            "PATCH" => Ok(WriteMethod::Patch),
            "DELETE" => Ok(WriteMethod::Delete),
            other => Err(format!("Unsupported write method: {other}")),
        }
    }
}

/// A mutating request that may have to wait for connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueuedOperation {
    MarkRead {
        id: NotificationId,
    },
    MarkAllRead,
    Write {
        method: WriteMethod,
        path: String,
        #[serde(default)]
        body: Option<Value>,
    },
}

impl QueuedOperation {
    pub fn write(method: WriteMethod, path: impl Into<String>, body: Option<Value>) -> Self {
        QueuedOperation::Write {
            method,
            path: path.into(),
            body,
        }
    }

    pub fn method(&self) -> WriteMethod {
        match self {
            QueuedOperation::MarkRead { .. } | QueuedOperation::MarkAllRead => WriteMethod::Put,
            QueuedOperation::Write { method, .. } => *method,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            QueuedOperation::MarkRead { .. } | QueuedOperation::MarkAllRead => NOTIFICATIONS_PATH,
            QueuedOperation::Write { path, .. } => path,
        }
    }

    /// Key under which replay order is preserved. Writes to the same key are
    /// never replayed out of enqueue order.
    pub fn resource_key(&self) -> String {
        match self {
            QueuedOperation::MarkRead { id } => format!("{NOTIFICATIONS_PATH}/{id}"),
            QueuedOperation::MarkAllRead => NOTIFICATIONS_PATH.to_string(),
            QueuedOperation::Write { path, .. } => {
                let trimmed = path.split(['?', '#']).next().unwrap_or(path);
                trimmed.trim_end_matches('/').to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: i64,
    pub owner: String,
    pub operation: QueuedOperation,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub synced: usize,
    pub failed: usize,
    pub remaining: usize,
}
