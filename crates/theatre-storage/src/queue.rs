use crate::{column_timestamp, lock, schema_version, StorageError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;
use theatre_core::{format_timestamp, QueueEntry, QueuedOperation};

pub const QUEUE_SCHEMA_VERSION: i64 = 1;

/// Durable FIFO of writes that could not reach the server.
///
/// Entries are scoped by `owner` so several clients can share one file.
pub struct QueueStore {
    conn: Mutex<Connection>,
}

impl QueueStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        let current = schema_version(&conn)?;
        if current > QUEUE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: QUEUE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_offline_queue.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn enqueue(
        &self,
        owner: &str,
        operation: &QueuedOperation,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry, StorageError> {
        let operation_json = serde_json::to_string(operation)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let conn = lock(&self.conn)?;
        conn.execute(
            "
            INSERT INTO offline_queue (
                owner,
                resource_key,
                method,
                path,
                operation_json,
                attempts,
                enqueued_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
            ",
            params![
                owner,
                operation.resource_key(),
                operation.method().as_str(),
                operation.path(),
                operation_json,
                format_timestamp(now),
            ],
        )?;
        let id = conn.last_insert_rowid();
        let entry = conn.query_row(
            "SELECT id, owner, operation_json, attempts, enqueued_at, last_error
             FROM offline_queue WHERE id = ?1",
            [id],
            entry_from_row,
        )?;
        Ok(entry)
    }

    /// Pending entries for `owner` in enqueue order.
    pub fn entries(&self, owner: &str) -> Result<Vec<QueueEntry>, StorageError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, owner, operation_json, attempts, enqueued_at, last_error
             FROM offline_queue WHERE owner = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([owner], entry_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn remove(&self, id: i64) -> Result<bool, StorageError> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute("DELETE FROM offline_queue WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    pub fn record_failure(&self, id: i64, error: &str) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE offline_queue SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    /// Whether `owner` still has a queued write for `resource_key`.
    pub fn has_pending(&self, owner: &str, resource_key: &str) -> Result<bool, StorageError> {
        let conn = lock(&self.conn)?;
        let found: i64 = conn.query_row(
            "SELECT EXISTS (
                 SELECT 1 FROM offline_queue WHERE owner = ?1 AND resource_key = ?2
             )",
            params![owner, resource_key],
            |row| row.get(0),
        )?;
        Ok(found != 0)
    }

    pub fn count(&self, owner: &str) -> Result<u64, StorageError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM offline_queue WHERE owner = ?1",
            [owner],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let operation_json: String = row.get(2)?;
    let operation: QueuedOperation = serde_json::from_str(&operation_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let attempts: i64 = row.get(3)?;
    let enqueued_at: String = row.get(4)?;

    Ok(QueueEntry {
        id: row.get(0)?,
        owner: row.get(1)?,
        operation,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        enqueued_at: column_timestamp(4, &enqueued_at)?,
        last_error: row.get(5)?,
    })
}
