use chrono::Utc;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use theatre_core::queue::{FlushReport, QueueEntry, QueuedOperation};
use theatre_core::Recipient;
use theatre_storage::QueueStore;
use tracing::{debug, info, warn};

use crate::{error::QueueError, transport::NotificationApi};

/// Durable writes under one owner, replayed in enqueue order.
pub struct OfflineQueue {
    store: Arc<QueueStore>,
    owner: String,
    flushing: AtomicBool,
}

struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl OfflineQueue {
    pub fn new(store: Arc<QueueStore>, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
            flushing: AtomicBool::new(false),
        }
    }

    /// Queue keyed by the signed-in user, so a restarted client picks up
    /// whatever an earlier session left behind.
    pub fn for_recipient(store: Arc<QueueStore>, recipient: &Recipient) -> Self {
        Self::new(store, recipient.id.clone())
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn enqueue(&self, operation: &QueuedOperation) -> Result<QueueEntry, QueueError> {
        let entry = self.store.enqueue(&self.owner, operation, Utc::now())?;
        info!(
            event = "write_queued",
            owner = %self.owner,
            entry_id = entry.id,
            method = %operation.method(),
            resource = %operation.resource_key()
        );
        Ok(entry)
    }

    pub fn count(&self) -> Result<u64, QueueError> {
        Ok(self.store.count(&self.owner)?)
    }

    /// Whether an earlier write to the same record is still waiting.
    pub fn has_pending(&self, operation: &QueuedOperation) -> Result<bool, QueueError> {
        Ok(self
            .store
            .has_pending(&self.owner, &operation.resource_key())?)
    }

    pub fn entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self.store.entries(&self.owner)?)
    }

    /// Replays pending writes once. Returns `None` when another flush is
    /// already running.
    ///
    /// A failed entry stays queued and holds back later entries for the same
    /// resource until the next flush; entries for other resources proceed.
    pub async fn flush(&self, api: &dyn NotificationApi) -> Result<Option<FlushReport>, QueueError> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(event = "flush_skipped", owner = %self.owner);
            return Ok(None);
        }
        let _guard = FlushGuard(&self.flushing);

        let entries = self.store.entries(&self.owner)?;
        let mut report = FlushReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in entries {
            let resource = entry.operation.resource_key();
            if blocked.contains(&resource) {
                report.remaining += 1;
                continue;
            }
            match api.submit(&entry.operation).await {
                Ok(()) => {
                    self.store.remove(entry.id)?;
                    report.synced += 1;
                }
                Err(err) => {
                    warn!(
                        event = "replay_failed",
                        owner = %self.owner,
                        entry_id = entry.id,
                        attempts = entry.attempts + 1,
                        error = %err
                    );
                    self.store.record_failure(entry.id, &err.to_string())?;
                    report.failed += 1;
                    report.remaining += 1;
                    blocked.insert(resource);
                }
            }
        }

        info!(
            event = "queue_flushed",
            owner = %self.owner,
            synced = report.synced,
            failed = report.failed,
            remaining = report.remaining
        );
        Ok(Some(report))
    }
}
