use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockWriteGuard,
    },
};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info};

type Connections = HashMap<String, HashMap<String, Arc<Notify>>>;

/// Open delivery channels keyed by recipient id, then connection id.
///
/// Entries live exactly as long as their [`ConnectionGuard`]; the guard is
/// owned by the response stream, so closing the transport removes the entry.
#[derive(Default)]
pub struct ConnectionRegistry {
    conn_counter: AtomicU64,
    connections: RwLock<Connections>,
}

/// Handles handed to the poll task of one open channel.
pub struct Registration {
    pub guard: ConnectionGuard,
    pub wake: Arc<Notify>,
    pub stop: oneshot::Receiver<()>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Connections> {
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(self: &Arc<Self>, recipient_id: &str) -> Registration {
        let conn_id = self.next_conn_id();
        let wake = Arc::new(Notify::new());
        let (stop_tx, stop_rx) = oneshot::channel();

        self.write()
            .entry(recipient_id.to_string())
            .or_default()
            .insert(conn_id.clone(), wake.clone());

        info!(
            event = "channel_registered",
            conn_id = %conn_id,
            recipient = %recipient_id
        );

        Registration {
            guard: ConnectionGuard {
                registry: Arc::clone(self),
                recipient_id: recipient_id.to_string(),
                conn_id,
                _stop: stop_tx,
            },
            wake,
            stop: stop_rx,
        }
    }

    fn unregister(&self, recipient_id: &str, conn_id: &str) {
        let mut connections = self.write();
        if let Some(entries) = connections.get_mut(recipient_id) {
            entries.remove(conn_id);
            if entries.is_empty() {
                connections.remove(recipient_id);
            }
        }
        info!(
            event = "channel_unregistered",
            conn_id = %conn_id,
            recipient = %recipient_id
        );
    }

    /// Wakes every open channel of one recipient.
    pub fn wake_recipient(&self, recipient_id: &str) {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entries) = connections.get(recipient_id) {
            for wake in entries.values() {
                wake.notify_one();
            }
        }
    }

    /// Wakes every open channel; used for role and broadcast notifications.
    pub fn wake_all(&self) {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut woken = 0usize;
        for entries in connections.values() {
            for wake in entries.values() {
                wake.notify_one();
                woken += 1;
            }
        }
        debug!(event = "channels_woken", count = woken);
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn recipient_count(&self, recipient_id: &str) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(recipient_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

/// Removes the registry entry and fires the stop signal when dropped.
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    recipient_id: String,
    conn_id: String,
    _stop: oneshot::Sender<()>,
}

impl ConnectionGuard {
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.recipient_id, &self.conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn guard_drop_removes_entry_and_fires_stop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let first = registry.register("u-1");
        let second = registry.register("u-1");
        let other = registry.register("u-2");
        assert_eq!(registry.connection_count(), 3);
        assert_eq!(registry.recipient_count("u-1"), 2);
        assert_ne!(first.guard.conn_id(), second.guard.conn_id());

        let Registration { guard, mut stop, .. } = first;
        assert!(stop.try_recv().is_err());
        drop(guard);
        assert!(matches!(
            stop.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert_eq!(registry.recipient_count("u-1"), 1);

        drop(second);
        drop(other);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wake_reaches_only_the_addressed_recipient() {
        let registry = Arc::new(ConnectionRegistry::new());
        let nurse = registry.register("u-nurse");
        let surgeon = registry.register("u-surgeon");

        registry.wake_recipient("u-nurse");
        tokio::time::timeout(Duration::from_millis(200), nurse.wake.notified())
            .await
            .expect("nurse woken");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), surgeon.wake.notified())
                .await
                .is_err()
        );

        registry.wake_all();
        tokio::time::timeout(Duration::from_millis(200), surgeon.wake.notified())
            .await
            .expect("surgeon woken");
    }
}
