//! Same-origin bus shared by every tab of one client process.

use theatre_core::tabs::{TabEnvelope, TabId, TabMessage};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const DEFAULT_TAB_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct TabBus {
    tx: broadcast::Sender<TabEnvelope>,
}

impl Default for TabBus {
    fn default() -> Self {
        Self::new(DEFAULT_TAB_BUS_CAPACITY)
    }
}

impl TabBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn join(&self, tab_id: TabId) -> (TabPublisher, TabSubscriber) {
        let publisher = TabPublisher {
            tab_id: tab_id.clone(),
            tx: self.tx.clone(),
        };
        let subscriber = TabSubscriber {
            tab_id,
            rx: self.tx.subscribe(),
        };
        (publisher, subscriber)
    }
}

#[derive(Clone)]
pub struct TabPublisher {
    tab_id: TabId,
    tx: broadcast::Sender<TabEnvelope>,
}

impl TabPublisher {
    /// Fire and forget; a bus with no other listeners is not an error.
    pub fn publish(&self, message: TabMessage) {
        let kind = message.kind();
        let envelope = TabEnvelope {
            origin: self.tab_id.clone(),
            message,
        };
        match self.tx.send(envelope) {
            Ok(receivers) => {
                debug!(event = "tab_publish", tab = %self.tab_id, kind, receivers);
            }
            Err(_) => {
                debug!(event = "tab_publish_unheard", tab = %self.tab_id, kind);
            }
        }
    }
}

pub struct TabSubscriber {
    tab_id: TabId,
    rx: broadcast::Receiver<TabEnvelope>,
}

impl TabSubscriber {
    /// Next message from a sibling tab; the tab's own messages are skipped.
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<TabMessage> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.origin == self.tab_id => continue,
                Ok(envelope) => return Some(envelope.message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(event = "tab_bus_lagged", tab = %self.tab_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
