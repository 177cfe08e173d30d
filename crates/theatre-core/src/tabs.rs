use crate::notification::{Notification, NotificationId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one client instance ("tab") sharing an origin bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub String);

impl TabId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TabMessage {
    MarkRead { id: NotificationId },
    MarkAllRead,
    /// Carries the server's unread count from the event that delivered the
    /// batch, so receivers adopt it instead of counting locally.
    #[serde(rename_all = "camelCase")]
    NewNotifications {
        notifications: Vec<Notification>,
        unread_count: u64,
    },
}

impl TabMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            TabMessage::MarkRead { .. } => "MARK_READ",
            TabMessage::MarkAllRead => "MARK_ALL_READ",
            TabMessage::NewNotifications { .. } => "NEW_NOTIFICATIONS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabEnvelope {
    pub origin: TabId,
    #[serde(flatten)]
    pub message: TabMessage,
}
