//! Named events carried by the delivery channel.

use crate::notification::{EntityRef, Notification, NotificationId, Priority};
use crate::sse::{FrameError, SseEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EVENT_INIT: &str = "init";
pub const EVENT_NOTIFICATIONS: &str = "notifications";
pub const EVENT_TIMELINE_ALERT: &str = "timeline-alert";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsPayload {
    pub notifications: Vec<Notification>,
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineAlert {
    pub notification_id: NotificationId,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    #[serde(default)]
    pub entity: Option<EntityRef>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub action_url: Option<String>,
}

impl From<&Notification> for TimelineAlert {
    fn from(notification: &Notification) -> Self {
        Self {
            notification_id: notification.id,
            title: notification.title.clone(),
            message: notification.message.clone(),
            priority: notification.priority,
            entity: notification.entity.clone(),
            scheduled_at: notification.scheduled_at,
            action_url: notification.action_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineAlertPayload {
    pub alerts: Vec<TimelineAlert>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Init(InitPayload),
    Notifications(NotificationsPayload),
    TimelineAlert(TimelineAlertPayload),
}

impl ChannelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Init(_) => EVENT_INIT,
            ChannelEvent::Notifications(_) => EVENT_NOTIFICATIONS,
            ChannelEvent::TimelineAlert(_) => EVENT_TIMELINE_ALERT,
        }
    }

    pub fn data_json(&self) -> Result<String, FrameError> {
        let encoded = match self {
            ChannelEvent::Init(payload) => serde_json::to_string(payload),
            ChannelEvent::Notifications(payload) => serde_json::to_string(payload),
            ChannelEvent::TimelineAlert(payload) => serde_json::to_string(payload),
        };
        encoded.map_err(|err| FrameError::Encode(err.to_string()))
    }

    /// Unknown event names decode to `None` so newer servers stay compatible.
    pub fn from_sse(event: &SseEvent) -> Result<Option<Self>, FrameError> {
        let decoded = match event.name() {
            EVENT_INIT => serde_json::from_str(&event.data).map(ChannelEvent::Init),
            EVENT_NOTIFICATIONS => {
                serde_json::from_str(&event.data).map(ChannelEvent::Notifications)
            }
            EVENT_TIMELINE_ALERT => {
                serde_json::from_str(&event.data).map(ChannelEvent::TimelineAlert)
            }
            _ => return Ok(None),
        };
        decoded
            .map(Some)
            .map_err(|err| FrameError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::{encode_event, SseDecoder};

    #[test]
    fn init_event_survives_sse_framing() {
        let event = ChannelEvent::Init(InitPayload { unread_count: 4 });
        let raw = encode_event(event.name(), &event.data_json().expect("encode"));
        assert!(raw.contains("\"unreadCount\":4"));

        let mut decoder = SseDecoder::default();
        let report = decoder.push_chunk(raw.as_bytes());
        let decoded = ChannelEvent::from_sse(&report.events[0]).expect("decode");
        assert_eq!(decoded, Some(event));
    }

    #[test]
    fn unknown_event_names_are_ignored() {
        let event = SseEvent {
            event: Some("presence".to_string()),
            data: "{}".to_string(),
            id: None,
        };
        assert_eq!(ChannelEvent::from_sse(&event), Ok(None));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let event = SseEvent {
            event: Some(EVENT_NOTIFICATIONS.to_string()),
            data: "{\"notifications\":5}".to_string(),
            id: None,
        };
        assert!(matches!(
            ChannelEvent::from_sse(&event),
            Err(FrameError::Decode(_))
        ));
    }
}
