use std::sync::Mutex;
use theatre_core::channel::TimelineAlert;
use theatre_core::{Notification, Priority};
use tracing::info;

/// Something the platform shows outside the notification list.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformAlert {
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub action_url: Option<String>,
}

impl From<&Notification> for PlatformAlert {
    fn from(notification: &Notification) -> Self {
        Self {
            title: notification.title.clone(),
            body: notification.message.clone(),
            priority: notification.priority,
            action_url: notification.action_url.clone(),
        }
    }
}

impl From<&TimelineAlert> for PlatformAlert {
    fn from(alert: &TimelineAlert) -> Self {
        Self {
            title: alert.title.clone(),
            body: alert.message.clone(),
            priority: alert.priority,
            action_url: alert.action_url.clone(),
        }
    }
}

pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: PlatformAlert);
}

/// Writes alerts to the log. Used by the terminal client.
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, alert: PlatformAlert) {
        info!(
            event = "platform_alert",
            priority = %alert.priority.as_str(),
            title = %alert.title,
            body = %alert.body,
            action_url = alert.action_url.as_deref().unwrap_or("")
        );
    }
}

/// Keeps every alert in memory for embedding UIs to drain.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<PlatformAlert>>,
}

impl RecordingAlertSink {
    pub fn count(&self) -> usize {
        match self.alerts.lock() {
            Ok(alerts) => alerts.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn take(&self) -> Vec<PlatformAlert> {
        match self.alerts.lock() {
            Ok(mut alerts) => std::mem::take(&mut *alerts),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl AlertSink for RecordingAlertSink {
    fn notify(&self, alert: PlatformAlert) {
        match self.alerts.lock() {
            Ok(mut alerts) => alerts.push(alert),
            Err(poisoned) => poisoned.into_inner().push(alert),
        }
    }
}
