use std::{collections::BTreeMap, collections::HashSet, fmt, time::Duration};
use theatre_core::{
    Notification, NotificationId, NotificationPage, TimelineCategory, TimelineItem,
    TimelineResponse,
};

pub const INITIAL_RECONNECT_MS: u64 = 1_000;
pub const MAX_RECONNECT_MS: u64 = 30_000;

/// `min(1000 * 2^attempts, 30000)` milliseconds.
pub fn reconnect_delay(attempts: u32) -> Duration {
    let ms = 2u64
        .saturating_pow(attempts)
        .saturating_mul(INITIAL_RECONNECT_MS)
        .min(MAX_RECONNECT_MS);
    Duration::from_millis(ms)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// In-memory view held by one tab.
///
/// Notifications are kept newest first and never contain the same id twice.
/// The unread counter follows the server whenever the server reports one;
/// local mark-read operations only adjust it until the next report.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionState {
    pub status: ConnectionStatus,
    pub notifications: Vec<Notification>,
    pub unread_count: u64,
    pub reconnect_attempts: u32,
    pub timeline: Vec<TimelineItem>,
    pub timeline_counts: BTreeMap<TimelineCategory, usize>,
    known: HashSet<NotificationId>,
}

impl SubscriptionState {
    pub fn begin_connect(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    pub fn apply_init(&mut self, unread_count: u64) {
        self.unread_count = unread_count;
        self.status = ConnectionStatus::Connected;
        self.reconnect_attempts = 0;
    }

    /// Adds unseen notifications and returns the ones that were new.
    pub fn merge_notifications(&mut self, incoming: Vec<Notification>) -> Vec<Notification> {
        let mut added = Vec::new();
        for notification in incoming {
            if self.known.insert(notification.id) {
                added.push(notification.clone());
                self.notifications.push(notification);
            }
        }
        if !added.is_empty() {
            self.notifications.sort_by(|a, b| b.id.cmp(&a.id));
        }
        added
    }

    pub fn set_unread(&mut self, unread_count: u64) {
        self.unread_count = unread_count;
    }

    /// Applies a REST listing. Listed rows replace local copies since the
    /// server's read flags win over optimistic ones.
    pub fn apply_page(&mut self, page: NotificationPage) {
        for notification in page.notifications {
            if self.known.insert(notification.id) {
                self.notifications.push(notification);
            } else if let Some(existing) = self
                .notifications
                .iter_mut()
                .find(|existing| existing.id == notification.id)
            {
                *existing = notification;
            }
        }
        self.notifications.sort_by(|a, b| b.id.cmp(&a.id));
        self.unread_count = page.unread_count;
    }

    pub fn apply_timeline(&mut self, response: TimelineResponse) {
        self.timeline = response.timeline;
        self.timeline_counts = response.counts;
    }

    /// Flips one item to read. Returns false if it is unknown or already read.
    pub fn mark_read_local(&mut self, id: NotificationId) -> bool {
        let Some(notification) = self
            .notifications
            .iter_mut()
            .find(|notification| notification.id == id)
        else {
            return false;
        };
        if notification.read {
            return false;
        }
        notification.read = true;
        self.unread_count = self.unread_count.saturating_sub(1);
        true
    }

    pub fn mark_all_read_local(&mut self) -> usize {
        let mut changed = 0;
        for notification in self.notifications.iter_mut().filter(|n| !n.read) {
            notification.read = true;
            changed += 1;
        }
        self.unread_count = 0;
        changed
    }

    /// Moves to `Disconnected` and returns how long to wait before the next
    /// attempt.
    pub fn on_disconnected(&mut self) -> Duration {
        self.status = ConnectionStatus::Disconnected;
        let delay = reconnect_delay(self.reconnect_attempts);
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use theatre_core::{NotificationType, Priority};

    fn notification(id: i64, read: bool) -> Notification {
        Notification {
            id: NotificationId(id),
            recipient_id: None,
            recipient_role: None,
            kind: NotificationType::System,
            title: format!("n{id}"),
            message: String::new(),
            priority: Priority::Normal,
            read,
            read_at: None,
            action_url: None,
            entity: None,
            scheduled_at: None,
            deadline_at: None,
            timeline_critical: false,
            created_at: Utc
                .with_ymd_and_hms(2026, 3, 4, 8, 0, 0)
                .single()
                .expect("valid timestamp"),
        }
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let delays: Vec<u64> = (0..40)
            .map(|attempt| reconnect_delay(attempt).as_millis() as u64)
            .collect();
        assert_eq!(&delays[..6], &[1_000, 2_000, 4_000, 8_000, 16_000, 30_000]);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= MAX_RECONNECT_MS));
        assert_eq!(reconnect_delay(u32::MAX).as_millis(), 30_000);
    }

    #[test]
    fn merge_never_duplicates() {
        let mut state = SubscriptionState::default();
        let added = state.merge_notifications(vec![notification(1, false), notification(2, false)]);
        assert_eq!(added.len(), 2);
        let added = state.merge_notifications(vec![notification(2, false), notification(3, false)]);
        assert_eq!(added.len(), 1);
        let ids: Vec<_> = state.notifications.iter().map(|n| n.id.0).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn server_listing_overrides_optimistic_count() {
        let mut state = SubscriptionState::default();
        state.merge_notifications(vec![notification(1, false), notification(2, false)]);
        state.set_unread(2);
        assert!(state.mark_read_local(NotificationId(1)));
        assert!(!state.mark_read_local(NotificationId(1)));
        assert_eq!(state.unread_count, 1);

        state.apply_page(NotificationPage {
            notifications: vec![notification(2, false), notification(1, false)],
            unread_count: 2,
            page: 1,
            page_size: 20,
            total: 2,
        });
        assert_eq!(state.unread_count, 2);
        assert!(state.notifications.iter().all(|n| !n.read));
        assert_eq!(state.notifications.len(), 2);
    }

    #[test]
    fn connection_cycle_resets_attempts_on_init() {
        let mut state = SubscriptionState::default();
        state.begin_connect();
        assert_eq!(state.on_disconnected(), Duration::from_millis(1_000));
        assert_eq!(state.on_disconnected(), Duration::from_millis(2_000));
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        state.begin_connect();
        state.apply_init(4);
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(state.unread_count, 4);
    }
}
