pub mod channel;
pub mod notification;
pub mod queue;
pub mod source;
pub mod sse;
pub mod tabs;
pub mod timeline;

use chrono::{DateTime, SecondsFormat, Utc};

pub use notification::{
    EntityRef, NewNotification, Notification, NotificationId, NotificationPage,
    NotificationType, Priority, Recipient, ValidationError,
};
pub use queue::{FlushReport, QueueEntry, QueuedOperation, WriteMethod};
pub use timeline::{TimelineCategory, TimelineItem, TimelineResponse, TimelineWindows, Urgency};

/// Fixed-width RFC 3339 rendering used for every persisted or wire timestamp.
///
/// Millisecond precision with a `Z` suffix keeps values lexicographically
/// ordered, which the storage layer relies on for range queries.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_are_fixed_width_and_sortable() {
        let whole = Utc
            .with_ymd_and_hms(2026, 3, 4, 8, 0, 0)
            .single()
            .expect("valid timestamp");
        let later = whole + chrono::Duration::milliseconds(5);

        let a = format_timestamp(whole);
        let b = format_timestamp(later);
        assert_eq!(a, "2026-03-04T08:00:00.000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_timestamp(&b).expect("parse"), later);
    }
}
