use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_LOOKAHEAD_HOURS: i64 = 24;
pub const DEFAULT_CRITICAL_WINDOW_MINUTES: i64 = 60;
pub const DEFAULT_DEDUP_COOLDOWN_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimelineCategory {
    Surgery,
    Maintenance,
    Stock,
    Fault,
    HoldingArea,
    Pacu,
    Transfer,
}

impl TimelineCategory {
    pub const ALL: [TimelineCategory; 7] = [
        TimelineCategory::Surgery,
        TimelineCategory::Maintenance,
        TimelineCategory::Stock,
        TimelineCategory::Fault,
        TimelineCategory::HoldingArea,
        TimelineCategory::Pacu,
        TimelineCategory::Transfer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineCategory::Surgery => "surgery",
            TimelineCategory::Maintenance => "maintenance",
            TimelineCategory::Stock => "stock",
            TimelineCategory::Fault => "fault",
            TimelineCategory::HoldingArea => "holding-area",
            TimelineCategory::Pacu => "pacu",
            TimelineCategory::Transfer => "transfer",
        }
    }
}

impl fmt::Display for TimelineCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Critical,
    Warning,
    Upcoming,
    Normal,
}

impl Urgency {
    /// Sort rank; lower sorts first.
    pub fn rank(&self) -> u8 {
        match self {
            Urgency::Critical => 0,
            Urgency::Warning => 1,
            Urgency::Upcoming => 2,
            Urgency::Normal => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Critical => "critical",
            Urgency::Warning => "warning",
            Urgency::Upcoming => "upcoming",
            Urgency::Normal => "normal",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived read-only row. Rebuilt on every aggregation pass, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    pub category: TimelineCategory,
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    pub status: String,
    pub urgency: Urgency,
    pub link: String,
    pub entity_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineResponse {
    pub timeline: Vec<TimelineItem>,
    pub counts: BTreeMap<TimelineCategory, usize>,
}

/// Lookahead and dedup windows used by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineWindows {
    pub lookahead: Duration,
    pub critical_window: Duration,
    pub dedup_cooldown: Duration,
}

impl Default for TimelineWindows {
    fn default() -> Self {
        Self {
            lookahead: Duration::hours(DEFAULT_LOOKAHEAD_HOURS),
            critical_window: Duration::minutes(DEFAULT_CRITICAL_WINDOW_MINUTES),
            dedup_cooldown: Duration::minutes(DEFAULT_DEDUP_COOLDOWN_MINUTES),
        }
    }
}

impl TimelineWindows {
    /// `now <= at <= now + critical_window`.
    pub fn is_within_critical(&self, now: DateTime<Utc>, at: DateTime<Utc>) -> bool {
        at >= now && at <= now + self.critical_window
    }

    pub fn lookahead_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.lookahead
    }

    pub fn cooldown_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.dedup_cooldown
    }
}
