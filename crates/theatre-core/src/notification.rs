use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_MESSAGE_CHARS: usize = 2_000;

/// Store-assigned sequence number. Monotonic per store, so it doubles as the
/// "last sent" cursor for delivery channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub i64);

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    SurgeryScheduled,
    Emergency,
    StockLow,
    MaintenanceDue,
    TransferPending,
    EquipmentFault,
    System,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::SurgeryScheduled => "SURGERY_SCHEDULED",
            NotificationType::Emergency => "EMERGENCY",
            NotificationType::StockLow => "STOCK_LOW",
            NotificationType::MaintenanceDue => "MAINTENANCE_DUE",
            NotificationType::TransferPending => "TRANSFER_PENDING",
            NotificationType::EquipmentFault => "EQUIPMENT_FAULT",
            NotificationType::System => "SYSTEM",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_uppercase().replace('-', "_");
        match normalized.as_str() {
            "SURGERY_SCHEDULED" => Ok(NotificationType::SurgeryScheduled),
            "EMERGENCY" => Ok(NotificationType::Emergency),
            "STOCK_LOW" => Ok(NotificationType::StockLow),
            "MAINTENANCE_DUE" => Ok(NotificationType::MaintenanceDue),
            "TRANSFER_PENDING" => Ok(NotificationType::TransferPending),
            "EQUIPMENT_FAULT" => Ok(NotificationType::EquipmentFault),
            "SYSTEM" => Ok(NotificationType::System),
            other => Err(format!("Unknown notification type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        }
    }

    /// HIGH and URGENT items raise a platform alert on background tabs.
    pub fn is_elevated(&self) -> bool {
        matches!(self, Priority::High | Priority::Urgent)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "NORMAL" => Ok(Priority::Normal),
            "HIGH" => Ok(Priority::High),
            "URGENT" => Ok(Priority::Urgent),
            other => Err(format!("Unknown priority: {other}")),
        }
    }
}

/// Link back to the operational record a notification was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

/// Resolved identity of the caller, supplied by the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub role: String,
}

impl Recipient {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub recipient_role: Option<String>,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub entity: Option<EntityRef>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deadline_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeline_critical: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Addressed to this user, to their role-class, or to everyone.
    pub fn is_visible_to(&self, recipient: &Recipient) -> bool {
        match (&self.recipient_id, &self.recipient_role) {
            (Some(id), _) => id == &recipient.id,
            (None, Some(role)) => role == &recipient.role,
            (None, None) => true,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("action url must be a relative path or http(s) url")]
    InvalidActionUrl,
    #[error("entity reference needs both type and id")]
    IncompleteEntity,
}

/// Creation request for a notification; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub recipient_role: Option<String>,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub entity: Option<EntityRef>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deadline_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeline_critical: bool,
}

impl NewNotification {
    pub fn new(kind: NotificationType, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            recipient_id: None,
            recipient_role: None,
            kind,
            title: title.into(),
            message: message.into(),
            priority: Priority::Normal,
            action_url: None,
            entity: None,
            scheduled_at: None,
            deadline_at: None,
            timeline_critical: false,
        }
    }

    pub fn for_recipient(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    pub fn for_role(mut self, role: impl Into<String>) -> Self {
        self.recipient_role = Some(role.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }

    pub fn with_entity(mut self, entity: EntityRef) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn timeline_critical(mut self) -> Self {
        self.timeline_critical = true;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if self.title.chars().count() > MAX_TITLE_CHARS {
            return Err(ValidationError::TooLong {
                field: "title",
                max: MAX_TITLE_CHARS,
            });
        }
        if self.message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ValidationError::TooLong {
                field: "message",
                max: MAX_MESSAGE_CHARS,
            });
        }
        if let Some(url) = &self.action_url {
            let ok = url.starts_with('/')
                || url.starts_with("https://")
                || url.starts_with("http://");
            if !ok {
                return Err(ValidationError::InvalidActionUrl);
            }
        }
        if let Some(entity) = &self.entity {
            if entity.entity_type.trim().is_empty() || entity.entity_id.trim().is_empty() {
                return Err(ValidationError::IncompleteEntity);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    pub unread_count: u64,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(recipient_id: Option<&str>, role: Option<&str>) -> Notification {
        Notification {
            id: NotificationId(7),
            recipient_id: recipient_id.map(str::to_string),
            recipient_role: role.map(str::to_string),
            kind: NotificationType::StockLow,
            title: "Propofol low".to_string(),
            message: "3 vials left".to_string(),
            priority: Priority::High,
            read: false,
            read_at: None,
            action_url: Some("/inventory/propofol".to_string()),
            entity: Some(EntityRef::new("stock", "propofol")),
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
    fn visibility_follows_recipient_then_role() {
        let nurse = Recipient::new("u-1", "nurse");
        let surgeon = Recipient::new("u-2", "surgeon");

        assert!(sample(Some("u-1"), None).is_visible_to(&nurse));
        assert!(!sample(Some("u-1"), None).is_visible_to(&surgeon));
        assert!(sample(None, Some("nurse")).is_visible_to(&nurse));
        assert!(!sample(None, Some("nurse")).is_visible_to(&surgeon));
        assert!(sample(None, None).is_visible_to(&surgeon));
    }

    #[test]
    fn wire_shape_uses_type_key_and_camel_case() {
        let value = serde_json::to_value(sample(None, None)).expect("serialize");
        assert_eq!(value["type"], "STOCK_LOW");
        assert_eq!(value["priority"], "HIGH");
        assert_eq!(value["actionUrl"], "/inventory/propofol");
        assert_eq!(value["entity"]["entityType"], "stock");
        assert_eq!(value["timelineCritical"], false);
    }

    #[test]
    fn validation_rejects_bad_input() {
        let ok = NewNotification::new(NotificationType::Emergency, "Code red", "Theatre 3");
        assert!(ok.validate().is_ok());

        let empty = NewNotification::new(NotificationType::Emergency, "  ", "");
        assert_eq!(empty.validate(), Err(ValidationError::EmptyTitle));

        let url = ok.clone().with_action_url("javascript:alert(1)");
        assert_eq!(url.validate(), Err(ValidationError::InvalidActionUrl));

        let entity = ok.with_entity(EntityRef::new("surgery", ""));
        assert_eq!(entity.validate(), Err(ValidationError::IncompleteEntity));
    }

    #[test]
    fn type_parsing_accepts_kebab_and_lowercase() {
        assert_eq!(
            "surgery-scheduled".parse::<NotificationType>(),
            Ok(NotificationType::SurgeryScheduled)
        );
        assert!("SOMETHING_ELSE".parse::<NotificationType>().is_err());
        assert!(Priority::Urgent.is_elevated());
        assert!(!Priority::Normal.is_elevated());
    }
}
