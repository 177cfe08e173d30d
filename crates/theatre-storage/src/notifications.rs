use crate::{
    column_optional_timestamp, column_parse, column_timestamp, lock, schema_version,
    table_exists, StorageError,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use theatre_core::{
    format_timestamp, EntityRef, NewNotification, Notification, NotificationId,
    NotificationPage, NotificationType, Recipient,
};

pub const NOTIFICATION_SCHEMA_VERSION: i64 = 2;

const COLUMNS: &str = "n.id, n.recipient_id, n.recipient_role, n.type, n.title, n.message, \
     n.priority, r.read_at, n.action_url, n.entity_type, n.entity_id, n.scheduled_at, \
     n.deadline_at, n.timeline_critical, n.created_at";

/// Joins the read receipt of the reader bound to `?1`. A NULL reader never
/// matches, so rows come back unread.
const FROM_READER: &str = "notifications n LEFT JOIN notification_reads r \
     ON r.notification_id = n.id AND r.recipient_id = ?1";

/// Rows addressed to the user, to their role-class, or to everyone.
const VISIBLE_TO: &str = "(n.recipient_id = ?1 OR (n.recipient_id IS NULL \
     AND (n.recipient_role IS NULL OR n.recipient_role = ?2)))";

/// Durable notification log and the authoritative unread counter.
///
/// Read state lives in `notification_reads`, one receipt per recipient, so
/// role and broadcast rows are read or unread independently for every user
/// who can see them.
///
/// The connection sits behind a mutex so the store can be shared across
/// request handlers and delivery tasks; every method holds the lock only for
/// the statements it runs.
pub struct NotificationStore {
    conn: Mutex<Connection>,
}

impl NotificationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        schema_version(&*lock(&self.conn)?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        let mut current = schema_version(&conn)?;
        if current > NOTIFICATION_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: NOTIFICATION_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_notifications.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_notification_reads.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 2", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        table_exists(&*lock(&self.conn)?, table_name)
    }

    pub fn create_notification(
        &self,
        new: &NewNotification,
        now: DateTime<Utc>,
    ) -> Result<Notification, StorageError> {
        let conn = lock(&self.conn)?;
        insert_notification(&conn, new, now)
    }

    pub fn find_recent_notification(
        &self,
        entity: &EntityRef,
        kind: NotificationType,
        since: DateTime<Utc>,
    ) -> Result<Option<Notification>, StorageError> {
        let conn = lock(&self.conn)?;
        find_recent(&conn, entity, kind, since)
    }

    /// Inserts `new` unless a notification for the same entity and type was
    /// created at or after `since`. Check and insert run in one transaction,
    /// so concurrent callers cannot both pass the check.
    ///
    /// Returns `None` when a recent match already exists.
    pub fn create_unless_recent(
        &self,
        new: &NewNotification,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Notification>, StorageError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        if let Some(entity) = &new.entity {
            if find_recent(&tx, entity, new.kind, since)?.is_some() {
                return Ok(None);
            }
        }
        let created = insert_notification(&tx, new, now)?;
        tx.commit()?;
        Ok(Some(created))
    }

    /// The notification as `recipient` sees it, or `None` when it does not
    /// exist or is addressed elsewhere.
    pub fn get(
        &self,
        recipient: &Recipient,
        id: NotificationId,
    ) -> Result<Option<Notification>, StorageError> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM {FROM_READER} WHERE {VISIBLE_TO} AND n.id = ?3"),
                params![recipient.id, recipient.role, id.0],
                notification_from_row,
            )
            .optional()?)
    }

    /// Newest-first page (1-based) of notifications visible to `recipient`.
    pub fn list_notifications(
        &self,
        recipient: &Recipient,
        page: u32,
        page_size: u32,
    ) -> Result<NotificationPage, StorageError> {
        let conn = lock(&self.conn)?;
        let page = page.max(1);
        let page_size = page_size.max(1);
        let offset = i64::from(page - 1) * i64::from(page_size);

        let sql = format!(
            "SELECT {COLUMNS} FROM {FROM_READER} WHERE {VISIBLE_TO} ORDER BY n.id DESC LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![recipient.id, recipient.role, i64::from(page_size), offset],
            notification_from_row,
        )?;
        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM notifications n WHERE {VISIBLE_TO}"),
            params![recipient.id, recipient.role],
            |row| row.get(0),
        )?;
        let unread_count = unread_count(&conn, recipient)?;

        Ok(NotificationPage {
            notifications,
            unread_count,
            page,
            page_size,
            total: total.max(0) as u64,
        })
    }

    /// Oldest-first notifications visible to `recipient` with id above `after`.
    pub fn notifications_since(
        &self,
        recipient: &Recipient,
        after: NotificationId,
        limit: usize,
    ) -> Result<Vec<Notification>, StorageError> {
        let conn = lock(&self.conn)?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {FROM_READER} WHERE {VISIBLE_TO} AND n.id > ?3 ORDER BY n.id ASC LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![recipient.id, recipient.role, after.0, limit as i64],
            notification_from_row,
        )?;
        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }

    /// Highest id visible to `recipient`, or 0 when there is none.
    pub fn latest_id(&self, recipient: &Recipient) -> Result<NotificationId, StorageError> {
        let conn = lock(&self.conn)?;
        latest_id(&conn, recipient)
    }

    /// Unread count and highest visible id read under one lock, so a row
    /// inserted concurrently is either in both or in neither.
    pub fn stream_cursor(
        &self,
        recipient: &Recipient,
    ) -> Result<(u64, NotificationId), StorageError> {
        let conn = lock(&self.conn)?;
        Ok((unread_count(&conn, recipient)?, latest_id(&conn, recipient)?))
    }

    pub fn unread_count(&self, recipient: &Recipient) -> Result<u64, StorageError> {
        let conn = lock(&self.conn)?;
        unread_count(&conn, recipient)
    }

    /// One-way unread -> read transition for `recipient` only. Returns false
    /// when the id does not exist or is not visible to `recipient`;
    /// re-marking keeps the first `read_at`.
    pub fn mark_read(
        &self,
        recipient: &Recipient,
        id: NotificationId,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let conn = lock(&self.conn)?;
        let visible: Option<i64> = conn
            .query_row(
                &format!("SELECT n.id FROM notifications n WHERE {VISIBLE_TO} AND n.id = ?3"),
                params![recipient.id, recipient.role, id.0],
                |row| row.get(0),
            )
            .optional()?;
        if visible.is_none() {
            return Ok(false);
        }
        conn.execute(
            "INSERT OR IGNORE INTO notification_reads (notification_id, recipient_id, read_at)
             VALUES (?1, ?2, ?3)",
            params![id.0, recipient.id, format_timestamp(now)],
        )?;
        Ok(true)
    }

    /// Marks every notification visible to `recipient` as read for that
    /// recipient. Returns how many were unread.
    pub fn mark_all_read(
        &self,
        recipient: &Recipient,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO notification_reads (notification_id, recipient_id, read_at)
                 SELECT n.id, ?1, ?3 FROM {FROM_READER}
                 WHERE {VISIBLE_TO} AND r.notification_id IS NULL"
            ),
            params![recipient.id, recipient.role, format_timestamp(now)],
        )?;
        Ok(changed)
    }
}

fn insert_notification(
    conn: &Connection,
    new: &NewNotification,
    now: DateTime<Utc>,
) -> Result<Notification, StorageError> {
    conn.execute(
        "
        INSERT INTO notifications (
            recipient_id,
            recipient_role,
            type,
            title,
            message,
            priority,
            action_url,
            entity_type,
            entity_id,
            scheduled_at,
            deadline_at,
            timeline_critical,
            created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ",
        params![
            new.recipient_id,
            new.recipient_role,
            new.kind.as_str(),
            new.title,
            new.message,
            new.priority.as_str(),
            new.action_url,
            new.entity.as_ref().map(|entity| entity.entity_type.as_str()),
            new.entity.as_ref().map(|entity| entity.entity_id.as_str()),
            new.scheduled_at.map(format_timestamp),
            new.deadline_at.map(format_timestamp),
            new.timeline_critical,
            format_timestamp(now),
        ],
    )?;
    let id = conn.last_insert_rowid();
    Ok(conn.query_row(
        &format!("SELECT {COLUMNS} FROM {FROM_READER} WHERE n.id = ?2"),
        params![None::<String>, id],
        notification_from_row,
    )?)
}

fn find_recent(
    conn: &Connection,
    entity: &EntityRef,
    kind: NotificationType,
    since: DateTime<Utc>,
) -> Result<Option<Notification>, StorageError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM {FROM_READER}
         WHERE n.entity_type = ?2 AND n.entity_id = ?3 AND n.type = ?4 AND n.created_at >= ?5
         ORDER BY n.id DESC LIMIT 1"
    );
    Ok(conn
        .query_row(
            &sql,
            params![
                None::<String>,
                entity.entity_type,
                entity.entity_id,
                kind.as_str(),
                format_timestamp(since)
            ],
            notification_from_row,
        )
        .optional()?)
}

fn latest_id(conn: &Connection, recipient: &Recipient) -> Result<NotificationId, StorageError> {
    let latest: Option<i64> = conn.query_row(
        &format!("SELECT MAX(n.id) FROM notifications n WHERE {VISIBLE_TO}"),
        params![recipient.id, recipient.role],
        |row| row.get(0),
    )?;
    Ok(NotificationId(latest.unwrap_or(0)))
}

fn unread_count(conn: &Connection, recipient: &Recipient) -> Result<u64, StorageError> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {FROM_READER} WHERE {VISIBLE_TO} AND r.notification_id IS NULL"
        ),
        params![recipient.id, recipient.role],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let kind: String = row.get(3)?;
    let priority: String = row.get(6)?;
    let read_at = column_optional_timestamp(7, row.get(7)?)?;
    let entity_type: Option<String> = row.get(9)?;
    let entity_id: Option<String> = row.get(10)?;
    let created_at: String = row.get(14)?;

    let entity = match (entity_type, entity_id) {
        (Some(entity_type), Some(entity_id)) => Some(EntityRef {
            entity_type,
            entity_id,
        }),
        _ => None,
    };

    Ok(Notification {
        id: NotificationId(row.get(0)?),
        recipient_id: row.get(1)?,
        recipient_role: row.get(2)?,
        kind: column_parse(3, &kind)?,
        title: row.get(4)?,
        message: row.get(5)?,
        priority: column_parse(6, &priority)?,
        read: read_at.is_some(),
        read_at,
        action_url: row.get(8)?,
        entity,
        scheduled_at: column_optional_timestamp(11, row.get(11)?)?,
        deadline_at: column_optional_timestamp(12, row.get(12)?)?,
        timeline_critical: row.get(13)?,
        created_at: column_timestamp(14, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::NamedTempFile;
    use theatre_core::Priority;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 8, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn nurse() -> Recipient {
        Recipient::new("u-nurse", "nurse")
    }

    fn surgeon() -> Recipient {
        Recipient::new("u-surgeon", "surgeon")
    }

    fn surgery_alert(entity_id: &str) -> NewNotification {
        NewNotification::new(
            NotificationType::SurgeryScheduled,
            "Surgery starting soon",
            "Theatre 2",
        )
        .with_entity(EntityRef::new("surgery", entity_id))
        .with_priority(Priority::High)
        .scheduled_at(ts() + Duration::minutes(45))
        .timeline_critical()
    }

    #[test]
    fn migration_creates_notification_table() {
        let store = NotificationStore::open_in_memory().expect("open db");
        assert!(store.table_exists("notifications").expect("table check"));
        assert_eq!(
            store.schema_version().expect("schema version"),
            NOTIFICATION_SCHEMA_VERSION
        );
    }

    #[test]
    fn created_notification_round_trips_every_field() {
        let store = NotificationStore::open_in_memory().expect("open db");
        let created = store
            .create_notification(&surgery_alert("s-1").for_role("nurse"), ts())
            .expect("create");

        assert_eq!(created.id, NotificationId(1));
        assert_eq!(created.kind, NotificationType::SurgeryScheduled);
        assert_eq!(created.recipient_role.as_deref(), Some("nurse"));
        assert!(created.timeline_critical);
        assert!(!created.read);
        assert_eq!(created.created_at, ts());
        assert_eq!(created.scheduled_at, Some(ts() + Duration::minutes(45)));
        assert_eq!(store.get(&nurse(), created.id).expect("get"), Some(created.clone()));
        assert_eq!(store.get(&surgeon(), created.id).expect("get"), None);
    }

    #[test]
    fn create_unless_recent_suppresses_within_cooldown() {
        let store = NotificationStore::open_in_memory().expect("open db");
        let cooldown = Duration::minutes(30);

        let first = store
            .create_unless_recent(&surgery_alert("s-1"), ts() - cooldown, ts())
            .expect("first create");
        assert!(first.is_some());

        let later = ts() + Duration::minutes(10);
        let second = store
            .create_unless_recent(&surgery_alert("s-1"), later - cooldown, later)
            .expect("second create");
        assert!(second.is_none());

        let other_entity = store
            .create_unless_recent(&surgery_alert("s-2"), later - cooldown, later)
            .expect("other entity");
        assert!(other_entity.is_some());

        let after_cooldown = ts() + Duration::minutes(31);
        let third = store
            .create_unless_recent(&surgery_alert("s-1"), after_cooldown - cooldown, after_cooldown)
            .expect("after cooldown");
        assert!(third.is_some());

        let found = store
            .find_recent_notification(
                &EntityRef::new("surgery", "s-1"),
                NotificationType::SurgeryScheduled,
                ts() - cooldown,
            )
            .expect("find recent")
            .expect("match");
        assert_eq!(found.id, third.expect("third").id);
    }

    #[test]
    fn visibility_and_unread_counter_follow_addressing() {
        let store = NotificationStore::open_in_memory().expect("open db");
        let direct = NewNotification::new(NotificationType::System, "Direct", "")
            .for_recipient("u-nurse");
        let nurses = NewNotification::new(NotificationType::StockLow, "Nurses", "").for_role("nurse");
        let everyone = NewNotification::new(NotificationType::Emergency, "Everyone", "");

        for new in [&direct, &nurses, &everyone] {
            store.create_notification(new, ts()).expect("create");
        }

        assert_eq!(store.unread_count(&nurse()).expect("count"), 3);
        assert_eq!(store.unread_count(&surgeon()).expect("count"), 1);

        let page = store
            .list_notifications(&nurse(), 1, 2)
            .expect("page one");
        assert_eq!(page.total, 3);
        assert_eq!(page.unread_count, 3);
        let titles: Vec<_> = page.notifications.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["Everyone", "Nurses"]);

        let page_two = store
            .list_notifications(&nurse(), 2, 2)
            .expect("page two");
        assert_eq!(page_two.notifications.len(), 1);
        assert_eq!(page_two.notifications[0].title, "Direct");
    }

    #[test]
    fn mark_read_is_one_way_and_scoped() {
        let store = NotificationStore::open_in_memory().expect("open db");
        let direct = store
            .create_notification(
                &NewNotification::new(NotificationType::System, "Direct", "").for_recipient("u-nurse"),
                ts(),
            )
            .expect("create");

        assert!(!store.mark_read(&surgeon(), direct.id, ts()).expect("foreign mark"));
        assert!(store.mark_read(&nurse(), direct.id, ts()).expect("mark"));
        let read_at = store.get(&nurse(), direct.id).expect("get").expect("row").read_at;
        assert_eq!(read_at, Some(ts()));

        let later = ts() + Duration::minutes(5);
        assert!(store.mark_read(&nurse(), direct.id, later).expect("re-mark"));
        let unchanged = store.get(&nurse(), direct.id).expect("get").expect("row");
        assert!(unchanged.read);
        assert_eq!(unchanged.read_at, Some(ts()));
        assert!(!store
            .mark_read(&nurse(), NotificationId(999), ts())
            .expect("missing"));
    }

    #[test]
    fn read_state_is_tracked_per_recipient() {
        let store = NotificationStore::open_in_memory().expect("open db");
        let nurse_a = Recipient::new("u-a", "nurse");
        let nurse_b = Recipient::new("u-b", "nurse");
        let everyone = store
            .create_notification(&NewNotification::new(NotificationType::Emergency, "Everyone", ""), ts())
            .expect("create broadcast");
        store
            .create_notification(
                &NewNotification::new(NotificationType::StockLow, "Nurses", "").for_role("nurse"),
                ts(),
            )
            .expect("create role");

        assert_eq!(store.unread_count(&nurse_a).expect("count"), 2);
        assert_eq!(store.unread_count(&nurse_b).expect("count"), 2);

        assert!(store.mark_read(&nurse_a, everyone.id, ts()).expect("mark"));
        assert_eq!(store.unread_count(&nurse_a).expect("count"), 1);
        assert_eq!(store.unread_count(&nurse_b).expect("count"), 2);
        assert!(store.get(&nurse_a, everyone.id).expect("get").expect("row").read);
        assert!(!store.get(&nurse_b, everyone.id).expect("get").expect("row").read);

        assert_eq!(store.mark_all_read(&nurse_a, ts()).expect("mark all"), 1);
        assert_eq!(store.unread_count(&nurse_a).expect("count"), 0);
        assert_eq!(store.unread_count(&nurse_b).expect("count"), 2);
        assert_eq!(store.unread_count(&surgeon()).expect("count"), 1);

        let page = store.list_notifications(&nurse_b, 1, 10).expect("page");
        assert!(page.notifications.iter().all(|n| !n.read));
        assert_eq!(page.unread_count, 2);
    }

    #[test]
    fn upgrade_from_v1_keeps_direct_read_receipts() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let conn = Connection::open(file.path()).expect("open raw");
            conn.execute_batch(include_str!("../migrations/0001_notifications.sql"))
                .expect("v1 schema");
            conn.execute("PRAGMA user_version = 1", []).expect("version");
            conn.execute(
                "INSERT INTO notifications (recipient_id, type, title, read, read_at, created_at)
                 VALUES ('u-nurse', 'SYSTEM', 'old', 1, ?1, ?1)",
                [format_timestamp(ts())],
            )
            .expect("seed read row");
            conn.execute(
                "INSERT INTO notifications (recipient_id, type, title, created_at)
                 VALUES ('u-nurse', 'SYSTEM', 'fresh', ?1)",
                [format_timestamp(ts())],
            )
            .expect("seed unread row");
        }

        let store = NotificationStore::open(file.path()).expect("upgrade");
        assert_eq!(store.schema_version().expect("version"), NOTIFICATION_SCHEMA_VERSION);
        assert!(store.table_exists("notification_reads").expect("table check"));
        assert_eq!(store.unread_count(&nurse()).expect("count"), 1);
        let old = store
            .get(&nurse(), NotificationId(1))
            .expect("get")
            .expect("row");
        assert!(old.read);
        assert_eq!(old.read_at, Some(ts()));
    }

    #[test]
    fn stream_cursor_pairs_unread_with_latest_id() {
        let store = NotificationStore::open_in_memory().expect("open db");
        assert_eq!(
            store.stream_cursor(&nurse()).expect("empty cursor"),
            (0, NotificationId(0))
        );
        for title in ["a", "b"] {
            store
                .create_notification(&NewNotification::new(NotificationType::System, title, ""), ts())
                .expect("create");
        }
        store
            .mark_read(&nurse(), NotificationId(1), ts())
            .expect("mark");
        assert_eq!(
            store.stream_cursor(&nurse()).expect("cursor"),
            (1, NotificationId(2))
        );
    }

    #[test]
    fn mark_all_read_is_idempotent() {
        let store = NotificationStore::open_in_memory().expect("open db");
        for title in ["a", "b", "c"] {
            store
                .create_notification(&NewNotification::new(NotificationType::System, title, ""), ts())
                .expect("create");
        }

        assert_eq!(store.mark_all_read(&nurse(), ts()).expect("first"), 3);
        assert_eq!(store.unread_count(&nurse()).expect("count"), 0);
        assert_eq!(store.mark_all_read(&nurse(), ts()).expect("second"), 0);
        assert_eq!(store.unread_count(&nurse()).expect("count"), 0);
    }

    #[test]
    fn notifications_since_returns_ascending_tail() {
        let store = NotificationStore::open_in_memory().expect("open db");
        for title in ["a", "b", "c"] {
            store
                .create_notification(&NewNotification::new(NotificationType::System, title, ""), ts())
                .expect("create");
        }

        let tail = store
            .notifications_since(&nurse(), NotificationId(1), 50)
            .expect("since");
        let ids: Vec<_> = tail.iter().map(|n| n.id.0).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(store.latest_id(&nurse()).expect("latest"), NotificationId(3));
        assert_eq!(
            NotificationStore::open_in_memory()
                .expect("open db")
                .latest_id(&nurse())
                .expect("latest"),
            NotificationId(0)
        );
    }

    #[test]
    fn reopening_a_file_keeps_rows() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let store = NotificationStore::open(file.path()).expect("open");
            store
                .create_notification(&NewNotification::new(NotificationType::System, "kept", ""), ts())
                .expect("create");
        }
        let store = NotificationStore::open(file.path()).expect("reopen");
        assert_eq!(store.unread_count(&nurse()).expect("count"), 1);
    }
}
