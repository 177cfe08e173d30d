use crate::{column_optional_timestamp, column_timestamp, lock, StorageError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;
use theatre_core::source::{
    ApprovalRequest, DischargeReady, FaultAlert, MaintenanceRecord, OperationalSource,
    ScheduledEvent, SourceError, StockRecord, WaitingPatient, DEFAULT_LOW_STOCK_THRESHOLD,
};
use theatre_core::format_timestamp;

/// Operational read model backed by SQLite.
///
/// The tables are owned by the scheduling, inventory and ward systems; this
/// source only reads them. `CREATE TABLE IF NOT EXISTS` keeps an empty file
/// usable during development.
pub struct SqliteOperationalSource {
    conn: Mutex<Connection>,
}

impl SqliteOperationalSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(include_str!("../migrations/operational_read_model.sql"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs a batch of statements against the read model. Used to load
    /// fixtures and demo data.
    pub fn apply_script(&self, sql: &str) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    fn query<T, F>(&self, sql: &str, params: &[&dyn rusqlite::ToSql], map: F) -> Result<Vec<T>, SourceError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = lock(&self.conn).map_err(|err| SourceError::Unavailable(err.to_string()))?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|err| SourceError::Query(err.to_string()))?;
        let rows = stmt
            .query_map(params, map)
            .map_err(|err| SourceError::Query(err.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|err| SourceError::Query(err.to_string()))
    }
}

impl OperationalSource for SqliteOperationalSource {
    fn scheduled_events(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEvent>, SourceError> {
        let start = format_timestamp(window_start);
        let end = format_timestamp(window_end);
        self.query(
            "SELECT id, procedure_name, patient_name, room, scheduled_at, status
             FROM surgeries
             WHERE julianday(scheduled_at) >= julianday(?1)
               AND julianday(scheduled_at) <= julianday(?2)
               AND UPPER(status) NOT IN ('CANCELLED', 'COMPLETED')
             ORDER BY julianday(scheduled_at) ASC",
            params![start, end],
            |row| {
                let scheduled_at: String = row.get(4)?;
                Ok(ScheduledEvent {
                    id: row.get(0)?,
                    procedure: row.get(1)?,
                    patient: row.get(2)?,
                    room: row.get(3)?,
                    scheduled_at: column_timestamp(4, &scheduled_at)?,
                    status: row.get(5)?,
                })
            },
        )
    }

    fn maintenance_due(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<MaintenanceRecord>, SourceError> {
        let start = format_timestamp(window_start);
        let end = format_timestamp(window_end);
        self.query(
            "SELECT id, equipment, location, due_at, status
             FROM equipment_maintenance
             WHERE julianday(due_at) >= julianday(?1)
               AND julianday(due_at) <= julianday(?2)
               AND UPPER(status) != 'COMPLETED'
             ORDER BY julianday(due_at) ASC",
            params![start, end],
            |row| {
                let due_at: String = row.get(3)?;
                Ok(MaintenanceRecord {
                    id: row.get(0)?,
                    equipment: row.get(1)?,
                    location: row.get(2)?,
                    due_at: column_timestamp(3, &due_at)?,
                    status: row.get(4)?,
                })
            },
        )
    }

    fn low_stock(&self) -> Result<Vec<StockRecord>, SourceError> {
        self.query(
            "SELECT id, name, location, quantity, COALESCE(min_quantity, ?1)
             FROM stock_items
             WHERE quantity <= COALESCE(min_quantity, ?1)
             ORDER BY quantity ASC, name ASC",
            params![DEFAULT_LOW_STOCK_THRESHOLD],
            |row| {
                Ok(StockRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    location: row.get(2)?,
                    quantity: row.get(3)?,
                    threshold: row.get(4)?,
                })
            },
        )
    }

    fn open_faults(&self) -> Result<Vec<FaultAlert>, SourceError> {
        self.query(
            "SELECT id, equipment, location, severity, reported_at
             FROM fault_alerts
             WHERE resolved_at IS NULL
             ORDER BY julianday(reported_at) DESC",
            params![],
            |row| {
                let reported_at: String = row.get(4)?;
                Ok(FaultAlert {
                    id: row.get(0)?,
                    equipment: row.get(1)?,
                    location: row.get(2)?,
                    severity: row.get(3)?,
                    reported_at: column_timestamp(4, &reported_at)?,
                })
            },
        )
    }

    fn waiting_room(&self) -> Result<Vec<WaitingPatient>, SourceError> {
        self.query(
            "SELECT id, patient_name, area, arrived_at, status
             FROM holding_area
             WHERE resolved_at IS NULL
             ORDER BY julianday(arrived_at) ASC",
            params![],
            |row| {
                let arrived_at: String = row.get(3)?;
                Ok(WaitingPatient {
                    id: row.get(0)?,
                    patient: row.get(1)?,
                    area: row.get(2)?,
                    arrived_at: column_timestamp(3, &arrived_at)?,
                    status: row.get(4)?,
                })
            },
        )
    }

    fn discharge_ready(&self) -> Result<Vec<DischargeReady>, SourceError> {
        self.query(
            "SELECT id, patient_name, bed, ready_at, status
             FROM pacu_stays
             WHERE UPPER(status) = 'READY_FOR_DISCHARGE' AND discharged_at IS NULL
             ORDER BY julianday(ready_at) ASC",
            params![],
            |row| {
                Ok(DischargeReady {
                    id: row.get(0)?,
                    patient: row.get(1)?,
                    bed: row.get(2)?,
                    ready_at: column_optional_timestamp(3, row.get(3)?)?,
                    status: row.get(4)?,
                })
            },
        )
    }

    fn pending_approvals(&self) -> Result<Vec<ApprovalRequest>, SourceError> {
        self.query(
            "SELECT id, summary, requested_by, requested_at, status
             FROM approval_requests
             WHERE UPPER(status) = 'PENDING'
             ORDER BY julianday(requested_at) ASC",
            params![],
            |row| {
                let requested_at: String = row.get(3)?;
                Ok(ApprovalRequest {
                    id: row.get(0)?,
                    summary: row.get(1)?,
                    requested_by: row.get(2)?,
                    requested_at: column_timestamp(3, &requested_at)?,
                    status: row.get(4)?,
                })
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 8, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn seeded() -> SqliteOperationalSource {
        let source = SqliteOperationalSource::open_in_memory().expect("open source");
        source
            .apply_script(
                "
                INSERT INTO surgeries VALUES
                    ('s-1', 'Appendectomy', 'J. Doe', 'OR-2', '2026-03-04T08:30:00.000Z', 'SCHEDULED'),
                    ('s-2', 'Hip replacement', NULL, 'OR-1', '2026-03-04T12:00:00Z', 'SCHEDULED'),
                    ('s-3', 'Cancelled case', NULL, NULL, '2026-03-04T09:00:00.000Z', 'CANCELLED'),
                    ('s-4', 'Next week', NULL, NULL, '2026-03-11T09:00:00.000Z', 'SCHEDULED');
                INSERT INTO equipment_maintenance VALUES
                    ('m-1', 'Anaesthesia machine', 'OR-2', '2026-03-04T20:00:00.000Z', 'PENDING'),
                    ('m-2', 'Autoclave', NULL, '2026-03-04T10:00:00.000Z', 'COMPLETED');
                INSERT INTO stock_items VALUES
                    ('i-1', 'Sutures 3-0', 'Store A', 0, 10),
                    ('i-2', 'Gauze', 'Store A', 4, NULL),
                    ('i-3', 'Gloves M', 'Store B', 50, 20),
                    ('i-4', 'Drapes', 'Store B', 8, NULL);
                INSERT INTO fault_alerts VALUES
                    ('f-1', 'Ventilator', 'OR-3', 'CRITICAL', '2026-03-04T07:00:00.000Z', NULL),
                    ('f-2', 'Light', 'OR-1', 'LOW', '2026-03-03T07:00:00.000Z', '2026-03-03T09:00:00.000Z');
                INSERT INTO holding_area VALUES
                    ('h-1', 'A. Patient', 'Bay 1', '2026-03-04T07:30:00.000Z', 'WAITING', NULL);
                INSERT INTO pacu_stays VALUES
                    ('p-1', 'B. Patient', 'PACU-4', '2026-03-04T07:45:00.000Z', 'READY_FOR_DISCHARGE', NULL),
                    ('p-2', 'C. Patient', 'PACU-5', NULL, 'RECOVERING', NULL);
                INSERT INTO approval_requests VALUES
                    ('a-1', 'Transfer to ICU', 'dr-smith', '2026-03-04T07:50:00.000Z', 'PENDING'),
                    ('a-2', 'Old request', NULL, '2026-03-01T07:50:00.000Z', 'APPROVED');
                ",
            )
            .expect("seed");
        source
    }

    #[test]
    fn scheduled_events_respect_window_and_status() {
        let source = seeded();
        let events = source
            .scheduled_events(ts(), ts() + Duration::hours(24))
            .expect("events");
        let ids: Vec<_> = events.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, vec!["s-1", "s-2"]);
        assert_eq!(events[0].scheduled_at, ts() + Duration::minutes(30));
    }

    #[test]
    fn maintenance_skips_completed_work() {
        let source = seeded();
        let due = source
            .maintenance_due(ts(), ts() + Duration::hours(24))
            .expect("maintenance");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].equipment, "Anaesthesia machine");
    }

    #[test]
    fn low_stock_uses_item_threshold_or_default() {
        let source = seeded();
        let stock = source.low_stock().expect("stock");
        let ids: Vec<_> = stock.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["i-1", "i-2"]);
        assert!(stock[0].is_out_of_stock());
        assert_eq!(stock[1].threshold, DEFAULT_LOW_STOCK_THRESHOLD);
    }

    #[test]
    fn open_items_exclude_resolved_rows() {
        let source = seeded();
        assert_eq!(source.open_faults().expect("faults").len(), 1);
        assert_eq!(source.waiting_room().expect("waiting").len(), 1);
        let pacu = source.discharge_ready().expect("pacu");
        assert_eq!(pacu.len(), 1);
        assert_eq!(pacu[0].bed.as_deref(), Some("PACU-4"));
        let approvals = source.pending_approvals().expect("approvals");
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].summary, "Transfer to ICU");
    }

    #[test]
    fn missing_table_is_reported_as_query_error() {
        let source = seeded();
        source
            .apply_script("DROP TABLE fault_alerts;")
            .expect("drop table");
        assert!(matches!(source.open_faults(), Err(SourceError::Query(_))));
    }
}
