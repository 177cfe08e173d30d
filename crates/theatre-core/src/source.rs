//! Read-side contract for the operational data the timeline is built from.
//!
//! Each category has its own record type so mapping and classification are
//! checked exhaustively instead of probing loosely-typed rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quantity at or below which a stock item counts as low when the record
/// carries no threshold of its own.
pub const DEFAULT_LOW_STOCK_THRESHOLD: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub id: String,
    pub procedure: String,
    pub patient: Option<String>,
    pub room: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceRecord {
    pub id: String,
    pub equipment: String,
    pub location: Option<String>,
    pub due_at: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    pub id: String,
    pub name: String,
    pub location: Option<String>,
    pub quantity: i64,
    pub threshold: i64,
}

impl StockRecord {
    pub fn is_out_of_stock(&self) -> bool {
        self.quantity <= 0
    }

    pub fn is_low(&self) -> bool {
        self.quantity <= self.threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultAlert {
    pub id: String,
    pub equipment: String,
    pub location: Option<String>,
    pub severity: String,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingPatient {
    pub id: String,
    pub patient: String,
    pub area: Option<String>,
    pub arrived_at: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DischargeReady {
    pub id: String,
    pub patient: String,
    pub bed: Option<String>,
    pub ready_at: Option<DateTime<Utc>>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub summary: String,
    pub requested_by: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub status: String,
}

/// Synchronous queries against the external operational store.
///
/// Every method is independent: the aggregator treats a failing query as an
/// empty contribution for that category and keeps going.
pub trait OperationalSource: Send + Sync {
    fn scheduled_events(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEvent>, SourceError>;

    fn maintenance_due(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<MaintenanceRecord>, SourceError>;

    fn low_stock(&self) -> Result<Vec<StockRecord>, SourceError>;

    fn open_faults(&self) -> Result<Vec<FaultAlert>, SourceError>;

    fn waiting_room(&self) -> Result<Vec<WaitingPatient>, SourceError>;

    fn discharge_ready(&self) -> Result<Vec<DischargeReady>, SourceError>;

    fn pending_approvals(&self) -> Result<Vec<ApprovalRequest>, SourceError>;
}
