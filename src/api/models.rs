use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::reconcile::models::{ReconciliationRecord, RecordStatus, SettlementKind};
use crate::reconcile::sweep::SweepSummary;
use crate::supervisor::WorkerAction;

/// Query parameters for the sweep trigger
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SweepQuery {
    #[validate(range(min = 1, max = 500, message = "limit must be between 1 and 500"))]
    pub limit: Option<i64>,
    #[validate(range(min = 1, message = "staleMinutes must be positive"))]
    #[serde(alias = "staleMinutes")]
    pub stale_minutes: Option<i64>,
    pub reference: Option<String>,
    #[serde(default)]
    pub debug: bool,
    /// Shared-secret alternative to the x-reconcile-token header
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub success: bool,
    #[serde(flatten)]
    pub summary: SweepSummary,
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub success: bool,
    pub id: Uuid,
    pub status: RecordStatus,
}

#[derive(Debug, Serialize)]
pub struct RetryAllResponse {
    pub success: bool,
    pub retried: u64,
}

#[derive(Debug, Deserialize)]
pub struct WorkerControlRequest {
    pub action: WorkerAction,
}

#[derive(Debug, Serialize)]
pub struct WorkerControlResponse {
    pub success: bool,
    pub action: WorkerAction,
}

/// Operator-facing view of a reconciliation record
#[derive(Debug, Serialize)]
pub struct RecordStatusResponse {
    pub id: Uuid,
    pub external_ref: String,
    pub kind: SettlementKind,
    pub status: RecordStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub settled: bool,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ReconciliationRecord> for RecordStatusResponse {
    fn from(record: ReconciliationRecord) -> Self {
        let settled = record.is_settled();
        Self {
            id: record.id,
            external_ref: record.external_ref,
            kind: record.kind,
            status: record.status,
            attempt_count: record.attempt_count,
            max_attempts: record.max_attempts,
            settled,
            last_error: record.last_error,
            last_attempt_at: record.last_attempt_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}
