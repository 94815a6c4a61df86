use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use super::models::{
    RecordPatch, RecordStatus, ReconciliationRecord, RequiredInputs, SettlementKind,
};
use crate::error::{AppError, AppResult};

const RECORD_COLUMNS: &str = "id, external_ref, kind, status, inputs, raw_payload, \
     attempt_count, max_attempts, started_at, last_attempt_at, last_error, \
     settlement_result, created_at, updated_at";

/// Candidate selection for the sweep and the worker.
///
/// A record matches when its status is in `statuses`, with two carve-outs:
/// in-progress records only match when their freshest activity timestamp is
/// older than `stale_before` (or they have none), and failed records only
/// match while retry budget remains.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub statuses: Vec<RecordStatus>,
    pub kind: Option<SettlementKind>,
    pub reference: Option<String>,
    pub stale_before: DateTime<Utc>,
    pub limit: i64,
}

/// Settlement record store - THE source of truth for reconciliation state.
///
/// All coordination between the sweep, the worker and the manual gateway
/// happens through the atomic claim/transition operations here; there is no
/// separate lock manager.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create or patch the record for (kind, external_ref). Unset patch
    /// fields leave existing state untouched.
    async fn upsert_by_external_ref(
        &self,
        kind: SettlementKind,
        external_ref: &str,
        patch: RecordPatch,
    ) -> AppResult<ReconciliationRecord>;

    async fn get(&self, id: Uuid) -> AppResult<Option<ReconciliationRecord>>;

    async fn get_by_external_ref(
        &self,
        kind: SettlementKind,
        external_ref: &str,
    ) -> AppResult<Option<ReconciliationRecord>>;

    /// Eligible records, oldest `updated_at` first, capped at `limit`.
    async fn find_candidates(
        &self,
        query: CandidateQuery,
    ) -> AppResult<Vec<ReconciliationRecord>>;

    /// Atomic compare-and-set from `expected` to in-progress. Exactly one of
    /// any number of concurrent callers wins; losers get `false` and mutate
    /// nothing.
    async fn claim_from(&self, id: Uuid, expected: RecordStatus) -> AppResult<bool>;

    /// Standard claim: pending -> in-progress.
    async fn claim(&self, id: Uuid) -> AppResult<bool> {
        self.claim_from(id, RecordStatus::Pending).await
    }

    async fn complete(&self, id: Uuid, result: serde_json::Value) -> AppResult<()>;

    async fn fail(&self, id: Uuid, reason: &str, increment_attempt: bool) -> AppResult<()>;

    async fn mark_awaiting(&self, id: Uuid, status: RecordStatus) -> AppResult<()>;

    /// Persist recovered input fields so future attempts see the canonical
    /// values without re-running recovery against the payload.
    async fn stage_inputs(&self, id: Uuid, inputs: &RequiredInputs) -> AppResult<()>;

    /// Safety reset of an abandoned claim: in-progress -> failed with reason
    /// "stale claim reset", attempt count NOT incremented. The staleness
    /// condition is re-checked atomically so a freshly re-claimed record is
    /// never clobbered by a racing sweep.
    async fn reset_stale(&self, id: Uuid, stale_before: DateTime<Utc>) -> AppResult<bool>;

    /// Manual retry reset: failed -> pending when budget remains. Clears
    /// `last_error` and `started_at`, keeps `attempt_count`.
    async fn reset_for_retry(&self, id: Uuid) -> AppResult<bool>;

    /// Bulk variant of `reset_for_retry`; returns the number of records
    /// transitioned.
    async fn reset_all_for_retry(&self) -> AppResult<u64>;
}

// ========== POSTGRES STORE ==========

pub struct PgRecordStore {
    pool: PgPool,
    default_max_attempts: i32,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, default_max_attempts: i32) -> Self {
        Self {
            pool,
            default_max_attempts,
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_by_external_ref(
        &self,
        kind: SettlementKind,
        external_ref: &str,
        patch: RecordPatch,
    ) -> AppResult<ReconciliationRecord> {
        let record = sqlx::query_as::<_, ReconciliationRecord>(&format!(
            r#"
            INSERT INTO reconciliation_records
                (id, external_ref, kind, status, inputs, raw_payload, max_attempts)
            VALUES ($1, $2, $3::settlement_kind,
                    COALESCE($4::record_status, 'pending'),
                    COALESCE($5, $6),
                    COALESCE($7, '{{}}'::jsonb),
                    COALESCE($8, $9))
            ON CONFLICT (kind, external_ref) DO UPDATE SET
                status       = COALESCE($4::record_status, reconciliation_records.status),
                inputs       = COALESCE($5, reconciliation_records.inputs),
                raw_payload  = COALESCE($7, reconciliation_records.raw_payload),
                max_attempts = COALESCE($8, reconciliation_records.max_attempts),
                updated_at   = NOW()
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(external_ref)
        .bind(kind.as_str())
        .bind(patch.status.map(|s| s.as_str().to_string()))
        .bind(patch.inputs.map(Json))
        .bind(Json(RequiredInputs::empty(kind)))
        .bind(patch.raw_payload)
        .bind(patch.max_attempts)
        .bind(self.default_max_attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<ReconciliationRecord>> {
        let record = sqlx::query_as::<_, ReconciliationRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM reconciliation_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_by_external_ref(
        &self,
        kind: SettlementKind,
        external_ref: &str,
    ) -> AppResult<Option<ReconciliationRecord>> {
        let record = sqlx::query_as::<_, ReconciliationRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM reconciliation_records \
             WHERE kind::text = $1 AND external_ref = $2"
        ))
        .bind(kind.as_str())
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_candidates(
        &self,
        query: CandidateQuery,
    ) -> AppResult<Vec<ReconciliationRecord>> {
        let statuses: Vec<String> = query
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let records = sqlx::query_as::<_, ReconciliationRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM reconciliation_records
            WHERE status::text = ANY($1)
              AND ($2::text IS NULL OR kind::text = $2)
              AND ($3::text IS NULL OR external_ref = $3)
              AND (status <> 'in_progress'
                   OR COALESCE(GREATEST(last_attempt_at, started_at), to_timestamp(0)) < $4)
              AND (status <> 'failed' OR attempt_count < max_attempts)
            ORDER BY updated_at ASC
            LIMIT $5
            "#
        ))
        .bind(statuses)
        .bind(query.kind.map(|k| k.as_str().to_string()))
        .bind(query.reference)
        .bind(query.stale_before)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn claim_from(&self, id: Uuid, expected: RecordStatus) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE reconciliation_records
            SET status = 'in_progress', started_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status::text = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, id: Uuid, result: serde_json::Value) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE reconciliation_records
            SET status = 'completed', settlement_result = $2, last_error = NULL,
                last_attempt_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail(&self, id: Uuid, reason: &str, increment_attempt: bool) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE reconciliation_records
            SET status = 'failed', last_error = $2,
                attempt_count = attempt_count + $3,
                last_attempt_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(if increment_attempt { 1i32 } else { 0i32 })
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_awaiting(&self, id: Uuid, status: RecordStatus) -> AppResult<()> {
        if !status.is_awaiting() {
            return Err(AppError::Internal(format!(
                "mark_awaiting called with non-awaiting status {}",
                status
            )));
        }

        sqlx::query(
            r#"
            UPDATE reconciliation_records
            SET status = $2::record_status, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn stage_inputs(&self, id: Uuid, inputs: &RequiredInputs) -> AppResult<()> {
        sqlx::query(
            "UPDATE reconciliation_records SET inputs = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(Json(inputs.clone()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset_stale(&self, id: Uuid, stale_before: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE reconciliation_records
            SET status = 'failed', last_error = 'stale claim reset',
                last_attempt_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
              AND COALESCE(GREATEST(last_attempt_at, started_at), to_timestamp(0)) < $2
            "#,
        )
        .bind(id)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reset_for_retry(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE reconciliation_records
            SET status = 'pending', last_error = NULL, started_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'failed' AND attempt_count < max_attempts
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reset_all_for_retry(&self) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE reconciliation_records
            SET status = 'pending', last_error = NULL, started_at = NULL, updated_at = NOW()
            WHERE status = 'failed' AND attempt_count < max_attempts
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ========== IN-MEMORY STORE ==========

/// In-memory record store with the same compare-and-set semantics as the
/// Postgres implementation. Used in tests and local development.
pub struct MemoryRecordStore {
    records: tokio::sync::RwLock<HashMap<Uuid, ReconciliationRecord>>,
    default_max_attempts: i32,
}

impl MemoryRecordStore {
    pub fn new(default_max_attempts: i32) -> Self {
        Self {
            records: tokio::sync::RwLock::new(HashMap::new()),
            default_max_attempts,
        }
    }

    /// Insert a fully-formed record, replacing any existing one with the same
    /// id. Intended for tests and local seeding.
    pub async fn put(&self, record: ReconciliationRecord) {
        let mut records = self.records.write().await;
        records.insert(record.id, record);
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert_by_external_ref(
        &self,
        kind: SettlementKind,
        external_ref: &str,
        patch: RecordPatch,
    ) -> AppResult<ReconciliationRecord> {
        let mut records = self.records.write().await;
        let now = Utc::now();

        let existing_id = records
            .values()
            .find(|r| r.kind == kind && r.external_ref == external_ref)
            .map(|r| r.id);

        if let Some(id) = existing_id {
            let record = records
                .get_mut(&id)
                .ok_or_else(|| AppError::Internal("record vanished during upsert".into()))?;
            if let Some(status) = patch.status {
                record.status = status;
            }
            if let Some(inputs) = patch.inputs {
                record.inputs = inputs;
            }
            if let Some(raw) = patch.raw_payload {
                record.raw_payload = raw;
            }
            if let Some(max) = patch.max_attempts {
                record.max_attempts = max;
            }
            record.updated_at = now;
            return Ok(record.clone());
        }

        let record = ReconciliationRecord {
            id: Uuid::new_v4(),
            external_ref: external_ref.to_string(),
            kind,
            status: patch.status.unwrap_or(RecordStatus::Pending),
            inputs: patch.inputs.unwrap_or_else(|| RequiredInputs::empty(kind)),
            raw_payload: patch.raw_payload.unwrap_or_else(|| serde_json::json!({})),
            attempt_count: 0,
            max_attempts: patch.max_attempts.unwrap_or(self.default_max_attempts),
            started_at: None,
            last_attempt_at: None,
            last_error: None,
            settlement_result: None,
            created_at: now,
            updated_at: now,
        };
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<ReconciliationRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&id).cloned())
    }

    async fn get_by_external_ref(
        &self,
        kind: SettlementKind,
        external_ref: &str,
    ) -> AppResult<Option<ReconciliationRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|r| r.kind == kind && r.external_ref == external_ref)
            .cloned())
    }

    async fn find_candidates(
        &self,
        query: CandidateQuery,
    ) -> AppResult<Vec<ReconciliationRecord>> {
        let records = self.records.read().await;
        let mut candidates: Vec<ReconciliationRecord> = records
            .values()
            .filter(|r| query.statuses.contains(&r.status))
            .filter(|r| query.kind.map_or(true, |k| r.kind == k))
            .filter(|r| {
                query
                    .reference
                    .as_deref()
                    .map_or(true, |reference| r.external_ref == reference)
            })
            .filter(|r| {
                r.status != RecordStatus::InProgress || r.is_stale(query.stale_before)
            })
            .filter(|r| r.status != RecordStatus::Failed || !r.attempts_exhausted())
            .cloned()
            .collect();

        candidates.sort_by_key(|r| r.updated_at);
        candidates.truncate(query.limit.max(0) as usize);
        Ok(candidates)
    }

    async fn claim_from(&self, id: Uuid, expected: RecordStatus) -> AppResult<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) if record.status == expected => {
                record.status = RecordStatus::InProgress;
                record.started_at = Some(Utc::now());
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, id: Uuid, result: serde_json::Value) -> AppResult<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&id) {
            record.status = RecordStatus::Completed;
            record.settlement_result = Some(result);
            record.last_error = None;
            record.last_attempt_at = Some(Utc::now());
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, reason: &str, increment_attempt: bool) -> AppResult<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&id) {
            record.status = RecordStatus::Failed;
            record.last_error = Some(reason.to_string());
            if increment_attempt {
                record.attempt_count += 1;
            }
            record.last_attempt_at = Some(Utc::now());
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_awaiting(&self, id: Uuid, status: RecordStatus) -> AppResult<()> {
        if !status.is_awaiting() {
            return Err(AppError::Internal(format!(
                "mark_awaiting called with non-awaiting status {}",
                status
            )));
        }
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&id) {
            record.status = status;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn stage_inputs(&self, id: Uuid, inputs: &RequiredInputs) -> AppResult<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&id) {
            record.inputs = inputs.clone();
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset_stale(&self, id: Uuid, stale_before: DateTime<Utc>) -> AppResult<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) if record.is_stale(stale_before) => {
                record.status = RecordStatus::Failed;
                record.last_error = Some("stale claim reset".to_string());
                record.last_attempt_at = Some(Utc::now());
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_for_retry(&self, id: Uuid) -> AppResult<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record)
                if record.status == RecordStatus::Failed && !record.attempts_exhausted() =>
            {
                record.status = RecordStatus::Pending;
                record.last_error = None;
                record.started_at = None;
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_all_for_retry(&self) -> AppResult<u64> {
        let mut records = self.records.write().await;
        let mut count = 0u64;
        for record in records.values_mut() {
            if record.status == RecordStatus::Failed && !record.attempts_exhausted() {
                record.status = RecordStatus::Pending;
                record.last_error = None;
                record.started_at = None;
                record.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }
}
