use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::models::*;
use crate::{
    error::{AppError, AppResult},
    middleware::rate_limit::SweepThrottle,
    reconcile::{
        models::RecordStatus,
        store::RecordStore,
        sweep::{ReconcileSweep, SweepParams},
    },
    supervisor::{ProcessSupervisor, WorkerHealth},
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub sweep: Arc<ReconcileSweep>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub throttle: Arc<SweepThrottle>,
    pub reconcile_secret: Option<String>,
}

/// GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Trigger one reconciliation pass
/// POST /api/v1/reconcile/sweep
pub async fn run_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SweepQuery>,
) -> AppResult<Json<SweepResponse>> {
    authorize_sweep(&state, &headers, query.token.as_deref())?;
    state.throttle.check()?;
    query
        .validate()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let summary = state
        .sweep
        .run(SweepParams {
            limit: query.limit,
            stale_minutes: query.stale_minutes,
            reference: query.reference.clone(),
            debug: query.debug,
        })
        .await?;

    Ok(Json(SweepResponse {
        success: true,
        summary,
    }))
}

/// Unauthenticated only when no secret is configured. The token rides either
/// the x-reconcile-token header or the `token` query parameter so both cron
/// triggers and humans can call it.
fn authorize_sweep(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> AppResult<()> {
    let Some(secret) = &state.reconcile_secret else {
        return Ok(());
    };

    let header_token = headers
        .get("x-reconcile-token")
        .and_then(|v| v.to_str().ok());

    if header_token == Some(secret.as_str()) || query_token == Some(secret.as_str()) {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}

/// Manually queue one failed record for retry
/// POST /api/v1/reconcile/retry/:id
pub async fn retry_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<RetryResponse>> {
    let id = parse_record_id(&id)?;

    let record = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("record {}", id)))?;

    if record.status != RecordStatus::Failed {
        return Err(AppError::Precondition(format!(
            "record {} is {} - only failed records can be retried",
            record.external_ref, record.status
        )));
    }
    if record.attempts_exhausted() {
        return Err(AppError::Precondition(format!(
            "record {} has exhausted its retry budget ({}/{})",
            record.external_ref, record.attempt_count, record.max_attempts
        )));
    }

    // CAS re-checks both preconditions; a concurrent actor may have moved
    // the record since the read above
    if !state.store.reset_for_retry(id).await? {
        return Err(AppError::Precondition(format!(
            "record {} is no longer eligible for retry",
            record.external_ref
        )));
    }

    info!(
        "↩️ Manual retry queued for {} {}",
        record.kind, record.external_ref
    );

    Ok(Json(RetryResponse {
        success: true,
        id,
        status: RecordStatus::Pending,
    }))
}

/// Queue every eligible failed record for retry
/// POST /api/v1/reconcile/retry-all
pub async fn retry_all(State(state): State<AppState>) -> AppResult<Json<RetryAllResponse>> {
    let retried = state.store.reset_all_for_retry().await?;
    info!("↩️ Bulk retry queued {} record(s)", retried);
    Ok(Json(RetryAllResponse {
        success: true,
        retried,
    }))
}

/// Operator view of one record
/// GET /api/v1/reconcile/records/:id
pub async fn get_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<RecordStatusResponse>> {
    let id = parse_record_id(&id)?;
    let record = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("record {}", id)))?;
    Ok(Json(record.into()))
}

fn parse_record_id(raw: &str) -> AppResult<Uuid> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidInput("record id is required".to_string()));
    }
    Uuid::parse_str(trimmed)
        .map_err(|_| AppError::InvalidInput(format!("invalid record id: {}", trimmed)))
}

/// GET /api/v1/worker/health
pub async fn worker_health(State(state): State<AppState>) -> AppResult<Json<WorkerHealth>> {
    let health = state.supervisor.health().await?;
    Ok(Json(health))
}

/// POST /api/v1/worker/control
pub async fn worker_control(
    State(state): State<AppState>,
    Json(request): Json<WorkerControlRequest>,
) -> AppResult<Json<WorkerControlResponse>> {
    state.supervisor.control(request.action).await?;
    info!("🔧 Worker control action applied: {}", request.action);
    Ok(Json(WorkerControlResponse {
        success: true,
        action: request.action,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::invoker::{
        SettlementApi, SettlementInvoker, SettlementRequest, SettlementResponse,
    };
    use crate::reconcile::models::{
        AllocationInputs, RecordPatch, ReconciliationRecord, RequiredInputs, SettlementKind,
    };
    use crate::reconcile::store::MemoryRecordStore;
    use crate::reconcile::sweep::SweepConfig;
    use crate::supervisor::WorkerAction;
    use async_trait::async_trait;

    struct NullApi;

    #[async_trait]
    impl SettlementApi for NullApi {
        async fn submit(&self, _request: &SettlementRequest) -> AppResult<SettlementResponse> {
            Ok(SettlementResponse {
                success: true,
                skipped: false,
                message: None,
                data: None,
            })
        }
    }

    struct StubSupervisor;

    #[async_trait]
    impl ProcessSupervisor for StubSupervisor {
        async fn health(&self) -> AppResult<WorkerHealth> {
            Ok(WorkerHealth {
                status: "online".to_string(),
                uptime_seconds: 3600,
                restarts: 1,
                memory_bytes: 64 << 20,
                cpu_percent: 0.5,
            })
        }

        async fn control(&self, _action: WorkerAction) -> AppResult<()> {
            Ok(())
        }
    }

    fn state_with(secret: Option<&str>) -> (Arc<MemoryRecordStore>, AppState) {
        let store = Arc::new(MemoryRecordStore::new(3));
        let invoker = Arc::new(SettlementInvoker::new(store.clone(), Arc::new(NullApi)));
        let sweep = Arc::new(ReconcileSweep::new(
            store.clone(),
            invoker,
            SweepConfig::default(),
        ));
        let state = AppState {
            store: store.clone(),
            sweep,
            supervisor: Arc::new(StubSupervisor),
            throttle: Arc::new(SweepThrottle::new(100, 60)),
            reconcile_secret: secret.map(|s| s.to_string()),
        };
        (store, state)
    }

    async fn failed_record(
        store: &MemoryRecordStore,
        reference: &str,
        attempt_count: i32,
    ) -> ReconciliationRecord {
        let mut record = store
            .upsert_by_external_ref(
                SettlementKind::Allocation,
                reference,
                RecordPatch {
                    status: Some(RecordStatus::Failed),
                    inputs: Some(RequiredInputs::Allocation(AllocationInputs {
                        asset: Some("cUSD".to_string()),
                        user_address: Some("0xbeef".to_string()),
                        amount_usd: Some(rust_decimal::Decimal::new(5000, 2)),
                        tx_hash: Some("0xabc".to_string()),
                        goal_id: None,
                    })),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        record.attempt_count = attempt_count;
        record.last_error = Some("settlement timeout".to_string());
        store.put(record.clone()).await;
        record
    }

    #[tokio::test]
    async fn retry_rejects_exhausted_budget() {
        let (store, state) = state_with(None);
        let record = failed_record(&store, "DEP-1", 3).await;

        let err = retry_record(State(state), Path(record.id.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));

        let unchanged = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, RecordStatus::Failed);
        assert_eq!(unchanged.attempt_count, 3);
    }

    #[tokio::test]
    async fn retry_resets_eligible_record_to_pending() {
        let (store, state) = state_with(None);
        let record = failed_record(&store, "DEP-2", 1).await;

        let response = retry_record(State(state), Path(record.id.to_string()))
            .await
            .unwrap();
        assert!(response.0.success);
        assert_eq!(response.0.status, RecordStatus::Pending);

        let reset = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(reset.status, RecordStatus::Pending);
        // Manual retry does not refund or spend attempts
        assert_eq!(reset.attempt_count, 1);
        assert!(reset.last_error.is_none());
    }

    #[tokio::test]
    async fn retry_rejects_bad_and_unknown_ids() {
        let (_store, state) = state_with(None);

        let err = retry_record(State(state.clone()), Path("not-a-uuid".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        let err = retry_record(State(state), Path(Uuid::new_v4().to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn retry_all_only_touches_eligible_failures() {
        let (store, state) = state_with(None);
        failed_record(&store, "DEP-3", 1).await;
        failed_record(&store, "DEP-4", 3).await;

        let response = retry_all(State(state)).await.unwrap();
        assert_eq!(response.0.retried, 1);
    }

    #[tokio::test]
    async fn sweep_requires_the_configured_secret() {
        let (_store, state) = state_with(Some("hunter2"));

        let err = run_sweep(
            State(state.clone()),
            HeaderMap::new(),
            Query(SweepQuery::default()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));

        // Header token works
        let mut headers = HeaderMap::new();
        headers.insert("x-reconcile-token", "hunter2".parse().unwrap());
        let response = run_sweep(State(state.clone()), headers, Query(SweepQuery::default()))
            .await
            .unwrap();
        assert!(response.0.success);

        // Query token works too
        let response = run_sweep(
            State(state),
            HeaderMap::new(),
            Query(SweepQuery {
                token: Some("hunter2".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert!(response.0.success);
    }

    #[tokio::test]
    async fn sweep_rejects_invalid_params() {
        let (_store, state) = state_with(None);

        let err = run_sweep(
            State(state),
            HeaderMap::new(),
            Query(SweepQuery {
                limit: Some(0),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn worker_endpoints_proxy_the_supervisor() {
        let (_store, state) = state_with(None);

        let health = worker_health(State(state.clone())).await.unwrap();
        assert_eq!(health.0.status, "online");

        let response = worker_control(
            State(state),
            Json(WorkerControlRequest {
                action: WorkerAction::Restart,
            }),
        )
        .await
        .unwrap();
        assert!(response.0.success);
    }
}
