use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use super::invoker::{InvokeOutcome, SettlementInvoker};
use super::models::{ReconciliationRecord, RecordStatus};
use super::recovery;
use super::store::{CandidateQuery, RecordStore};
use crate::error::AppResult;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            batch_size: 10,
        }
    }
}

/// Long-running consumer draining the pending pool.
///
/// Runs as its own process under the external supervisor; operators only see
/// it through the gateway's health/control proxy. Coordination with the sweep
/// happens entirely through the store's claim CAS, so both can run against
/// the same records at once.
pub struct ReconcileWorker {
    store: Arc<dyn RecordStore>,
    invoker: Arc<SettlementInvoker>,
    config: WorkerConfig,
}

impl ReconcileWorker {
    pub fn new(
        store: Arc<dyn RecordStore>,
        invoker: Arc<SettlementInvoker>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            invoker,
            config,
        }
    }

    /// Start the drain loop in the background.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "🔄 Reconcile worker started (poll {:?}, batch {})",
                self.config.poll_interval, self.config.batch_size
            );
            let mut ticker = interval(self.config.poll_interval);
            loop {
                ticker.tick().await;
                match self.drain_once().await {
                    Ok(0) => {}
                    Ok(n) => info!("✓ Worker drained {} pending record(s)", n),
                    Err(e) => error!("✗ Worker drain failed: {}", e),
                }
            }
        })
    }

    /// One drain pass over pending records. Per-record errors are isolated.
    pub async fn drain_once(&self) -> AppResult<usize> {
        let candidates = self
            .store
            .find_candidates(CandidateQuery {
                statuses: vec![RecordStatus::Pending],
                kind: None,
                reference: None,
                stale_before: Utc::now(),
                limit: self.config.batch_size,
            })
            .await?;

        let mut drained = 0;
        for record in candidates {
            if let Err(e) = self.process_record(record).await {
                warn!("⚠️ Worker record error: {}", e);
            }
            drained += 1;
        }
        Ok(drained)
    }

    async fn process_record(&self, mut record: ReconciliationRecord) -> AppResult<()> {
        let recovery = recovery::resolve(&record.inputs, &record.raw_payload);
        if !recovery.recovered.is_empty() {
            self.store.stage_inputs(record.id, &recovery.inputs).await?;
        }

        if !recovery.is_complete() {
            // Blocked on upstream data; park it for the sweep without
            // spending an attempt
            match recovery.awaiting_status() {
                Some(status) => self.store.mark_awaiting(record.id, status).await?,
                None => {
                    self.store
                        .fail(
                            record.id,
                            &format!(
                                "missing required fields: {}",
                                recovery.missing.join(", ")
                            ),
                            false,
                        )
                        .await?
                }
            }
            return Ok(());
        }

        // Exactly-one-winner: a concurrent sweep forcing the same record
        // takes it or we do, never both
        if !self.store.claim(record.id).await? {
            return Ok(());
        }
        record.inputs = recovery.inputs;
        record.status = RecordStatus::InProgress;

        match self.invoker.invoke(&record, false).await? {
            InvokeOutcome::Success | InvokeOutcome::Skipped(_) => {}
            InvokeOutcome::Failed(reason) => {
                warn!(
                    "⚠️ {} {} failed in worker: {}",
                    record.kind, record.external_ref, reason
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::invoker::{SettlementApi, SettlementRequest, SettlementResponse};
    use crate::reconcile::models::{
        AllocationInputs, DisbursementInputs, RecordPatch, RequiredInputs, SettlementKind,
    };
    use crate::reconcile::store::MemoryRecordStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct AlwaysSucceeds;

    #[async_trait]
    impl SettlementApi for AlwaysSucceeds {
        async fn submit(&self, _request: &SettlementRequest) -> AppResult<SettlementResponse> {
            Ok(SettlementResponse {
                success: true,
                skipped: false,
                message: None,
                data: None,
            })
        }
    }

    fn worker(store: Arc<MemoryRecordStore>) -> ReconcileWorker {
        let invoker = Arc::new(SettlementInvoker::new(store.clone(), Arc::new(AlwaysSucceeds)));
        ReconcileWorker::new(store, invoker, WorkerConfig::default())
    }

    #[tokio::test]
    async fn drains_complete_pending_records() {
        let store = Arc::new(MemoryRecordStore::new(3));
        let record = store
            .upsert_by_external_ref(
                SettlementKind::Disbursement,
                "WD-1",
                RecordPatch {
                    inputs: Some(RequiredInputs::Disbursement(DisbursementInputs {
                        recipient: Some("+254700000001".to_string()),
                        amount: Some(dec!(125)),
                        channel: Some("mpesa".to_string()),
                    })),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let drained = worker(store.clone()).drain_once().await.unwrap();
        assert_eq!(drained, 1);

        let settled = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(settled.status, RecordStatus::Completed);
    }

    #[tokio::test]
    async fn incomplete_allocation_is_parked_as_awaiting() {
        let store = Arc::new(MemoryRecordStore::new(3));
        let record = store
            .upsert_by_external_ref(
                SettlementKind::Allocation,
                "DEP-1",
                RecordPatch {
                    inputs: Some(RequiredInputs::Allocation(AllocationInputs {
                        asset: Some("cUSD".to_string()),
                        user_address: Some("0xbeef".to_string()),
                        amount_usd: Some(dec!(50)),
                        tx_hash: None,
                        goal_id: None,
                    })),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        worker(store.clone()).drain_once().await.unwrap();

        let parked = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(parked.status, RecordStatus::AwaitingTxHash);
        assert_eq!(parked.attempt_count, 0);
    }

    #[tokio::test]
    async fn incomplete_disbursement_fails_without_spending_attempts() {
        let store = Arc::new(MemoryRecordStore::new(3));
        let record = store
            .upsert_by_external_ref(
                SettlementKind::Disbursement,
                "WD-2",
                RecordPatch::default(),
            )
            .await
            .unwrap();

        worker(store.clone()).drain_once().await.unwrap();

        let parked = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(parked.status, RecordStatus::Failed);
        assert_eq!(parked.attempt_count, 0);
        assert!(parked
            .last_error
            .as_deref()
            .unwrap()
            .contains("missing required fields"));
    }
}
