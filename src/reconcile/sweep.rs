use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use super::invoker::{InvokeOutcome, SettlementInvoker};
use super::models::{stale_cutoff, ReconciliationRecord, RecordStatus, SettlementKind};
use super::reaper::{StaleClaimReaper, DEFAULT_STALE_MINUTES};
use super::recovery;
use super::store::{CandidateQuery, RecordStore};
use crate::error::AppResult;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub stale_minutes: i64,
    pub default_limit: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            stale_minutes: DEFAULT_STALE_MINUTES,
            default_limit: 20,
        }
    }
}

/// Operator/scheduler-supplied knobs for one pass.
#[derive(Debug, Clone, Default)]
pub struct SweepParams {
    pub limit: Option<i64>,
    pub stale_minutes: Option<i64>,
    pub reference: Option<String>,
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordTrace {
    pub id: Uuid,
    pub external_ref: String,
    pub kind: SettlementKind,
    pub outcome: String,
}

#[derive(Debug, Default, Serialize)]
pub struct SweepSummary {
    pub processed: u64,
    pub allocated_or_settled: u64,
    pub awaiting_tx_hash: u64,
    pub awaiting_amount: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<Vec<RecordTrace>>,
}

/// Per-candidate outcome within one pass.
enum PassOutcome {
    Settled,
    AwaitingTxHash,
    AwaitingAmount,
    Failed(String),
    /// Nothing to do this pass (active claim, lost race)
    Noop(&'static str),
}

/// One scheduled execution of the engine over a bounded batch of candidates.
///
/// Per candidate, strict order: reaper check, field recovery, settlement
/// invocation. A stale reset is the candidate's outcome for the pass; the
/// record re-enters as FAILED on the next pass. A single record's failure
/// never aborts the remaining batch.
pub struct ReconcileSweep {
    store: Arc<dyn RecordStore>,
    invoker: Arc<SettlementInvoker>,
    config: SweepConfig,
}

impl ReconcileSweep {
    pub fn new(
        store: Arc<dyn RecordStore>,
        invoker: Arc<SettlementInvoker>,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            invoker,
            config,
        }
    }

    pub async fn run(&self, params: SweepParams) -> AppResult<SweepSummary> {
        let limit = params.limit.unwrap_or(self.config.default_limit);
        let stale_minutes = params.stale_minutes.unwrap_or(self.config.stale_minutes);
        let stale_before = stale_cutoff(Utc::now(), stale_minutes);

        info!(
            "🔄 Reconcile sweep starting (limit {}, staleness {}m)",
            limit, stale_minutes
        );

        // Store connectivity failure here aborts the whole invocation;
        // everything after this point is isolated per record.
        let candidates = self
            .store
            .find_candidates(CandidateQuery {
                statuses: vec![
                    RecordStatus::AwaitingTxHash,
                    RecordStatus::AwaitingAmount,
                    RecordStatus::Failed,
                    RecordStatus::InProgress,
                ],
                kind: None,
                reference: params.reference.clone(),
                stale_before,
                limit,
            })
            .await?;

        let reaper = StaleClaimReaper::new(self.store.clone(), stale_before);
        let mut summary = SweepSummary::default();
        let mut traces = Vec::new();

        for record in candidates {
            summary.processed += 1;
            let trace_base = (record.id, record.external_ref.clone(), record.kind);

            let outcome = match self.process_record(&reaper, record).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        "✗ Reconcile error for {} {}: {}",
                        trace_base.2, trace_base.1, e
                    );
                    PassOutcome::Failed(e.to_string())
                }
            };

            let outcome_label = match &outcome {
                PassOutcome::Settled => {
                    summary.allocated_or_settled += 1;
                    "settled".to_string()
                }
                PassOutcome::AwaitingTxHash => {
                    summary.awaiting_tx_hash += 1;
                    "awaiting tx hash".to_string()
                }
                PassOutcome::AwaitingAmount => {
                    summary.awaiting_amount += 1;
                    "awaiting amount".to_string()
                }
                PassOutcome::Failed(reason) => {
                    summary.failed += 1;
                    format!("failed: {}", reason)
                }
                PassOutcome::Noop(why) => (*why).to_string(),
            };

            if params.debug {
                traces.push(RecordTrace {
                    id: trace_base.0,
                    external_ref: trace_base.1,
                    kind: trace_base.2,
                    outcome: outcome_label,
                });
            }
        }

        if params.debug {
            summary.debug = Some(traces);
        }

        info!(
            "✓ Sweep done: {} processed, {} settled, {} awaiting hash, {} awaiting amount, {} failed",
            summary.processed,
            summary.allocated_or_settled,
            summary.awaiting_tx_hash,
            summary.awaiting_amount,
            summary.failed
        );

        Ok(summary)
    }

    async fn process_record(
        &self,
        reaper: &StaleClaimReaper,
        mut record: ReconciliationRecord,
    ) -> AppResult<PassOutcome> {
        // Reaper check first. A stale reset is this candidate's outcome for
        // the pass; the record comes back as FAILED next time around.
        if record.status == RecordStatus::InProgress {
            return if reaper.reap(&record).await? {
                Ok(PassOutcome::Failed("stale claim reset".to_string()))
            } else {
                Ok(PassOutcome::Noop("claim still active"))
            };
        }

        let recovery = recovery::resolve(&record.inputs, &record.raw_payload);
        if !recovery.recovered.is_empty() {
            // Persist recovered canonical fields for future attempts
            self.store.stage_inputs(record.id, &recovery.inputs).await?;
        }

        if recovery.is_complete() {
            // Exactly-one-winner guard before the side effect: a concurrent
            // sweep or worker working the same record loses the CAS.
            if !self.store.claim_from(record.id, record.status).await? {
                return Ok(PassOutcome::Noop("lost claim race"));
            }
            record.inputs = recovery.inputs;
            record.status = RecordStatus::InProgress;

            // Retry semantics always force past a non-terminal FAILED marker;
            // the already-settled check still holds inside the invoker.
            match self.invoker.invoke(&record, true).await? {
                InvokeOutcome::Success | InvokeOutcome::Skipped(_) => Ok(PassOutcome::Settled),
                InvokeOutcome::Failed(reason) => Ok(PassOutcome::Failed(reason)),
            }
        } else {
            // Upstream data gap: not an error, no attempt consumed
            match recovery.awaiting_status() {
                Some(status) => {
                    if record.status != status {
                        self.store.mark_awaiting(record.id, status).await?;
                    }
                    Ok(match status {
                        RecordStatus::AwaitingTxHash => PassOutcome::AwaitingTxHash,
                        _ => PassOutcome::AwaitingAmount,
                    })
                }
                // Incomplete disbursement: stays put, surfaces in counters
                None => Ok(PassOutcome::AwaitingAmount),
            }
        }
    }
}
