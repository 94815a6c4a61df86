use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::models::{ReconciliationRecord, RecordStatus, RequiredInputs};
use super::store::RecordStore;
use crate::error::{AppError, AppResult};

/// Request sent to the settlement service: kind-specific inputs plus an
/// idempotency reference the service can deduplicate on.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementRequest {
    pub idempotency_ref: String,
    #[serde(flatten)]
    pub inputs: RequiredInputs,
}

impl SettlementRequest {
    pub fn from_record(record: &ReconciliationRecord) -> AppResult<Self> {
        let missing = record.inputs.missing_fields();
        if !missing.is_empty() {
            return Err(AppError::Precondition(format!(
                "record {} is missing required inputs: {}",
                record.external_ref,
                missing.join(", ")
            )));
        }
        Ok(Self {
            idempotency_ref: format!("{}:{}", record.kind, record.external_ref),
            inputs: record.inputs.clone(),
        })
    }
}

/// Structured settlement outcome. Anything the service sends that does not
/// parse into this shape is classified as a failure with the raw body kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl SettlementResponse {
    /// Payload persisted as `settlement_result`; carries the `success` marker
    /// the already-settled check keys on.
    pub fn result_payload(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .unwrap_or_else(|_| serde_json::json!({ "success": self.success }))
    }
}

/// The opaque settlement call. Allocation credits an on-chain savings
/// position; disbursement pays out to mobile money. The engine only sees
/// success/skip/failure.
#[async_trait]
pub trait SettlementApi: Send + Sync {
    async fn submit(&self, request: &SettlementRequest) -> AppResult<SettlementResponse>;
}

/// HTTP client for the settlement service.
pub struct HttpSettlementApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpSettlementApi {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl SettlementApi for HttpSettlementApi {
    async fn submit(&self, request: &SettlementRequest) -> AppResult<SettlementResponse> {
        let mut call = self
            .client
            .post(format!("{}/v1/settlements", self.base_url))
            .json(request);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let response = call.send().await?;
        let status = response.status();
        let body = response.text().await?;

        match serde_json::from_str::<SettlementResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) => {
                // Non-structured response: failure, raw text preserved
                warn!(
                    "⚠️ Settlement service returned non-structured response ({})",
                    status
                );
                Ok(SettlementResponse {
                    success: false,
                    skipped: false,
                    message: Some(format!("HTTP {}: {}", status, truncate(&body, 512))),
                    data: None,
                })
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let cut = text
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &text[..cut])
    }
}

/// Classified outcome of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    Success,
    /// Treated as success for reporting; no attempt consumed.
    Skipped(String),
    Failed(String),
}

/// Idempotent wrapper around the settlement call.
///
/// `force` permits invocation despite FAILED status or a just-resolved
/// awaiting sub-state. It never bypasses the already-settled check: a record
/// with a success marker is skipped without calling out, always.
pub struct SettlementInvoker {
    store: Arc<dyn RecordStore>,
    api: Arc<dyn SettlementApi>,
}

impl SettlementInvoker {
    pub fn new(store: Arc<dyn RecordStore>, api: Arc<dyn SettlementApi>) -> Self {
        Self { store, api }
    }

    pub async fn invoke(
        &self,
        record: &ReconciliationRecord,
        force: bool,
    ) -> AppResult<InvokeOutcome> {
        if record.is_settled() {
            // A race can leave a settled record outside COMPLETED; converge it
            if record.status != RecordStatus::Completed {
                let result = record
                    .settlement_result
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({ "success": true }));
                self.store.complete(record.id, result).await?;
            }
            info!(
                "⏭️ {} {} already settled, skipping",
                record.kind, record.external_ref
            );
            return Ok(InvokeOutcome::Skipped("already settled".to_string()));
        }

        if record.status == RecordStatus::Completed {
            return Ok(InvokeOutcome::Skipped("already completed".to_string()));
        }

        if !force
            && !matches!(
                record.status,
                RecordStatus::Pending | RecordStatus::InProgress
            )
        {
            return Err(AppError::Precondition(format!(
                "record {} in status {} requires a forced retry",
                record.external_ref, record.status
            )));
        }

        let request = SettlementRequest::from_record(record)?;

        match self.api.submit(&request).await {
            Ok(response) if response.success => {
                self.store
                    .complete(record.id, response.result_payload())
                    .await?;
                info!("✓ {} {} settled", record.kind, record.external_ref);
                Ok(InvokeOutcome::Success)
            }
            Ok(response) if response.skipped => {
                let reason = response
                    .message
                    .unwrap_or_else(|| "skipped by settlement service".to_string());
                info!(
                    "⏭️ {} {} skipped by settlement service: {}",
                    record.kind, record.external_ref, reason
                );
                Ok(InvokeOutcome::Skipped(reason))
            }
            Ok(response) => {
                let reason = response
                    .message
                    .unwrap_or_else(|| "settlement service reported failure".to_string());
                self.store.fail(record.id, &reason, true).await?;
                warn!(
                    "✗ {} {} failed: {}",
                    record.kind, record.external_ref, reason
                );
                Ok(InvokeOutcome::Failed(reason))
            }
            Err(e) => {
                let reason = e.to_string();
                self.store.fail(record.id, &reason, true).await?;
                warn!(
                    "✗ {} {} failed: {}",
                    record.kind, record.external_ref, reason
                );
                Ok(InvokeOutcome::Failed(reason))
            }
        }
    }
}
