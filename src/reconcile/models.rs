use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// Settlement kind - selects the required-input schema and the external call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "settlement_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SettlementKind {
    /// Fiat deposit confirmed -> credit the user's on-chain savings position
    Allocation,
    /// On-chain transfer observed -> pay fiat out to mobile money
    Disbursement,
}

impl fmt::Display for SettlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl SettlementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementKind::Allocation => "allocation",
            SettlementKind::Disbursement => "disbursement",
        }
    }
}

/// Record status enum
///
/// The two `Awaiting*` values are allocation sub-states: blocked on upstream
/// data, not yet eligible for settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "record_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    AwaitingTxHash,
    AwaitingAmount,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::InProgress => "in_progress",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
            RecordStatus::AwaitingTxHash => "awaiting_tx_hash",
            RecordStatus::AwaitingAmount => "awaiting_amount",
        }
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(
            self,
            RecordStatus::AwaitingTxHash | RecordStatus::AwaitingAmount
        )
    }
}

/// Inputs needed to credit a savings position
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationInputs {
    pub asset: Option<String>,
    pub user_address: Option<String>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub amount_usd: Option<Decimal>,
    pub tx_hash: Option<String>,
    /// Optional savings-goal the deposit is earmarked for
    pub goal_id: Option<String>,
}

/// Inputs needed to pay out to mobile money
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisbursementInputs {
    /// Mobile-money account identifier (phone number or till)
    pub recipient: Option<String>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub amount: Option<Decimal>,
    /// Payout channel, e.g. "mpesa" or "airtel_money"
    pub channel: Option<String>,
}

/// Kind-specific required inputs, dispatched through a single invoke interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RequiredInputs {
    Allocation(AllocationInputs),
    Disbursement(DisbursementInputs),
}

impl RequiredInputs {
    pub fn empty(kind: SettlementKind) -> Self {
        match kind {
            SettlementKind::Allocation => {
                RequiredInputs::Allocation(AllocationInputs::default())
            }
            SettlementKind::Disbursement => {
                RequiredInputs::Disbursement(DisbursementInputs::default())
            }
        }
    }

    pub fn kind(&self) -> SettlementKind {
        match self {
            RequiredInputs::Allocation(_) => SettlementKind::Allocation,
            RequiredInputs::Disbursement(_) => SettlementKind::Disbursement,
        }
    }

    /// Names of required fields that are still unset. `goal_id` is optional
    /// and never reported here.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match self {
            RequiredInputs::Allocation(a) => {
                if a.asset.is_none() {
                    missing.push("asset");
                }
                if a.user_address.is_none() {
                    missing.push("user_address");
                }
                if a.amount_usd.is_none() {
                    missing.push("amount_usd");
                }
                if a.tx_hash.is_none() {
                    missing.push("tx_hash");
                }
            }
            RequiredInputs::Disbursement(d) => {
                if d.recipient.is_none() {
                    missing.push("recipient");
                }
                if d.amount.is_none() {
                    missing.push("amount");
                }
                if d.channel.is_none() {
                    missing.push("channel");
                }
            }
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

/// Reconciliation record - one per logical settlement.
///
/// The single source of truth for settlement status. Created when an upstream
/// event first arrives (possibly incomplete); never physically deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReconciliationRecord {
    pub id: Uuid,
    /// Stable external reference (payment-processor code or internal job id);
    /// unique per kind.
    pub external_ref: String,
    pub kind: SettlementKind,
    pub status: RecordStatus,
    #[sqlx(json)]
    pub inputs: RequiredInputs,
    /// Last-known upstream payload(s), retained so field recovery need not
    /// re-query upstream.
    pub raw_payload: serde_json::Value,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Outcome payload of a prior settlement call. A `"success": true` marker
    /// here proves the external call already went through.
    pub settlement_result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReconciliationRecord {
    /// Already-settled marker check. Recovery paths consult this before
    /// re-invoking, even under races.
    pub fn is_settled(&self) -> bool {
        self.settlement_result
            .as_ref()
            .and_then(|r| r.get("success"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Freshest activity timestamp; a claim with neither timestamp counts as
    /// immediately stale.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        match (self.last_attempt_at, self.started_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == RecordStatus::InProgress
            && self
                .last_activity()
                .map_or(true, |t| t < stale_before)
    }
}

/// Partial update applied through `upsert_by_external_ref`. Unset fields
/// leave the existing record untouched.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub status: Option<RecordStatus>,
    pub inputs: Option<RequiredInputs>,
    pub raw_payload: Option<serde_json::Value>,
    pub max_attempts: Option<i32>,
}

/// Cutoff helper for staleness math
pub fn stale_cutoff(now: DateTime<Utc>, stale_minutes: i64) -> DateTime<Utc> {
    now - Duration::minutes(stale_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(status: RecordStatus) -> ReconciliationRecord {
        ReconciliationRecord {
            id: Uuid::new_v4(),
            external_ref: "DEP-1001".to_string(),
            kind: SettlementKind::Allocation,
            status,
            inputs: RequiredInputs::empty(SettlementKind::Allocation),
            raw_payload: serde_json::json!({}),
            attempt_count: 0,
            max_attempts: 3,
            started_at: None,
            last_attempt_at: None,
            last_error: None,
            settlement_result: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn settled_marker_requires_success_true() {
        let mut rec = record(RecordStatus::Failed);
        assert!(!rec.is_settled());

        rec.settlement_result = Some(serde_json::json!({"success": false}));
        assert!(!rec.is_settled());

        rec.settlement_result = Some(serde_json::json!({"success": true, "tx": "0xabc"}));
        assert!(rec.is_settled());
    }

    #[test]
    fn missing_fields_per_kind() {
        let inputs = RequiredInputs::Allocation(AllocationInputs {
            asset: Some("USDC".to_string()),
            user_address: Some("0xfeed".to_string()),
            amount_usd: None,
            tx_hash: None,
            goal_id: None,
        });
        assert_eq!(inputs.missing_fields(), vec!["amount_usd", "tx_hash"]);
        assert!(!inputs.is_complete());

        let inputs = RequiredInputs::Disbursement(DisbursementInputs {
            recipient: Some("+254700000001".to_string()),
            amount: Some(dec!(125.50)),
            channel: Some("mpesa".to_string()),
        });
        assert!(inputs.is_complete());
    }

    #[test]
    fn goal_id_is_optional() {
        let inputs = RequiredInputs::Allocation(AllocationInputs {
            asset: Some("USDC".to_string()),
            user_address: Some("0xfeed".to_string()),
            amount_usd: Some(dec!(50)),
            tx_hash: Some("0xabc".to_string()),
            goal_id: None,
        });
        assert!(inputs.is_complete());
    }

    #[test]
    fn staleness_uses_freshest_timestamp() {
        let now = Utc::now();
        let cutoff = stale_cutoff(now, 20);

        let mut rec = record(RecordStatus::InProgress);
        // No timestamps at all: immediately stale
        assert!(rec.is_stale(cutoff));

        // Old claim, fresh attempt: not stale
        rec.started_at = Some(now - Duration::minutes(45));
        rec.last_attempt_at = Some(now - Duration::minutes(5));
        assert!(!rec.is_stale(cutoff));

        // Both old: stale
        rec.last_attempt_at = Some(now - Duration::minutes(30));
        assert!(rec.is_stale(cutoff));

        // Only in-progress records can be stale
        rec.status = RecordStatus::Failed;
        assert!(!rec.is_stale(cutoff));
    }

    #[test]
    fn inputs_round_trip_with_kind_tag() {
        let inputs = RequiredInputs::Allocation(AllocationInputs {
            asset: Some("cUSD".to_string()),
            user_address: Some("0xbeef".to_string()),
            amount_usd: Some(dec!(20.5)),
            tx_hash: None,
            goal_id: Some("goal-7".to_string()),
        });
        let value = serde_json::to_value(&inputs).unwrap();
        assert_eq!(value["kind"], "allocation");
        let back: RequiredInputs = serde_json::from_value(value).unwrap();
        assert_eq!(back, inputs);
    }
}
