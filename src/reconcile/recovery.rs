//! Field recovery resolver.
//!
//! Upstream webhooks arrive in several shapes: the processor's first
//! notification, a later confirmation carrying the transaction hash, or a
//! batched replay. A record can therefore be created with holes in its
//! required inputs while the data it needs already sits somewhere in the
//! retained payload. Recovery is a pure function over (inputs, raw payload):
//! each missing field is probed against a fixed, prioritized list of
//! alternate payload locations; first match wins, no scoring.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

use super::models::{RecordStatus, RequiredInputs, SettlementKind};

/// Raw upstream payload wrapper. Probes only ever read through this type so
/// the search order stays auditable in one place.
#[derive(Clone, Copy)]
pub struct RawPayload<'a>(pub &'a serde_json::Value);

impl RawPayload<'_> {
    fn value_at(&self, path: &[&str]) -> Option<&serde_json::Value> {
        let mut current = self.0;
        for segment in path {
            current = current.get(segment)?;
        }
        Some(current)
    }

    fn str_at(&self, path: &[&str]) -> Option<String> {
        self.value_at(path)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }

    fn decimal_at(&self, path: &[&str]) -> Option<Decimal> {
        self.value_at(path).and_then(as_decimal)
    }

    /// Newest entry of the retained `events` array carrying `field` as a
    /// string. Later webhooks supersede earlier ones.
    fn latest_event_str(&self, field: &str) -> Option<String> {
        self.0
            .get("events")?
            .as_array()?
            .iter()
            .rev()
            .find_map(|event| {
                event
                    .get(field)
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
            })
    }

    fn latest_event_decimal(&self, field: &str) -> Option<Decimal> {
        self.0
            .get("events")?
            .as_array()?
            .iter()
            .rev()
            .find_map(|event| event.get(field).and_then(as_decimal))
    }
}

/// Processors send amounts as JSON numbers or quoted strings, depending on
/// the webhook version.
fn as_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().and_then(Decimal::from_f64),
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

type StringProbe = fn(RawPayload) -> Option<String>;
type DecimalProbe = fn(RawPayload) -> Option<Decimal>;

// Allocation probes, priority order.
const TX_HASH_PROBES: &[StringProbe] = &[
    |p| p.str_at(&["txHash"]),
    |p| p.str_at(&["transactionHash"]),
    |p| p.str_at(&["data", "txHash"]),
    |p| p.latest_event_str("txHash"),
];

const AMOUNT_USD_PROBES: &[DecimalProbe] = &[
    |p| p.decimal_at(&["amountUsd"]),
    |p| p.decimal_at(&["amount_usd"]),
    |p| p.decimal_at(&["data", "amountUsd"]),
    |p| p.latest_event_decimal("amountUsd"),
];

const ASSET_PROBES: &[StringProbe] = &[
    |p| p.str_at(&["asset"]),
    |p| p.str_at(&["data", "asset"]),
    |p| p.latest_event_str("asset"),
];

const USER_ADDRESS_PROBES: &[StringProbe] = &[
    |p| p.str_at(&["userAddress"]),
    |p| p.str_at(&["wallet"]),
    |p| p.str_at(&["data", "userAddress"]),
    |p| p.latest_event_str("userAddress"),
];

const GOAL_ID_PROBES: &[StringProbe] = &[
    |p| p.str_at(&["goalId"]),
    |p| p.str_at(&["data", "goalId"]),
];

// Disbursement probes, priority order.
const RECIPIENT_PROBES: &[StringProbe] = &[
    |p| p.str_at(&["recipient"]),
    |p| p.str_at(&["phoneNumber"]),
    |p| p.str_at(&["data", "recipient"]),
    |p| p.latest_event_str("recipient"),
];

const AMOUNT_PROBES: &[DecimalProbe] = &[
    |p| p.decimal_at(&["amount"]),
    |p| p.decimal_at(&["data", "amount"]),
    |p| p.latest_event_decimal("amount"),
];

const CHANNEL_PROBES: &[StringProbe] = &[
    |p| p.str_at(&["channel"]),
    |p| p.str_at(&["provider"]),
    |p| p.str_at(&["data", "channel"]),
];

fn first_string(payload: RawPayload, probes: &[StringProbe]) -> Option<String> {
    probes.iter().find_map(|probe| probe(payload))
}

fn first_decimal(payload: RawPayload, probes: &[DecimalProbe]) -> Option<Decimal> {
    probes.iter().find_map(|probe| probe(payload))
}

/// Result of one recovery pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    /// Inputs with every recoverable hole filled.
    pub inputs: RequiredInputs,
    /// Required fields filled during this pass (stage these to the store).
    pub recovered: Vec<&'static str>,
    /// Required fields still unset after probing.
    pub missing: Vec<&'static str>,
}

impl Recovery {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Sub-state a still-incomplete record should sit in. Allocations block
    /// on upstream data; incomplete disbursements stay where they are and
    /// only show up in the pass counters.
    pub fn awaiting_status(&self) -> Option<RecordStatus> {
        if self.missing.is_empty() {
            return None;
        }
        match self.inputs.kind() {
            SettlementKind::Allocation => Some(if self.missing.contains(&"tx_hash") {
                RecordStatus::AwaitingTxHash
            } else {
                RecordStatus::AwaitingAmount
            }),
            SettlementKind::Disbursement => None,
        }
    }
}

/// Fill missing required inputs from the retained payload. Pure: the same
/// inputs and payload always produce the same result.
pub fn resolve(inputs: &RequiredInputs, raw_payload: &serde_json::Value) -> Recovery {
    let payload = RawPayload(raw_payload);
    let mut recovered = Vec::new();

    let enriched = match inputs {
        RequiredInputs::Allocation(a) => {
            let mut a = a.clone();
            if a.asset.is_none() {
                if let Some(asset) = first_string(payload, ASSET_PROBES) {
                    a.asset = Some(asset);
                    recovered.push("asset");
                }
            }
            if a.user_address.is_none() {
                if let Some(address) = first_string(payload, USER_ADDRESS_PROBES) {
                    a.user_address = Some(address);
                    recovered.push("user_address");
                }
            }
            if a.amount_usd.is_none() {
                if let Some(amount) = first_decimal(payload, AMOUNT_USD_PROBES) {
                    a.amount_usd = Some(amount);
                    recovered.push("amount_usd");
                }
            }
            if a.tx_hash.is_none() {
                if let Some(tx_hash) = first_string(payload, TX_HASH_PROBES) {
                    a.tx_hash = Some(tx_hash);
                    recovered.push("tx_hash");
                }
            }
            // Optional: recovered opportunistically, never blocks
            if a.goal_id.is_none() {
                a.goal_id = first_string(payload, GOAL_ID_PROBES);
            }
            RequiredInputs::Allocation(a)
        }
        RequiredInputs::Disbursement(d) => {
            let mut d = d.clone();
            if d.recipient.is_none() {
                if let Some(recipient) = first_string(payload, RECIPIENT_PROBES) {
                    d.recipient = Some(recipient);
                    recovered.push("recipient");
                }
            }
            if d.amount.is_none() {
                if let Some(amount) = first_decimal(payload, AMOUNT_PROBES) {
                    d.amount = Some(amount);
                    recovered.push("amount");
                }
            }
            if d.channel.is_none() {
                if let Some(channel) = first_string(payload, CHANNEL_PROBES) {
                    d.channel = Some(channel);
                    recovered.push("channel");
                }
            }
            RequiredInputs::Disbursement(d)
        }
    };

    let missing = enriched.missing_fields();
    Recovery {
        inputs: enriched,
        recovered,
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::models::{AllocationInputs, DisbursementInputs};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn bare_allocation() -> RequiredInputs {
        RequiredInputs::Allocation(AllocationInputs {
            asset: Some("cUSD".to_string()),
            user_address: Some("0xbeef".to_string()),
            amount_usd: Some(dec!(42)),
            tx_hash: None,
            goal_id: None,
        })
    }

    #[test]
    fn tx_hash_recovered_from_later_webhook_event() {
        // Top level has no hash; a later webhook in the retained events does
        let payload = json!({
            "status": "confirmed",
            "events": [
                {"type": "deposit.created"},
                {"type": "deposit.confirmed", "txHash": "0xdeadbeef"}
            ]
        });

        let result = resolve(&bare_allocation(), &payload);
        assert!(result.is_complete());
        assert_eq!(result.recovered, vec!["tx_hash"]);
        match result.inputs {
            RequiredInputs::Allocation(a) => {
                assert_eq!(a.tx_hash.as_deref(), Some("0xdeadbeef"))
            }
            _ => panic!("kind changed during recovery"),
        }
    }

    #[test]
    fn first_match_wins_over_nested_locations() {
        let payload = json!({
            "txHash": "0xtoplevel",
            "data": {"txHash": "0xnested"},
            "events": [{"txHash": "0xevent"}]
        });

        let result = resolve(&bare_allocation(), &payload);
        match result.inputs {
            RequiredInputs::Allocation(a) => {
                assert_eq!(a.tx_hash.as_deref(), Some("0xtoplevel"))
            }
            _ => panic!("kind changed during recovery"),
        }
    }

    #[test]
    fn resolve_is_pure() {
        let inputs = RequiredInputs::Allocation(AllocationInputs::default());
        let payload = json!({
            "asset": "cUSD",
            "wallet": "0xfeed",
            "events": [{"amountUsd": "12.75"}]
        });

        let first = resolve(&inputs, &payload);
        let second = resolve(&inputs, &payload);
        assert_eq!(first, second);
        assert_eq!(first.missing, vec!["tx_hash"]);
    }

    #[test]
    fn amounts_parse_from_numbers_and_strings() {
        let inputs = RequiredInputs::Disbursement(DisbursementInputs {
            recipient: Some("+254700000001".to_string()),
            amount: None,
            channel: None,
        });
        let payload = json!({"amount": "350.25", "provider": "mpesa"});

        let result = resolve(&inputs, &payload);
        assert!(result.is_complete());
        assert_eq!(result.recovered, vec!["amount", "channel"]);
        match result.inputs {
            RequiredInputs::Disbursement(d) => {
                assert_eq!(d.amount, Some(dec!(350.25)));
                assert_eq!(d.channel.as_deref(), Some("mpesa"));
            }
            _ => panic!("kind changed during recovery"),
        }

        let numeric = json!({"amount": 350.25});
        let result = resolve(&inputs, &numeric);
        match result.inputs {
            RequiredInputs::Disbursement(d) => assert_eq!(d.amount, Some(dec!(350.25))),
            _ => panic!("kind changed during recovery"),
        }
    }

    #[test]
    fn awaiting_classification() {
        // Missing hash takes priority over missing amount
        let inputs = RequiredInputs::Allocation(AllocationInputs {
            asset: Some("cUSD".to_string()),
            user_address: Some("0xbeef".to_string()),
            amount_usd: None,
            tx_hash: None,
            goal_id: None,
        });
        let result = resolve(&inputs, &json!({}));
        assert_eq!(result.awaiting_status(), Some(RecordStatus::AwaitingTxHash));

        let inputs = RequiredInputs::Allocation(AllocationInputs {
            asset: Some("cUSD".to_string()),
            user_address: Some("0xbeef".to_string()),
            amount_usd: None,
            tx_hash: Some("0xabc".to_string()),
            goal_id: None,
        });
        let result = resolve(&inputs, &json!({}));
        assert_eq!(result.awaiting_status(), Some(RecordStatus::AwaitingAmount));

        // Disbursements have no blocked sub-state
        let inputs = RequiredInputs::Disbursement(DisbursementInputs::default());
        let result = resolve(&inputs, &json!({}));
        assert_eq!(result.awaiting_status(), None);

        // Complete records are never awaiting
        let result = resolve(&bare_allocation(), &json!({"txHash": "0xabc"}));
        assert_eq!(result.awaiting_status(), None);
    }
}
