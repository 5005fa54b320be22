//! Chain Transaction Reader: transaction lookup plus best-effort
//! extraction of normalized jetton-transfer records.
//!
//! Provider payloads are not trusted to have a stable shape. The
//! extractor probes the field spellings the known indexers use and
//! falls back to an empty list instead of erroring; amounts are kept
//! as plain numbers because some providers report raw base units and
//! others report human-decimal units (the verifier handles both).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc;

/// One jetton movement observed inside a transaction. Addresses stay
/// optional: bounced or partially parsed actions can lack either side.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TokenTransfer {
    pub from: Option<String>,
    pub to: Option<String>,
    /// Raw base units or human-decimal units, provider-dependent.
    pub amount: f64,
    /// Jetton master address of the moved asset.
    pub asset: Option<String>,
}

/// Read-only transaction lookup. `None` covers both "no such hash" and
/// transient transport failures — callers must treat it as
/// "unverifiable", never as "invalid".
pub trait ChainReader {
    fn transaction_by_hash(&self, tx_hash: &str) -> Option<Value>;
}

impl ChainReader for Box<dyn ChainReader> {
    fn transaction_by_hash(&self, tx_hash: &str) -> Option<Value> {
        (**self).transaction_by_hash(tx_hash)
    }
}

/// Reader backed by a TonAPI-style indexing endpoint.
pub struct IndexChainReader {
    endpoint: String,
    api_key: Option<String>,
}

impl IndexChainReader {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

impl ChainReader for IndexChainReader {
    fn transaction_by_hash(&self, tx_hash: &str) -> Option<Value> {
        if tx_hash.is_empty() {
            return None;
        }
        let url = format!(
            "{}/v2/blockchain/transactions/{}",
            self.endpoint.trim_end_matches('/'),
            tx_hash
        );
        rpc::get_json(&url, self.api_key.as_deref())
    }
}

/// Reader over a fixed hash→payload map. Used by the CLI (JSON fixture
/// file) and by tests.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct FixtureChainReader {
    transactions: BTreeMap<String, Value>,
}

impl FixtureChainReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tx_hash: impl Into<String>, payload: Value) {
        self.transactions.insert(tx_hash.into(), payload);
    }

    /// Build from a plain hash→payload map, the fixture file format.
    pub fn from_map(transactions: BTreeMap<String, Value>) -> Self {
        Self { transactions }
    }
}

impl ChainReader for FixtureChainReader {
    fn transaction_by_hash(&self, tx_hash: &str) -> Option<Value> {
        self.transactions.get(tx_hash).cloned()
    }
}

fn string_at<'a>(value: &'a Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match &value[*key] {
            Value::String(s) if !s.is_empty() => return Some(s.clone()),
            Value::Object(_) => {
                // e.g. {"sender": {"address": "..."}}
                if let Value::String(s) = &value[*key]["address"] {
                    if !s.is_empty() {
                        return Some(s.clone());
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn number_at(value: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match &value[*key] {
            Value::Number(n) => return n.as_f64(),
            Value::String(s) => {
                if let Ok(parsed) = s.trim().parse::<f64>() {
                    return Some(parsed);
                }
            }
            _ => {}
        }
    }
    None
}

fn asset_of(value: &Value) -> Option<String> {
    for key in ["jetton", "jetton_master"] {
        match &value[key] {
            Value::String(s) if !s.is_empty() => return Some(s.clone()),
            Value::Object(_) => {
                if let Some(s) = string_at(&value[key], &["address"]) {
                    return Some(s);
                }
                if let Some(s) = string_at(&value[key]["master"], &["address"]) {
                    return Some(s);
                }
            }
            _ => {}
        }
    }
    None
}

fn transfer_from_action(action: &Value) -> Option<TokenTransfer> {
    let kind = action["type"].as_str().unwrap_or_default();
    let body = if action["JettonTransfer"].is_object() {
        &action["JettonTransfer"]
    } else if kind == "JettonTransfer" || kind == "JettonTransferBounced" {
        action
    } else {
        return None;
    };
    Some(TokenTransfer {
        from: string_at(body, &["sender", "sender_address", "from"]),
        to: string_at(body, &["recipient", "recipient_address", "to"]),
        amount: number_at(body, &["amount"]).unwrap_or(0.0),
        asset: asset_of(body),
    })
}

/// Extract every jetton transfer the payload mentions, across the action
/// list and the top-level convenience array. Unrecognized shapes yield
/// an empty list.
pub fn extract_token_transfers(tx: &Value) -> Vec<TokenTransfer> {
    let mut transfers = Vec::new();

    if let Value::Array(actions) = &tx["actions"] {
        for action in actions {
            if let Some(t) = transfer_from_action(action) {
                transfers.push(t);
            }
        }
    }

    if let Value::Array(top) = &tx["jetton_transfers"] {
        for jt in top {
            transfers.push(TokenTransfer {
                from: string_at(jt, &["sender", "from"]),
                to: string_at(jt, &["recipient", "to"]),
                amount: number_at(jt, &["amount"]).unwrap_or(0.0),
                asset: asset_of(jt),
            });
        }
    }

    transfers
}
