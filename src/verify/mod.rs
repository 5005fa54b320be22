//! Payment Verifier: decides whether a transaction hash constitutes a
//! valid package payment to the treasury.
//!
//! Pure read path — no ledger state is touched here. The caller owns
//! the duplicate-hash check and everything that happens after a
//! successful verification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{extract_token_transfers, ChainReader, TokenTransfer};
use crate::config::{CoreConfig, RawAmount};

/// Prefix that short-circuits verification when `mock_payments` is set.
pub const MOCK_HASH_PREFIX: &str = "mock_";

/// Normalized details of a verified inbound payment, ready to persist.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VerifiedPayment {
    pub tx_hash: String,
    pub from: Option<String>,
    pub to: String,
    pub asset: String,
    pub amount_human: f64,
    pub amount_raw: RawAmount,
    pub mock: bool,
}

/// Every distinct way a verification can fail. Operators diagnose by
/// reason, so configuration gaps and chain outcomes stay separate
/// variants rather than one catch-all.
#[derive(Debug, Error, PartialEq)]
pub enum VerifyFailure {
    #[error("missing transaction hash")]
    MissingTxHash,
    #[error("treasury wallet address is not configured")]
    MissingTreasury,
    #[error("payment asset address is not configured")]
    MissingPaymentAsset,
    #[error("transaction not found on chain")]
    TxNotFound,
    #[error("transaction carries no jetton transfers")]
    NoTransfers,
    #[error("no transfer matched treasury/asset/amount")]
    NoMatchingTransfer {
        observed: Vec<TokenTransfer>,
    },
    #[error("payer mismatch: expected {expected}, observed {observed}")]
    PayerMismatch { expected: String, observed: String },
}

/// Trimmed, ASCII-case-insensitive address equality. No checksum
/// canonicalization: two encodings of the same address do not match.
pub fn addr_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

fn to_raw(amount: f64, decimals: u32) -> RawAmount {
    (amount * 10f64.powi(decimals as i32)).round() as RawAmount
}

/// `observed` may already be raw base units or still human-decimal.
/// Accept if either reading lands within ±1 unit of the requirement.
fn amount_matches(observed: f64, required_raw: RawAmount, decimals: u32) -> bool {
    if !observed.is_finite() {
        return false;
    }
    if (observed - required_raw as f64).abs() <= 1.0 {
        return true;
    }
    let as_raw = to_raw(observed, decimals);
    as_raw.abs_diff(required_raw) <= 1
}

pub struct PaymentVerifier<'a, R: ChainReader> {
    config: &'a CoreConfig,
    reader: &'a R,
}

impl<'a, R: ChainReader> PaymentVerifier<'a, R> {
    pub fn new(config: &'a CoreConfig, reader: &'a R) -> Self {
        Self { config, reader }
    }

    /// Verify that `tx_hash` paid the configured amount of the payment
    /// asset to the treasury; when `expected_from` is given, the payer
    /// must match too.
    pub fn verify(
        &self,
        tx_hash: &str,
        expected_from: Option<&str>,
    ) -> Result<VerifiedPayment, VerifyFailure> {
        let tx_hash = tx_hash.trim();
        if tx_hash.is_empty() {
            return Err(VerifyFailure::MissingTxHash);
        }

        if self.config.mock_payments && tx_hash.starts_with(MOCK_HASH_PREFIX) {
            return Ok(VerifiedPayment {
                tx_hash: tx_hash.to_string(),
                from: expected_from.map(str::to_string),
                to: self
                    .config
                    .treasury_address
                    .clone()
                    .unwrap_or_else(|| "mock_treasury".to_string()),
                asset: self
                    .config
                    .payment_asset
                    .clone()
                    .unwrap_or_else(|| "mock_asset".to_string()),
                amount_human: self.config.payment_amount_human(),
                amount_raw: self.config.payment_amount_raw,
                mock: true,
            });
        }

        let treasury = self
            .config
            .treasury_address
            .as_deref()
            .ok_or(VerifyFailure::MissingTreasury)?;
        let asset = self
            .config
            .payment_asset
            .as_deref()
            .ok_or(VerifyFailure::MissingPaymentAsset)?;

        let tx = self
            .reader
            .transaction_by_hash(tx_hash)
            .ok_or(VerifyFailure::TxNotFound)?;

        let transfers = extract_token_transfers(&tx);
        if transfers.is_empty() {
            return Err(VerifyFailure::NoTransfers);
        }

        let required_raw = self.config.payment_amount_raw;
        let decimals = self.config.payment_decimals;
        let matched = transfers.iter().find(|t| {
            t.to.as_deref().map_or(false, |to| addr_eq(to, treasury))
                && t.asset.as_deref().map_or(false, |j| addr_eq(j, asset))
                && amount_matches(t.amount, required_raw, decimals)
        });

        let matched = match matched {
            Some(t) => t,
            None => {
                return Err(VerifyFailure::NoMatchingTransfer {
                    observed: transfers,
                })
            }
        };

        if let Some(expected) = expected_from {
            let observed = matched.from.as_deref().unwrap_or_default();
            if !addr_eq(observed, expected) {
                return Err(VerifyFailure::PayerMismatch {
                    expected: expected.to_string(),
                    observed: observed.to_string(),
                });
            }
        }

        // Normalize whichever representation the provider used to raw.
        let amount_raw = if (matched.amount - required_raw as f64).abs() <= 1.0 {
            matched.amount.round() as RawAmount
        } else {
            to_raw(matched.amount, decimals)
        };

        Ok(VerifiedPayment {
            tx_hash: tx_hash.to_string(),
            from: matched.from.clone(),
            to: treasury.to_string(),
            asset: asset.to_string(),
            amount_human: amount_raw as f64 / self.config.payment_scale() as f64,
            amount_raw,
            mock: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::FixtureChainReader;
    use serde_json::json;

    fn cfg() -> CoreConfig {
        CoreConfig {
            treasury_address: Some("EQtreasury".into()),
            payment_asset: Some("EQusdt".into()),
            ..Default::default()
        }
    }

    fn reader_with(amount: serde_json::Value) -> FixtureChainReader {
        let mut reader = FixtureChainReader::new();
        reader.insert(
            "tx1",
            json!({"actions": [{"type": "JettonTransfer",
                "sender": "EQpayer", "recipient": "EQtreasury",
                "amount": amount, "jetton": {"address": "EQusdt"}}]}),
        );
        reader
    }

    #[test]
    fn configuration_gaps_have_distinct_reasons() {
        let reader = FixtureChainReader::new();
        let mut config = cfg();
        config.treasury_address = None;
        let v = PaymentVerifier::new(&config, &reader);
        assert_eq!(v.verify("tx1", None), Err(VerifyFailure::MissingTreasury));

        let mut config = cfg();
        config.payment_asset = None;
        let v = PaymentVerifier::new(&config, &reader);
        assert_eq!(
            v.verify("tx1", None),
            Err(VerifyFailure::MissingPaymentAsset)
        );

        let config = cfg();
        let v = PaymentVerifier::new(&config, &reader);
        assert_eq!(v.verify("  ", None), Err(VerifyFailure::MissingTxHash));
        assert_eq!(v.verify("tx1", None), Err(VerifyFailure::TxNotFound));
    }

    #[test]
    fn raw_amount_within_one_unit_matches() {
        let config = cfg();
        let reader = reader_with(json!("30000001"));
        let v = PaymentVerifier::new(&config, &reader);
        let payment = v.verify("tx1", None).unwrap();
        assert_eq!(payment.amount_raw, 30_000_001);
        assert!(!payment.mock);
    }

    #[test]
    fn raw_amount_off_by_two_fails() {
        let config = cfg();
        let reader = reader_with(json!("29999998"));
        let v = PaymentVerifier::new(&config, &reader);
        match v.verify("tx1", None) {
            Err(VerifyFailure::NoMatchingTransfer { observed }) => {
                assert_eq!(observed.len(), 1)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decimal_amount_converts_and_matches() {
        let config = cfg();
        let reader = reader_with(json!(30.0));
        let v = PaymentVerifier::new(&config, &reader);
        let payment = v.verify("tx1", None).unwrap();
        assert_eq!(payment.amount_raw, 30_000_000);
        assert_eq!(payment.amount_human, 30.0);
    }

    #[test]
    fn payer_mismatch_reports_both_sides() {
        let config = cfg();
        let reader = reader_with(json!("30000000"));
        let v = PaymentVerifier::new(&config, &reader);
        assert_eq!(
            v.verify("tx1", Some("EQother")),
            Err(VerifyFailure::PayerMismatch {
                expected: "EQother".into(),
                observed: "EQpayer".into(),
            })
        );
        assert!(v.verify("tx1", Some("eqPAYER ")).is_ok());
    }

    #[test]
    fn no_transfers_is_distinct_from_no_match() {
        let config = cfg();
        let mut reader = FixtureChainReader::new();
        reader.insert("empty", json!({"actions": []}));
        reader.insert(
            "wrong_dest",
            json!({"actions": [{"type": "JettonTransfer",
                "sender": "EQpayer", "recipient": "EQelsewhere",
                "amount": "30000000", "jetton": {"address": "EQusdt"}}]}),
        );
        let v = PaymentVerifier::new(&config, &reader);
        assert_eq!(v.verify("empty", None), Err(VerifyFailure::NoTransfers));
        assert!(matches!(
            v.verify("wrong_dest", None),
            Err(VerifyFailure::NoMatchingTransfer { .. })
        ));
    }

    #[test]
    fn mock_hash_requires_explicit_flag() {
        let reader = FixtureChainReader::new();
        let config = cfg();
        let v = PaymentVerifier::new(&config, &reader);
        // Flag off: treated as a normal (unknown) hash.
        assert_eq!(v.verify("mock_abc", None), Err(VerifyFailure::TxNotFound));

        let config = CoreConfig {
            mock_payments: true,
            ..cfg()
        };
        let v = PaymentVerifier::new(&config, &reader);
        let payment = v.verify("mock_abc", None).unwrap();
        assert!(payment.mock);
        assert_eq!(payment.amount_raw, 30_000_000);
    }
}
