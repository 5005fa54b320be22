//! Outbound Transfer Service: initiates jetton payouts for reward
//! withdrawals and monthly token claims.
//!
//! Three modes: `disabled` hard-stops every payout, `simulate` fabricates
//! a tagged hash without touching the chain, `live` signs a transfer
//! envelope with the held ed25519 key and submits it over RPC. A failed
//! live submission never reports success — callers must leave their
//! counters untouched when this module errors.

use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

use crate::config::{CoreConfig, RawAmount};
use crate::rpc;

/// The two fungible assets the core moves around.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Asset {
    /// Stable payment asset (purchases in, reward withdrawals out).
    Stable,
    /// Membership reward token (monthly claims out).
    Reward,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    Disabled,
    #[default]
    Simulate,
    Live,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TransferReceipt {
    pub tx_hash: String,
    pub amount_raw: RawAmount,
}

#[derive(Debug, Error, PartialEq)]
pub enum TransferFailure {
    #[error("missing destination address")]
    MissingDestination,
    #[error("amount must be finite and positive")]
    InvalidAmount,
    #[error("asset contract address is not configured")]
    MissingAssetContract,
    #[error("transfers_disabled")]
    Disabled,
    #[error("rpc endpoint is not configured")]
    MissingRpcEndpoint,
    #[error("transfer signer seed is not configured")]
    MissingSignerSeed,
    #[error("transfer signer seed is not a 32-byte hex string")]
    InvalidSignerSeed,
    #[error("transfer submission failed: {0}")]
    Submission(String),
}

pub struct TransferService {
    mode: TransferMode,
    stable_contract: Option<String>,
    stable_decimals: u32,
    reward_contract: Option<String>,
    reward_decimals: u32,
    rpc_endpoint: Option<String>,
    rpc_api_key: Option<String>,
    signer_seed_hex: Option<String>,
}

impl TransferService {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            mode: config.transfer_mode,
            stable_contract: config.payment_asset.clone(),
            stable_decimals: config.payment_decimals,
            reward_contract: config.reward_asset.clone(),
            reward_decimals: config.reward_decimals,
            rpc_endpoint: config.rpc_endpoint.clone(),
            rpc_api_key: config.rpc_api_key.clone(),
            signer_seed_hex: config.signer_seed_hex.clone(),
        }
    }

    fn asset_params(&self, asset: Asset) -> (Option<&str>, u32) {
        match asset {
            Asset::Stable => (self.stable_contract.as_deref(), self.stable_decimals),
            Asset::Reward => (self.reward_contract.as_deref(), self.reward_decimals),
        }
    }

    /// Send `human_amount` of `asset` to `to`. The amount is converted
    /// to base units with the asset's decimals, rounded to the nearest
    /// integer unit.
    pub fn send(
        &self,
        asset: Asset,
        to: &str,
        human_amount: f64,
    ) -> Result<TransferReceipt, TransferFailure> {
        if to.trim().is_empty() {
            return Err(TransferFailure::MissingDestination);
        }
        if !human_amount.is_finite() || human_amount <= 0.0 {
            return Err(TransferFailure::InvalidAmount);
        }
        let (contract, decimals) = self.asset_params(asset);
        let contract = contract.ok_or(TransferFailure::MissingAssetContract)?;
        let amount_raw = (human_amount * 10f64.powi(decimals as i32)).round() as RawAmount;

        match self.mode {
            TransferMode::Disabled => Err(TransferFailure::Disabled),
            TransferMode::Simulate => Ok(TransferReceipt {
                tx_hash: simulated_hash(),
                amount_raw,
            }),
            TransferMode::Live => self.submit_live(contract, to.trim(), amount_raw),
        }
    }

    fn submit_live(
        &self,
        contract: &str,
        to: &str,
        amount_raw: RawAmount,
    ) -> Result<TransferReceipt, TransferFailure> {
        let endpoint = self
            .rpc_endpoint
            .as_deref()
            .ok_or(TransferFailure::MissingRpcEndpoint)?;
        let seed_hex = self
            .signer_seed_hex
            .as_deref()
            .ok_or(TransferFailure::MissingSignerSeed)?;

        let mut seed = hex::decode(seed_hex.trim()).map_err(|_| TransferFailure::InvalidSignerSeed)?;
        if seed.len() != 32 {
            seed.zeroize();
            return Err(TransferFailure::InvalidSignerSeed);
        }
        let mut seed_bytes = [0u8; 32];
        seed_bytes.copy_from_slice(&seed);
        seed.zeroize();
        let signing_key = SigningKey::from_bytes(&seed_bytes);
        seed_bytes.zeroize();

        let envelope = json!({
            "asset": contract,
            "to": to,
            "amount": amount_raw,
            "query_id": Utc::now().timestamp_millis(),
            "sender_pubkey": hex::encode(signing_key.verifying_key().as_bytes()),
        });
        let body = envelope.to_string();
        let signature = signing_key.sign(body.as_bytes());

        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        hasher.update(signature.to_bytes());
        let local_hash = hex::encode(hasher.finalize());

        use base64::{engine::general_purpose, Engine as _};
        let request = json!({
            "envelope": general_purpose::STANDARD.encode(body.as_bytes()),
            "signature": hex::encode(signature.to_bytes()),
        });

        let endpoint = format!("{}/v2/transfers", endpoint.trim_end_matches('/'));
        let response = rpc::post_json(&endpoint, self.rpc_api_key.as_deref(), &request)
            .map_err(TransferFailure::Submission)?;

        let tx_hash = response["hash"]
            .as_str()
            .map(str::to_string)
            .unwrap_or(local_hash);
        Ok(TransferReceipt {
            tx_hash,
            amount_raw,
        })
    }
}

fn simulated_hash() -> String {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    format!("sim_{}", hex::encode(bytes))
}
