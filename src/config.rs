use serde::{Deserialize, Serialize};

use crate::transfer::TransferMode;

/// Raw base units of a jetton (integer, scaled by the asset's decimals).
pub type RawAmount = u64;

/// Full configuration surface of the settlement core.
///
/// Addresses and key material are optional on purpose: a missing piece
/// fails the specific operation that needs it with its own reason, it
/// never crashes the process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Destination wallet that must receive the purchase payment.
    pub treasury_address: Option<String>,
    /// Jetton master of the accepted stable payment asset.
    pub payment_asset: Option<String>,
    /// Required purchase amount in raw base units of the payment asset.
    pub payment_amount_raw: RawAmount,
    pub payment_decimals: u32,
    /// Jetton master of the membership reward token.
    pub reward_asset: Option<String>,
    pub reward_decimals: u32,

    pub transfer_mode: TransferMode,
    /// Chain-indexing endpoint for transaction lookups (TonAPI-style).
    pub index_endpoint: Option<String>,
    pub index_api_key: Option<String>,
    /// RPC endpoint used to submit live outbound transfers.
    pub rpc_endpoint: Option<String>,
    pub rpc_api_key: Option<String>,
    /// Hex-encoded ed25519 seed for the live transfer signer. Never
    /// logged, never persisted by the core.
    pub signer_seed_hex: Option<String>,

    /// Level-1 commission, basis points of the package price.
    pub l1_bps: u64,
    /// Level-2 commission, basis points of the package price.
    pub l2_bps: u64,
    /// Extra commission for leaders, basis points of the package price.
    pub leadership_bonus_bps: u64,
    /// Direct-referral count that flips the sticky leadership flag.
    pub leadership_threshold: usize,

    /// Package term in calendar months.
    pub package_months: u32,
    /// Reward tokens granted per purchase, human whole units.
    pub tokens_per_package: u64,
    /// Legacy coin cap granted per account, human whole units.
    pub coin_cap_total: u64,

    /// Base URL for shareable referral links.
    pub app_url: String,
    /// Prefix of generated business user ids, e.g. "MBR12345".
    pub user_id_prefix: String,

    /// Accept `mock_`-prefixed hashes without contacting the chain.
    /// Testing only; must stay off in a production posture.
    pub mock_payments: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            treasury_address: None,
            payment_asset: None,
            payment_amount_raw: 30_000_000, // 30 USDT at 6 decimals
            payment_decimals: 6,
            reward_asset: None,
            reward_decimals: 9,
            transfer_mode: TransferMode::Simulate,
            index_endpoint: None,
            index_api_key: None,
            rpc_endpoint: None,
            rpc_api_key: None,
            signer_seed_hex: None,
            l1_bps: 2_000,
            l2_bps: 1_000,
            leadership_bonus_bps: 500,
            leadership_threshold: 5,
            package_months: 12,
            tokens_per_package: 300,
            coin_cap_total: 300,
            app_url: "https://example.com".to_string(),
            user_id_prefix: "MBR".to_string(),
            mock_payments: false,
        }
    }
}

impl CoreConfig {
    /// 10^decimals for the payment asset.
    pub fn payment_scale(&self) -> u64 {
        10u64.pow(self.payment_decimals)
    }

    /// Required purchase amount in human units.
    pub fn payment_amount_human(&self) -> f64 {
        self.payment_amount_raw as f64 / self.payment_scale() as f64
    }

    pub fn referral_link(&self, code: &str) -> String {
        format!("{}/?ref={}", self.app_url.trim_end_matches('/'), code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_constants() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.payment_amount_raw, 30_000_000);
        assert_eq!(cfg.payment_amount_human(), 30.0);
        assert_eq!(cfg.l1_bps, 2_000);
        assert_eq!(cfg.leadership_threshold, 5);
        assert!(!cfg.mock_payments);
    }

    #[test]
    fn referral_link_handles_trailing_slash() {
        let cfg = CoreConfig {
            app_url: "https://example.com/".into(),
            ..Default::default()
        };
        assert_eq!(cfg.referral_link("ABCD"), "https://example.com/?ref=ABCD");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: CoreConfig =
            serde_json::from_str(r#"{"treasury_address":"EQtreasury","l1_bps":1500}"#).unwrap();
        assert_eq!(cfg.treasury_address.as_deref(), Some("EQtreasury"));
        assert_eq!(cfg.l1_bps, 1_500);
        assert_eq!(cfg.package_months, 12);
    }
}
