//! Request-level flows. Each function here is what an inbound HTTP or
//! bot request ultimately calls: verify, mutate the ledger, settle, and
//! record — in that order.
//!
//! Commission distribution is deliberately non-fatal to the purchase:
//! if settlement fails after the payment verified, the purchase stands
//! and a retryable pending-settlement record is written instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::chain::ChainReader;
use crate::claim::{self, ClaimFailure, ClaimStatus, CoinClaim, TokenClaim};
use crate::config::{CoreConfig, RawAmount};
use crate::ledger::{
    AccountKey, LedgerError, MemberStore, PendingSettlement, TransactionRecord, TxKind, TxStatus,
};
use crate::referral;
use crate::transfer::{Asset, TransferFailure, TransferService};
use crate::verify::{PaymentVerifier, VerifiedPayment, VerifyFailure};

#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    #[error("walletAddress or chatId is required")]
    MissingIdentity,
    #[error("account not found")]
    AccountNotFound,
    #[error("payment already credited for hash {0}")]
    AlreadyCredited(String),
    #[error("payment verification failed: {0}")]
    Verification(#[from] VerifyFailure),
    #[error("amount must be finite and positive")]
    InvalidAmount,
    #[error("missing destination wallet address")]
    MissingDestination,
    #[error(transparent)]
    Claim(#[from] ClaimFailure),
    #[error(transparent)]
    Transfer(#[from] TransferFailure),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub wallet_address: Option<String>,
    pub chat_id: Option<String>,
    pub tx_hash: String,
    pub referral_code: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PurchaseReceipt {
    pub user_id: String,
    pub referral_link: String,
    pub package_expiry: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RenewalReceipt {
    pub user_id: Option<String>,
    pub package_expiry: DateTime<Utc>,
    pub tokens_entitled: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WithdrawalReceipt {
    pub withdrawn: f64,
    pub tx_hash: String,
    pub balance: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Dashboard {
    pub user_id: Option<String>,
    pub wallet_address: Option<String>,
    pub referral_link: String,
    pub package_active: bool,
    pub package_expiry: Option<DateTime<Utc>>,
    pub tokens: ClaimStatus,
    pub coins: ClaimStatus,
    pub rewards_balance: f64,
    pub level1_count: usize,
    pub level2_count: usize,
}

/// The assembled settlement core. One instance per process; every
/// request-scoped flow borrows it mutably for its duration, which is
/// the per-account serialization point the storage layer would
/// otherwise have to provide.
pub struct Core<R: ChainReader> {
    pub config: CoreConfig,
    pub reader: R,
    pub transfers: TransferService,
    pub store: MemberStore,
}

impl<R: ChainReader> Core<R> {
    pub fn new(config: CoreConfig, reader: R, store: MemberStore) -> Self {
        let transfers = TransferService::from_config(&config);
        Self {
            config,
            reader,
            transfers,
            store,
        }
    }

    fn locate(&self, user_id: Option<&str>, wallet: Option<&str>) -> Result<AccountKey, CoreError> {
        user_id
            .and_then(|id| self.store.find_by_user_id(id))
            .or_else(|| wallet.and_then(|w| self.store.find_by_wallet(w)))
            .ok_or(CoreError::AccountNotFound)
    }

    fn purchase_record(
        &self,
        payment: &VerifiedPayment,
        status: TxStatus,
        account: Option<AccountKey>,
        user_id: Option<String>,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> TransactionRecord {
        TransactionRecord {
            tx_hash: payment.tx_hash.clone(),
            kind: TxKind::PackagePurchase,
            asset: Asset::Stable,
            amount_raw: payment.amount_raw,
            status,
            account,
            user_id,
            from_address: payment.from.clone(),
            to_address: Some(payment.to.clone()),
            metadata,
            recorded_at: now,
        }
    }

    /// Verify a purchase payment and activate (or re-activate) the
    /// buyer's package. At most one activation ever results per hash.
    pub fn purchase(
        &mut self,
        request: &PurchaseRequest,
        now: DateTime<Utc>,
    ) -> Result<PurchaseReceipt, CoreError> {
        let wallet = request.wallet_address.as_deref();
        let chat = request.chat_id.as_deref();
        if wallet.is_none() && chat.is_none() {
            return Err(CoreError::MissingIdentity);
        }
        if self.store.has_inbound_hash(request.tx_hash.trim()) {
            return Err(CoreError::AlreadyCredited(request.tx_hash.trim().into()));
        }

        let verifier = PaymentVerifier::new(&self.config, &self.reader);
        let metadata = json!({ "referral_code_presented": request.referral_code.clone() });
        let payment = match verifier.verify(&request.tx_hash, wallet) {
            Ok(payment) => payment,
            Err(failure) => {
                // Keep the failed attempt on the audit trail, then bail.
                self.store.record_failed_attempt(TransactionRecord {
                    tx_hash: request.tx_hash.trim().to_string(),
                    kind: TxKind::PackagePurchase,
                    asset: Asset::Stable,
                    amount_raw: self.config.payment_amount_raw,
                    status: TxStatus::Failed,
                    account: None,
                    user_id: None,
                    from_address: None,
                    to_address: self.config.treasury_address.clone(),
                    metadata: json!({
                        "referral_code_presented": request.referral_code.clone(),
                        "reason": failure.to_string(),
                    }),
                    recorded_at: now,
                });
                return Err(failure.into());
            }
        };

        let key = self.store.create_or_find(
            wallet,
            chat,
            request.display_name.as_deref(),
            now,
            &self.config,
        );
        let user_id = self.store.ensure_user_id(key, &self.config)?;
        self.store
            .activate_package(key, request.referral_code.as_deref(), now, &self.config)?;

        let record =
            self.purchase_record(&payment, TxStatus::Success, Some(key), Some(user_id), metadata, now);
        self.store.record_inbound(record)?;

        if let Some(referrer) = self.store.account(key)?.referrer {
            if let Err(failure) = referral::distribute(&mut self.store, referrer, key, &self.config)
            {
                self.store.record_pending_settlement(PendingSettlement {
                    referrer,
                    buyer: key,
                    reason: failure.to_string(),
                    recorded_at: now,
                });
            }
        }

        let account = self.store.account(key)?;
        Ok(PurchaseReceipt {
            user_id: account.user_id.clone().unwrap_or_default(),
            referral_link: account.referral_link.clone().unwrap_or_default(),
            package_expiry: account.package_expiry.unwrap_or(now),
        })
    }

    /// Verify a renewal payment and extend an expired membership.
    /// No commissions are distributed here.
    pub fn renew(
        &mut self,
        user_id: Option<&str>,
        wallet: Option<&str>,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<RenewalReceipt, CoreError> {
        if self.store.has_inbound_hash(tx_hash.trim()) {
            return Err(CoreError::AlreadyCredited(tx_hash.trim().into()));
        }
        let verifier = PaymentVerifier::new(&self.config, &self.reader);
        let payment = verifier.verify(tx_hash, wallet)?;

        let key = self.locate(user_id, wallet)?;
        self.store.renew_package(key, now, &self.config)?;

        let account_user_id = self.store.account(key)?.user_id.clone();
        let record = self.purchase_record(
            &payment,
            TxStatus::Success,
            Some(key),
            account_user_id.clone(),
            json!({ "renewal": true }),
            now,
        );
        self.store.record_inbound(record)?;

        let account = self.store.account(key)?;
        Ok(RenewalReceipt {
            user_id: account_user_id,
            package_expiry: account.package_expiry.unwrap_or(now),
            tokens_entitled: account.tokens_entitled,
        })
    }

    /// Claim this month's token drip and push it on chain.
    pub fn claim_tokens(
        &mut self,
        user_id: Option<&str>,
        wallet: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TokenClaim, CoreError> {
        let key = self.locate(user_id, wallet)?;
        let claim = claim::claim_tokens(&mut self.store, key, now, &self.transfers, &self.config)?;

        let account = self.store.account(key)?;
        let scale = 10u64.pow(self.config.reward_decimals);
        self.store.record_outbound(TransactionRecord {
            tx_hash: claim.tx_hash.clone(),
            kind: TxKind::TokenClaim,
            asset: Asset::Reward,
            amount_raw: claim.claimed * scale,
            status: TxStatus::Success,
            account: Some(key),
            user_id: account.user_id.clone(),
            from_address: None,
            to_address: account.wallet_address.clone(),
            metadata: json!({ "monthly": true }),
            recorded_at: now,
        });
        Ok(claim)
    }

    /// Claim this month's legacy coin drip (ledger-internal, no chain
    /// movement).
    pub fn claim_coins(
        &mut self,
        user_id: Option<&str>,
        wallet: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CoinClaim, CoreError> {
        let key = self.locate(user_id, wallet)?;
        Ok(claim::claim_coins(&mut self.store, key, now, &self.config)?)
    }

    /// Withdraw part of the stable rewards balance to a wallet. The
    /// balance moves only after the transfer reports success.
    pub fn withdraw(
        &mut self,
        user_id: &str,
        amount: f64,
        destination: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalReceipt, CoreError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(CoreError::InvalidAmount);
        }
        let key = self.locate(Some(user_id), None)?;
        let amount_raw: RawAmount =
            (amount * self.config.payment_scale() as f64).round() as RawAmount;

        let account = self.store.account(key)?;
        if account.rewards_balance_raw < amount_raw {
            return Err(LedgerError::InsufficientRewards {
                have: account.rewards_balance_raw,
                want: amount_raw,
            }
            .into());
        }
        let destination = destination
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .or_else(|| account.wallet_address.clone())
            .ok_or(CoreError::MissingDestination)?;

        let receipt = self.transfers.send(Asset::Stable, &destination, amount)?;
        self.store.debit_rewards(key, amount_raw)?;

        let account = self.store.account(key)?;
        self.store.record_outbound(TransactionRecord {
            tx_hash: receipt.tx_hash.clone(),
            kind: TxKind::RewardWithdrawal,
            asset: Asset::Stable,
            amount_raw,
            status: TxStatus::Success,
            account: Some(key),
            user_id: account.user_id.clone(),
            from_address: None,
            to_address: Some(destination),
            metadata: json!({ "requested_amount": amount }),
            recorded_at: now,
        });

        let balance_raw = self.store.account(key)?.rewards_balance_raw;
        Ok(WithdrawalReceipt {
            withdrawn: amount,
            tx_hash: receipt.tx_hash,
            balance: balance_raw as f64 / self.config.payment_scale() as f64,
        })
    }

    /// Profile/tokens/rewards/referrals snapshot. Looking up an unknown
    /// wallet lazily creates an inactive account so a referral link can
    /// be shared before the first purchase.
    pub fn dashboard(
        &mut self,
        user_id: Option<&str>,
        wallet: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Dashboard, CoreError> {
        let key = match self.locate(user_id, wallet) {
            Ok(key) => key,
            Err(CoreError::AccountNotFound) => match wallet {
                Some(wallet) => self
                    .store
                    .create_or_find(Some(wallet), None, None, now, &self.config),
                None => return Err(CoreError::AccountNotFound),
            },
            Err(other) => return Err(other),
        };

        let account = self.store.account(key)?;
        let referral_link = account
            .referral_link
            .clone()
            .unwrap_or_else(|| self.config.referral_link(&account.referral_code));
        Ok(Dashboard {
            user_id: account.user_id.clone(),
            wallet_address: account.wallet_address.clone(),
            referral_link,
            package_active: account.package_active,
            package_expiry: account.package_expiry,
            tokens: claim::token_status(account, now, &self.config),
            coins: claim::coin_status(account, now, &self.config),
            rewards_balance: account.rewards_balance_raw as f64
                / self.config.payment_scale() as f64,
            level1_count: account.direct_referrals.len(),
            level2_count: account.indirect_referrals.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::FixtureChainReader;
    use crate::transfer::TransferMode;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    fn config() -> CoreConfig {
        CoreConfig {
            treasury_address: Some("EQtreasury".into()),
            payment_asset: Some("EQusdt".into()),
            reward_asset: Some("EQiepr".into()),
            transfer_mode: TransferMode::Simulate,
            ..Default::default()
        }
    }

    fn payment_tx(hash: &str, payer: &str, reader: &mut FixtureChainReader) {
        reader.insert(
            hash,
            json!({"actions": [{"type": "JettonTransfer",
                "sender": payer, "recipient": "EQtreasury",
                "amount": "30000000", "jetton": {"address": "EQusdt"}}]}),
        );
    }

    fn core() -> Core<FixtureChainReader> {
        Core::new(config(), FixtureChainReader::new(), MemberStore::new())
    }

    fn buy(
        core: &mut Core<FixtureChainReader>,
        wallet: &str,
        hash: &str,
        code: Option<String>,
        when: DateTime<Utc>,
    ) -> Result<PurchaseReceipt, CoreError> {
        payment_tx(hash, wallet, &mut core.reader);
        core.purchase(
            &PurchaseRequest {
                wallet_address: Some(wallet.into()),
                tx_hash: hash.into(),
                referral_code: code,
                ..Default::default()
            },
            when,
        )
    }

    #[test]
    fn purchase_chain_settles_two_levels_only() {
        let mut core = core();
        let now = at(2024, 1, 10);

        let a = buy(&mut core, "EQa", "tx_a", None, now).unwrap();
        let a_code = code_of(&core, "EQa");
        buy(&mut core, "EQb", "tx_b", Some(a_code), now).unwrap();
        let b_code = code_of(&core, "EQb");
        buy(&mut core, "EQc", "tx_c", Some(b_code), now).unwrap();

        let key_a = core.store.find_by_wallet("EQa").unwrap();
        let key_b = core.store.find_by_wallet("EQb").unwrap();
        let key_c = core.store.find_by_wallet("EQc").unwrap();

        // B earned L1 on C (6 USDT) and nothing else; A earned L1 on B
        // (6 USDT) plus L2 on C (3 USDT).
        assert_eq!(
            core.store.account(key_b).unwrap().rewards_balance_raw,
            6_000_000
        );
        assert_eq!(
            core.store.account(key_a).unwrap().rewards_balance_raw,
            9_000_000
        );
        assert_eq!(core.store.account(key_c).unwrap().rewards_balance_raw, 0);
        assert!(core
            .store
            .account(key_a)
            .unwrap()
            .indirect_referrals
            .contains(&key_c));

        assert!(a.user_id.starts_with("MBR"));
        assert!(a.referral_link.contains("?ref="));
        assert!(core.store.pending_settlements().is_empty());
    }

    fn code_of(core: &Core<FixtureChainReader>, wallet: &str) -> String {
        let key = core.store.find_by_wallet(wallet).unwrap();
        core.store.account(key).unwrap().referral_code.clone()
    }

    #[test]
    fn same_hash_credits_at_most_once() {
        let mut core = core();
        let now = at(2024, 1, 10);
        buy(&mut core, "EQa", "tx_dup", None, now).unwrap();

        let again = core.purchase(
            &PurchaseRequest {
                wallet_address: Some("EQa".into()),
                tx_hash: "tx_dup".into(),
                ..Default::default()
            },
            now,
        );
        assert_eq!(again, Err(CoreError::AlreadyCredited("tx_dup".into())));
        let purchases = core
            .store
            .transactions()
            .iter()
            .filter(|t| t.kind == TxKind::PackagePurchase && t.status == TxStatus::Success)
            .count();
        assert_eq!(purchases, 1);
    }

    #[test]
    fn failed_verification_is_recorded_and_does_not_block_retry() {
        let mut core = core();
        let now = at(2024, 1, 10);

        // Hash unknown to the chain: verification fails, attempt logged.
        let missing = core.purchase(
            &PurchaseRequest {
                wallet_address: Some("EQa".into()),
                tx_hash: "tx_late".into(),
                ..Default::default()
            },
            now,
        );
        assert!(matches!(
            missing,
            Err(CoreError::Verification(VerifyFailure::TxNotFound))
        ));
        assert_eq!(core.store.transactions().len(), 1);
        assert_eq!(core.store.transactions()[0].status, TxStatus::Failed);

        // Once the indexer sees it, the same hash goes through.
        buy(&mut core, "EQa", "tx_late", None, now).unwrap();
        assert!(core.store.has_inbound_hash("tx_late"));
    }

    #[test]
    fn purchase_requires_some_identity() {
        let mut core = core();
        let err = core.purchase(
            &PurchaseRequest {
                tx_hash: "tx_x".into(),
                ..Default::default()
            },
            at(2024, 1, 1),
        );
        assert_eq!(err, Err(CoreError::MissingIdentity));
    }

    #[test]
    fn renewal_rejects_active_term_and_pays_no_commission() {
        let mut core = core();
        let now = at(2024, 1, 10);
        buy(&mut core, "EQa", "tx_a", None, now).unwrap();
        let a_code = code_of(&core, "EQa");
        buy(&mut core, "EQb", "tx_b", Some(a_code), now).unwrap();
        let key_a = core.store.find_by_wallet("EQa").unwrap();
        let balance_before = core.store.account(key_a).unwrap().rewards_balance_raw;

        payment_tx("tx_renew", "EQb", &mut core.reader);
        let early = core.renew(None, Some("EQb"), "tx_renew", at(2024, 6, 1));
        assert_eq!(early, Err(CoreError::Ledger(LedgerError::RenewalNotDue)));

        let later = at(2025, 2, 1);
        let receipt = core.renew(None, Some("EQb"), "tx_renew", later).unwrap();
        assert_eq!(receipt.tokens_entitled, 300);
        assert_eq!(
            core.store.account(key_a).unwrap().rewards_balance_raw,
            balance_before
        );
        let key_b = core.store.find_by_wallet("EQb").unwrap();
        assert_eq!(core.store.account(key_b).unwrap().last_monthly_claim, None);
    }

    #[test]
    fn token_claim_records_an_outbound_transaction() {
        let mut core = core();
        buy(&mut core, "EQa", "tx_a", None, at(2024, 1, 10)).unwrap();

        let claim = core
            .claim_tokens(None, Some("EQa"), at(2024, 2, 1))
            .unwrap();
        assert_eq!(claim.claimed, 25);
        let record = core
            .store
            .transactions()
            .iter()
            .find(|t| t.kind == TxKind::TokenClaim)
            .unwrap();
        assert_eq!(record.amount_raw, 25_000_000_000);
        assert_eq!(record.to_address.as_deref(), Some("EQa"));
    }

    #[test]
    fn withdrawal_moves_balance_after_transfer() {
        let mut core = core();
        let now = at(2024, 1, 10);
        buy(&mut core, "EQa", "tx_a", None, now).unwrap();
        let a_code = code_of(&core, "EQa");
        buy(&mut core, "EQb", "tx_b", Some(a_code), now).unwrap();

        let key_a = core.store.find_by_wallet("EQa").unwrap();
        let user_a = core.store.account(key_a).unwrap().user_id.clone().unwrap();

        let receipt = core.withdraw(&user_a, 4.0, None, now).unwrap();
        assert_eq!(receipt.withdrawn, 4.0);
        assert_eq!(receipt.balance, 2.0);
        assert!(receipt.tx_hash.starts_with("sim_"));

        let too_much = core.withdraw(&user_a, 50.0, None, now);
        assert!(matches!(
            too_much,
            Err(CoreError::Ledger(LedgerError::InsufficientRewards { .. }))
        ));
    }

    #[test]
    fn withdrawal_failure_keeps_the_balance() {
        let mut config = config();
        config.transfer_mode = TransferMode::Disabled;
        let mut core = Core::new(config, FixtureChainReader::new(), MemberStore::new());
        let now = at(2024, 1, 10);
        buy(&mut core, "EQa", "tx_a", None, now).unwrap();
        let a_code = code_of(&core, "EQa");
        buy(&mut core, "EQb", "tx_b", Some(a_code), now).unwrap();

        let key_a = core.store.find_by_wallet("EQa").unwrap();
        let user_a = core.store.account(key_a).unwrap().user_id.clone().unwrap();
        assert_eq!(
            core.withdraw(&user_a, 4.0, None, now),
            Err(CoreError::Transfer(TransferFailure::Disabled))
        );
        assert_eq!(
            core.store.account(key_a).unwrap().rewards_balance_raw,
            6_000_000
        );
    }

    #[test]
    fn dashboard_lazily_creates_inactive_accounts_by_wallet() {
        let mut core = core();
        let now = at(2024, 1, 10);

        let dash = core.dashboard(None, Some("EQnew"), now).unwrap();
        assert!(!dash.package_active);
        assert!(dash.user_id.is_none());
        assert!(dash.referral_link.contains("?ref="));
        assert_eq!(dash.tokens.total_limit, 300);
        assert_eq!(dash.coins.total_limit, 300);

        // By user id only, unknown: a hard not-found.
        assert_eq!(
            core.dashboard(Some("MBR00000"), None, now),
            Err(CoreError::AccountNotFound)
        );
    }

    #[test]
    fn dashboard_reports_both_drip_tracks() {
        let mut core = core();
        let now = at(2024, 1, 10);
        buy(&mut core, "EQa", "tx_a", None, now).unwrap();
        core.claim_coins(None, Some("EQa"), now).unwrap();

        let dash = core.dashboard(None, Some("EQa"), now).unwrap();
        assert_eq!(dash.coins.claimed_so_far, 25);
        assert_eq!(dash.coins.remaining, 275);
        // The shared cadence timestamp closes the month for both tracks.
        assert!(!dash.coins.can_claim);
        assert!(!dash.tokens.can_claim);
        assert_eq!(dash.tokens.claimed_so_far, 0);
    }

    #[test]
    fn settlement_failure_is_recorded_not_fatal() {
        let mut core = core();
        let now = at(2024, 1, 10);
        buy(&mut core, "EQa", "tx_a", None, now).unwrap();
        let a_code = code_of(&core, "EQa");

        // Pre-link the buyer to a referrer key that no longer resolves.
        payment_tx("tx_b", "EQb", &mut core.reader);
        let key_b =
            core.store
                .create_or_find(Some("EQb"), None, None, now, &core.config.clone());
        core.store.account_mut(key_b).unwrap().referrer = Some(777);

        let receipt = core.purchase(
            &PurchaseRequest {
                wallet_address: Some("EQb".into()),
                tx_hash: "tx_b".into(),
                referral_code: Some(a_code),
                ..Default::default()
            },
            now,
        );
        assert!(receipt.is_ok());
        assert_eq!(core.store.pending_settlements().len(), 1);
        assert_eq!(core.store.pending_settlements()[0].referrer, 777);
    }
}
