//! Membership Ledger: account state, the append-only transaction log,
//! and the uniqueness invariants that make crediting idempotent.
//!
//! The store is the single shared mutable resource of the core. Its
//! load-bearing guarantees are the unique inbound-payment hash (one
//! credit per on-chain payment, ever) and the secondary uniqueness of
//! wallet address, chat id, business id, and referral code. Accounts
//! are never deleted.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Months, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{CoreConfig, RawAmount};
use crate::transfer::Asset;

/// Store-assigned account key (the Mongo-ObjectId equivalent).
pub type AccountKey = u64;

#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("unknown account {0}")]
    UnknownAccount(AccountKey),
    #[error("inbound transaction hash already recorded: {0}")]
    DuplicateTxHash(String),
    #[error("package is still active, renewal not due")]
    RenewalNotDue,
    #[error("insufficient rewards balance: have {have}, want {want}")]
    InsufficientRewards { have: RawAmount, want: RawAmount },
}

/// All financial and referral state for one member.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub key: AccountKey,
    /// Business-facing id, e.g. "MBR12345". Assigned on first purchase.
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    /// External chat identifier (telegram-id equivalent).
    pub chat_id: Option<String>,
    pub wallet_address: Option<String>,
    pub joined_at: DateTime<Utc>,

    /// Globally unique, immutable share code.
    pub referral_code: String,
    pub referral_link: Option<String>,
    /// First-write-wins; never overwritten once set.
    pub referrer: Option<AccountKey>,
    pub direct_referrals: Vec<AccountKey>,
    pub indirect_referrals: Vec<AccountKey>,

    pub package_active: bool,
    pub package_expiry: Option<DateTime<Utc>>,
    /// Reward-token entitlement, human whole units. Reset per term.
    pub tokens_entitled: u64,
    pub tokens_claimed: u64,
    pub last_monthly_claim: Option<DateTime<Utc>>,

    // Legacy coin drip, kept for backward compatibility. Same cadence
    // rule as tokens, independent counters.
    pub coins: u64,
    pub coin_cap_total: u64,
    pub coin_cap_claimed: u64,

    /// Withdrawable stable-asset balance, raw base units.
    pub rewards_balance_raw: RawAmount,
    /// Lifetime informational earnings, raw base units.
    pub total_earnings_raw: RawAmount,
    /// Sticky: once true, never reverts.
    pub leadership: bool,
    pub l1_milestone_bonuses: u32,
    pub l2_milestone_bonuses: u32,
}

impl Account {
    fn new(key: AccountKey, referral_code: String, now: DateTime<Utc>, config: &CoreConfig) -> Self {
        Self {
            key,
            user_id: None,
            display_name: None,
            chat_id: None,
            wallet_address: None,
            joined_at: now,
            referral_code,
            referral_link: None,
            referrer: None,
            direct_referrals: Vec::new(),
            indirect_referrals: Vec::new(),
            package_active: false,
            package_expiry: None,
            tokens_entitled: config.tokens_per_package,
            tokens_claimed: 0,
            last_monthly_claim: None,
            coins: 0,
            coin_cap_total: config.coin_cap_total,
            coin_cap_claimed: 0,
            rewards_balance_raw: 0,
            total_earnings_raw: 0,
            leadership: false,
            l1_milestone_bonuses: 0,
            l2_milestone_bonuses: 0,
        }
    }

    /// Active flag alone is not enough: the flag may still read true
    /// after expiry.
    pub fn package_usable(&self, now: DateTime<Utc>) -> bool {
        self.package_active && self.package_expiry.map_or(false, |exp| exp > now)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    PackagePurchase,
    TokenClaim,
    RewardWithdrawal,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Success,
    Failed,
}

/// Append-only audit entry, one per attempted or completed payment or
/// payout.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TransactionRecord {
    pub tx_hash: String,
    pub kind: TxKind,
    pub asset: Asset,
    pub amount_raw: RawAmount,
    pub status: TxStatus,
    pub account: Option<AccountKey>,
    pub user_id: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub metadata: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Durable record of a commission distribution that failed after a
/// successful purchase. Replaces console-only logging; a retry job can
/// drain these.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingSettlement {
    pub referrer: AccountKey,
    pub buyer: AccountKey,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemberStore {
    accounts: BTreeMap<AccountKey, Account>,
    next_key: AccountKey,
    by_code: BTreeMap<String, AccountKey>,
    by_wallet: BTreeMap<String, AccountKey>,
    by_chat: BTreeMap<String, AccountKey>,
    by_user_id: BTreeMap<String, AccountKey>,
    transactions: Vec<TransactionRecord>,
    inbound_hashes: BTreeSet<String>,
    pending_settlements: Vec<PendingSettlement>,
}

impl MemberStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(&self, key: AccountKey) -> Result<&Account, LedgerError> {
        self.accounts
            .get(&key)
            .ok_or(LedgerError::UnknownAccount(key))
    }

    pub fn account_mut(&mut self, key: AccountKey) -> Result<&mut Account, LedgerError> {
        self.accounts
            .get_mut(&key)
            .ok_or(LedgerError::UnknownAccount(key))
    }

    pub fn find_by_wallet(&self, wallet: &str) -> Option<AccountKey> {
        self.by_wallet.get(wallet.trim()).copied()
    }

    pub fn find_by_chat(&self, chat_id: &str) -> Option<AccountKey> {
        self.by_chat.get(chat_id.trim()).copied()
    }

    pub fn find_by_user_id(&self, user_id: &str) -> Option<AccountKey> {
        self.by_user_id.get(user_id.trim()).copied()
    }

    pub fn find_by_code(&self, code: &str) -> Option<AccountKey> {
        self.by_code.get(code.trim()).copied()
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn transactions(&self) -> &[TransactionRecord] {
        &self.transactions
    }

    pub fn pending_settlements(&self) -> &[PendingSettlement] {
        &self.pending_settlements
    }

    pub fn has_inbound_hash(&self, tx_hash: &str) -> bool {
        self.inbound_hashes.contains(tx_hash)
    }

    fn fresh_referral_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 8];
            rng.fill(&mut bytes);
            let code = hex::encode(bytes).to_uppercase();
            if !self.by_code.contains_key(&code) {
                return code;
            }
        }
    }

    fn fresh_user_id(&self, prefix: &str) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let candidate = format!("{}{}", prefix, rng.gen_range(10_000..100_000));
            if !self.by_user_id.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Look up by wallet first, then by chat id; create a fresh inactive
    /// account when neither matches. Newly supplied identity fields are
    /// filled in on an existing account but never overwrite set ones.
    pub fn create_or_find(
        &mut self,
        wallet: Option<&str>,
        chat_id: Option<&str>,
        display_name: Option<&str>,
        now: DateTime<Utc>,
        config: &CoreConfig,
    ) -> AccountKey {
        let existing = wallet
            .and_then(|w| self.find_by_wallet(w))
            .or_else(|| chat_id.and_then(|c| self.find_by_chat(c)));

        let key = match existing {
            Some(key) => key,
            None => {
                let key = self.next_key;
                self.next_key += 1;
                let code = self.fresh_referral_code();
                self.by_code.insert(code.clone(), key);
                self.accounts
                    .insert(key, Account::new(key, code, now, config));
                key
            }
        };

        // Index updates stay in lockstep with the account fields.
        if let Some(wallet) = wallet.map(str::trim).filter(|w| !w.is_empty()) {
            if self.accounts[&key].wallet_address.is_none() {
                self.by_wallet.insert(wallet.to_string(), key);
                if let Some(account) = self.accounts.get_mut(&key) {
                    account.wallet_address = Some(wallet.to_string());
                }
            }
        }
        if let Some(chat) = chat_id.map(str::trim).filter(|c| !c.is_empty()) {
            if self.accounts[&key].chat_id.is_none() {
                self.by_chat.insert(chat.to_string(), key);
                if let Some(account) = self.accounts.get_mut(&key) {
                    account.chat_id = Some(chat.to_string());
                }
            }
        }
        if let Some(name) = display_name.filter(|n| !n.is_empty()) {
            if let Some(account) = self.accounts.get_mut(&key) {
                if account.display_name.as_deref() != Some(name) {
                    account.display_name = Some(name.to_string());
                }
            }
        }
        key
    }

    /// Assign the business user id if the account does not have one yet.
    pub fn ensure_user_id(
        &mut self,
        key: AccountKey,
        config: &CoreConfig,
    ) -> Result<String, LedgerError> {
        if let Some(id) = &self.account(key)?.user_id {
            return Ok(id.clone());
        }
        let id = self.fresh_user_id(&config.user_id_prefix);
        self.by_user_id.insert(id.clone(), key);
        self.account_mut(key)?.user_id = Some(id.clone());
        Ok(id)
    }

    /// Link `key` under the account owning `presented_code`, first-write-
    /// wins. Self-referral and unknown codes are ignored silently.
    /// Returns the linked referrer, whether linked now or earlier.
    pub fn link_referrer(
        &mut self,
        key: AccountKey,
        presented_code: Option<&str>,
    ) -> Result<Option<AccountKey>, LedgerError> {
        if let Some(existing) = self.account(key)?.referrer {
            return Ok(Some(existing));
        }
        let code = match presented_code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => code,
            None => return Ok(None),
        };
        let referrer_key = match self.find_by_code(code) {
            Some(r) if r != key => r,
            _ => return Ok(None),
        };
        self.account_mut(key)?.referrer = Some(referrer_key);
        Ok(Some(referrer_key))
    }

    fn reset_entitlement(account: &mut Account, now: DateTime<Utc>, config: &CoreConfig) {
        account.package_active = true;
        account.package_expiry = Some(add_months(now, config.package_months));
        account.tokens_entitled = config.tokens_per_package;
        account.tokens_claimed = 0;
    }

    /// Activate the package for the configured term, resetting the token
    /// entitlement and storing the shareable referral link.
    pub fn activate_package(
        &mut self,
        key: AccountKey,
        presented_code: Option<&str>,
        now: DateTime<Utc>,
        config: &CoreConfig,
    ) -> Result<(), LedgerError> {
        self.link_referrer(key, presented_code)?;
        let link = config.referral_link(&self.account(key)?.referral_code);
        let account = self.account_mut(key)?;
        Self::reset_entitlement(account, now, config);
        account.referral_link = Some(link);
        Ok(())
    }

    /// Renewal is rejected while the current term is still usable;
    /// otherwise it re-runs the activation resets and clears the claim
    /// timer so the new term gets a fresh monthly cadence.
    pub fn renew_package(
        &mut self,
        key: AccountKey,
        now: DateTime<Utc>,
        config: &CoreConfig,
    ) -> Result<(), LedgerError> {
        if self.account(key)?.package_usable(now) {
            return Err(LedgerError::RenewalNotDue);
        }
        let account = self.account_mut(key)?;
        Self::reset_entitlement(account, now, config);
        account.last_monthly_claim = None;
        Ok(())
    }

    /// Credit a referral commission: withdrawable balance plus the
    /// informational lifetime total.
    pub fn credit_rewards(
        &mut self,
        key: AccountKey,
        amount_raw: RawAmount,
    ) -> Result<(), LedgerError> {
        let account = self.account_mut(key)?;
        account.rewards_balance_raw = account.rewards_balance_raw.saturating_add(amount_raw);
        account.total_earnings_raw = account.total_earnings_raw.saturating_add(amount_raw);
        Ok(())
    }

    pub fn debit_rewards(
        &mut self,
        key: AccountKey,
        amount_raw: RawAmount,
    ) -> Result<(), LedgerError> {
        let account = self.account_mut(key)?;
        if account.rewards_balance_raw < amount_raw {
            return Err(LedgerError::InsufficientRewards {
                have: account.rewards_balance_raw,
                want: amount_raw,
            });
        }
        account.rewards_balance_raw -= amount_raw;
        Ok(())
    }

    /// Record an inbound payment. The hash is globally unique — a second
    /// record for the same hash is refused, which is the double-credit
    /// backstop.
    pub fn record_inbound(&mut self, record: TransactionRecord) -> Result<(), LedgerError> {
        if self.inbound_hashes.contains(&record.tx_hash) {
            return Err(LedgerError::DuplicateTxHash(record.tx_hash));
        }
        self.inbound_hashes.insert(record.tx_hash.clone());
        self.transactions.push(record);
        Ok(())
    }

    /// Record an outbound payout (hash generated or chain-returned, no
    /// uniqueness requirement of our own).
    pub fn record_outbound(&mut self, record: TransactionRecord) {
        self.transactions.push(record);
    }

    /// Record a failed verification attempt. Failures do not reserve the
    /// hash — a payer may retry once the underlying problem is fixed,
    /// and only a successful credit locks the hash for good.
    pub fn record_failed_attempt(&mut self, record: TransactionRecord) {
        self.transactions.push(record);
    }

    pub fn record_pending_settlement(&mut self, record: PendingSettlement) {
        self.pending_settlements.push(record);
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            next_key: self.next_key,
            accounts: self.accounts.values().cloned().collect(),
            transactions: self.transactions.clone(),
            pending_settlements: self.pending_settlements.clone(),
            merkle_root: hex::encode(self.merkle_root()),
        }
    }

    /// Sha256 merkle root over the accounts' financial state; lets an
    /// operator compare two store files cheaply.
    pub fn merkle_root(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::new();
        for account in self.accounts.values() {
            let mut hasher = Sha256::new();
            hasher.update(b"acct");
            hasher.update(account.key.to_le_bytes());
            hasher.update(account.referral_code.as_bytes());
            hasher.update(account.rewards_balance_raw.to_le_bytes());
            hasher.update(account.total_earnings_raw.to_le_bytes());
            hasher.update(account.tokens_claimed.to_le_bytes());
            hasher.update(account.coin_cap_claimed.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        for record in &self.transactions {
            let mut hasher = Sha256::new();
            hasher.update(b"txn");
            hasher.update(record.tx_hash.as_bytes());
            hasher.update(record.amount_raw.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        build_merkle(leaves)
    }
}

/// Serializable image of the whole store. Indexes are derived state and
/// get rebuilt on load.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoreSnapshot {
    pub next_key: AccountKey,
    pub accounts: Vec<Account>,
    pub transactions: Vec<TransactionRecord>,
    pub pending_settlements: Vec<PendingSettlement>,
    pub merkle_root: String,
}

impl From<StoreSnapshot> for MemberStore {
    fn from(snapshot: StoreSnapshot) -> Self {
        let mut store = MemberStore {
            next_key: snapshot.next_key,
            transactions: snapshot.transactions,
            pending_settlements: snapshot.pending_settlements,
            ..Default::default()
        };
        for record in &store.transactions {
            if matches!(record.kind, TxKind::PackagePurchase)
                && matches!(record.status, TxStatus::Success)
            {
                store.inbound_hashes.insert(record.tx_hash.clone());
            }
        }
        for account in snapshot.accounts {
            let key = account.key;
            store.by_code.insert(account.referral_code.clone(), key);
            if let Some(w) = &account.wallet_address {
                store.by_wallet.insert(w.clone(), key);
            }
            if let Some(c) = &account.chat_id {
                store.by_chat.insert(c.clone(), key);
            }
            if let Some(u) = &account.user_id {
                store.by_user_id.insert(u.clone(), key);
            }
            store.next_key = store.next_key.max(key + 1);
            store.accounts.insert(key, account);
        }
        store
    }
}

/// Saturating calendar-month addition.
pub fn add_months(t: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    t.checked_add_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"refcore-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}
