//! Monthly Claim Scheduler: cadence gate plus pro-rated drip sizing for
//! the token entitlement and the legacy coin cap.
//!
//! Cadence is calendar-month based: the whole-month difference between
//! now and the last claim must be at least 1. Day-of-month is ignored
//! on purpose — a claim on Jan 31 followed by one on Feb 1 crosses a
//! month boundary. This is not a 30-day rolling window.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CoreConfig;
use crate::ledger::{add_months, Account, AccountKey, LedgerError, MemberStore};
use crate::transfer::{Asset, TransferFailure, TransferService};

#[derive(Debug, Error, PartialEq)]
pub enum ClaimFailure {
    #[error("monthly claim not available yet")]
    TooSoon {
        next_eligible: Option<DateTime<Utc>>,
    },
    #[error("nothing remaining to claim")]
    NothingRemaining,
    #[error("package not active")]
    PackageInactive,
    #[error("package expired")]
    PackageExpired,
    #[error("account has no wallet address to receive the claim")]
    MissingWallet,
    #[error(transparent)]
    Transfer(#[from] TransferFailure),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Claim window report for one drip track.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClaimStatus {
    pub can_claim: bool,
    /// Amount claimable right now (zero when gated).
    pub base: u64,
    pub remaining: u64,
    pub total_limit: u64,
    pub claimed_so_far: u64,
    pub last_claim: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TokenClaim {
    pub claimed: u64,
    pub tx_hash: String,
    pub remaining: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CoinClaim {
    pub claimed: u64,
    pub coins: u64,
    pub remaining: u64,
}

/// Whole calendar months between two instants, day-of-month ignored.
fn months_between(last: DateTime<Utc>, now: DateTime<Utc>) -> i32 {
    (now.year() - last.year()) * 12 + (now.month() as i32 - last.month() as i32)
}

fn cadence_open(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(last) => months_between(last, now) >= 1,
    }
}

/// Per-period drip target: the cap spread over the package term,
/// rounded up.
fn period_target(total_limit: u64, months: u32) -> u64 {
    let months = months.max(1) as u64;
    total_limit.div_ceil(months)
}

fn status_for(
    total_limit: u64,
    claimed_so_far: u64,
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &CoreConfig,
) -> ClaimStatus {
    let remaining = total_limit.saturating_sub(claimed_so_far);
    let can_claim = cadence_open(last, now) && remaining > 0;
    let base = if can_claim {
        period_target(total_limit, config.package_months).min(remaining)
    } else {
        0
    };
    ClaimStatus {
        can_claim,
        base,
        remaining,
        total_limit,
        claimed_so_far,
        last_claim: last,
    }
}

pub fn token_status(account: &Account, now: DateTime<Utc>, config: &CoreConfig) -> ClaimStatus {
    status_for(
        account.tokens_entitled,
        account.tokens_claimed,
        account.last_monthly_claim,
        now,
        config,
    )
}

pub fn coin_status(account: &Account, now: DateTime<Utc>, config: &CoreConfig) -> ClaimStatus {
    status_for(
        account.coin_cap_total,
        account.coin_cap_claimed,
        account.last_monthly_claim,
        now,
        config,
    )
}

fn gate(
    total_limit: u64,
    claimed_so_far: u64,
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &CoreConfig,
) -> Result<u64, ClaimFailure> {
    if !cadence_open(last, now) {
        return Err(ClaimFailure::TooSoon {
            next_eligible: last.map(|l| add_months(l, 1)),
        });
    }
    let remaining = total_limit.saturating_sub(claimed_so_far);
    if remaining == 0 {
        return Err(ClaimFailure::NothingRemaining);
    }
    Ok(period_target(total_limit, config.package_months).min(remaining))
}

/// Claim this month's token drip: gate, move the tokens on chain, then
/// update counters. A failed transfer fails the claim as a whole — no
/// counter moves unless the tokens did.
pub fn claim_tokens(
    store: &mut MemberStore,
    key: AccountKey,
    now: DateTime<Utc>,
    transfers: &TransferService,
    config: &CoreConfig,
) -> Result<TokenClaim, ClaimFailure> {
    let (amount, wallet) = {
        let account = store.account(key)?;
        if !account.package_active {
            return Err(ClaimFailure::PackageInactive);
        }
        if !account.package_usable(now) {
            return Err(ClaimFailure::PackageExpired);
        }
        let amount = gate(
            account.tokens_entitled,
            account.tokens_claimed,
            account.last_monthly_claim,
            now,
            config,
        )?;
        let wallet = account
            .wallet_address
            .clone()
            .ok_or(ClaimFailure::MissingWallet)?;
        (amount, wallet)
    };

    let receipt = transfers.send(Asset::Reward, &wallet, amount as f64)?;

    let account = store.account_mut(key)?;
    account.tokens_claimed += amount;
    account.last_monthly_claim = Some(now);
    let remaining = account.tokens_entitled.saturating_sub(account.tokens_claimed);

    Ok(TokenClaim {
        claimed: amount,
        tx_hash: receipt.tx_hash,
        remaining,
    })
}

/// Claim this month's legacy coin drip. Coins live inside the ledger,
/// so no transfer is involved.
pub fn claim_coins(
    store: &mut MemberStore,
    key: AccountKey,
    now: DateTime<Utc>,
    config: &CoreConfig,
) -> Result<CoinClaim, ClaimFailure> {
    let amount = {
        let account = store.account(key)?;
        gate(
            account.coin_cap_total,
            account.coin_cap_claimed,
            account.last_monthly_claim,
            now,
            config,
        )?
    };

    let account = store.account_mut(key)?;
    account.coins += amount;
    account.coin_cap_claimed += amount;
    account.last_monthly_claim = Some(now);
    let remaining = account.coin_cap_total.saturating_sub(account.coin_cap_claimed);

    Ok(CoinClaim {
        claimed: amount,
        coins: account.coins,
        remaining,
    })
}
