//! Referral Settlement Engine: two-level commission distribution and
//! leadership handling, run once per newly-activated purchase.
//!
//! Level 1 is the buyer's direct referrer, level 2 the referrer's
//! referrer; nothing cascades past level 2. Leadership is sticky — the
//! flag is only ever checked upward, never re-evaluated down.

use serde::{Deserialize, Serialize};

use crate::config::{CoreConfig, RawAmount};
use crate::ledger::{AccountKey, LedgerError, MemberStore};

/// Commission level, for audit output.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Level {
    L1,
    L2,
}

/// One credit applied during a distribution.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RewardCredit {
    pub recipient: AccountKey,
    pub level: Level,
    /// Base commission, raw stable units.
    pub base_raw: RawAmount,
    /// Leadership bonus on top, raw stable units (zero for non-leaders).
    pub bonus_raw: RawAmount,
}

impl RewardCredit {
    pub fn total_raw(&self) -> RawAmount {
        self.base_raw + self.bonus_raw
    }
}

fn commission(price_raw: RawAmount, bps: u64) -> RawAmount {
    price_raw * bps / 10_000
}

fn push_unique(list: &mut Vec<AccountKey>, key: AccountKey) {
    if !list.contains(&key) {
        list.push(key);
    }
}

/// Settle commissions for `buyer`'s activation under `referrer`.
///
/// Updates referral sets idempotently, credits L1 (and L2 when present)
/// with base + leadership bonus, and promotes leadership when the
/// direct-referral count reaches the threshold. Errors only when an
/// account reference cannot be loaded — the caller treats that as
/// non-fatal for the purchase and records a pending settlement.
///
/// The whole beneficiary chain is resolved before any balance moves, so
/// an error leaves the ledger untouched and the recorded settlement can
/// be replayed without double-paying.
pub fn distribute(
    store: &mut MemberStore,
    referrer: AccountKey,
    buyer: AccountKey,
    config: &CoreConfig,
) -> Result<Vec<RewardCredit>, LedgerError> {
    let price = config.payment_amount_raw;
    let mut credits = Vec::new();

    if let Some(grand) = store.account(referrer)?.referrer {
        store.account(grand)?;
    }

    // Level 1.
    let l1_leader = {
        let account = store.account_mut(referrer)?;
        push_unique(&mut account.direct_referrals, buyer);
        account.leadership
    };
    let l1_credit = RewardCredit {
        recipient: referrer,
        level: Level::L1,
        base_raw: commission(price, config.l1_bps),
        bonus_raw: if l1_leader {
            commission(price, config.leadership_bonus_bps)
        } else {
            0
        },
    };
    store.credit_rewards(referrer, l1_credit.total_raw())?;
    promote_leadership(store, referrer, config)?;
    credits.push(l1_credit);

    // Level 2, when the referrer is itself referred. Distribution stops
    // here regardless of deeper ancestry.
    if let Some(grand) = store.account(referrer)?.referrer {
        let l2_leader = {
            let account = store.account_mut(grand)?;
            push_unique(&mut account.indirect_referrals, buyer);
            account.leadership
        };
        let l2_credit = RewardCredit {
            recipient: grand,
            level: Level::L2,
            base_raw: commission(price, config.l2_bps),
            bonus_raw: if l2_leader {
                commission(price, config.leadership_bonus_bps)
            } else {
                0
            },
        };
        store.credit_rewards(grand, l2_credit.total_raw())?;
        // Threshold check uses the direct set, never the indirect one.
        promote_leadership(store, grand, config)?;
        credits.push(l2_credit);
    }

    Ok(credits)
}

fn promote_leadership(
    store: &mut MemberStore,
    key: AccountKey,
    config: &CoreConfig,
) -> Result<(), LedgerError> {
    let account = store.account_mut(key)?;
    if !account.leadership && account.direct_referrals.len() >= config.leadership_threshold {
        account.leadership = true;
    }
    Ok(())
}
