//! Payment-verification and referral-settlement core for a jetton-paid
//! membership program.
//!
//! A purchase request carries an on-chain transaction hash; [`verify`]
//! confirms the treasury actually received the required stable-jetton
//! amount, [`ledger`] activates the membership exactly once per hash,
//! [`referral`] settles two-level commissions, and [`claim`] gates the
//! monthly token/coin drip. [`ops`] ties the pieces into request-level
//! flows; everything outside this crate is a thin I/O shell.

pub mod chain;
pub mod claim;
pub mod config;
pub mod ledger;
pub mod ops;
pub mod referral;
pub mod rpc;
pub mod transfer;
pub mod verify;
