//! Referral reward ledger for an SPL token: signed referral binding,
//! webhook-driven high-water-mark accrual and vested on-chain payouts.

pub mod accrual;
pub mod chain;
pub mod claim;
pub mod config;
pub mod http;
pub mod ledger;
pub mod locks;
pub mod oracle;
pub mod referral;
pub mod store;
pub mod vesting;
