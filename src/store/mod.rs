//! Narrow, atomic interface to the relational store that holds the ledger.
//!
//! Every method is a single atomic step on the backing store. Callers never
//! read a row, modify it locally and write it back; read-modify-write lives
//! behind these primitives (one mutex for [`MemoryStore`], one stored
//! procedure call for [`SupabaseStore`]).

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::ledger::{
    Amount, BindOutcome, ClaimReservation, Holding, HoldingUpdate, LedgerError, RecordOutcome,
    RewardRecord, TxSignature, UserRecord,
};

mod memory;
mod supabase;

pub use memory::MemoryStore;
pub use supabase::{SupabaseConfig, SupabaseStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected store response: {0}")]
    Decode(String),
    #[error("ledger lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub trait LedgerStore: Send + Sync + 'static {
    /// Records signatures in the processed log; returns only the ones not seen before.
    fn claim_signatures(
        &self,
        signatures: &[TxSignature],
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<TxSignature>, StoreError>> + Send;

    fn upsert_user(
        &self,
        wallet: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<UserRecord, StoreError>> + Send;

    fn user(&self, wallet: &str)
        -> impl Future<Output = Result<Option<UserRecord>, StoreError>> + Send;

    /// Adds `delta` to the holding and raises the high-water mark; `None` for unknown wallets.
    fn apply_holding_delta(
        &self,
        wallet: &str,
        delta: Holding,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<HoldingUpdate>, StoreError>> + Send;

    /// Audit insert plus referrer increments as one unit; a conflicting insert skips the increments.
    fn credit_referrer(
        &self,
        record: &RewardRecord,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<RecordOutcome, StoreError>> + Send;

    /// Clawback audit insert plus clamped decrement as one unit.
    fn debit_referrer(
        &self,
        record: &RewardRecord,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<RecordOutcome, StoreError>> + Send;

    fn bind_referrer(
        &self,
        wallet: &str,
        referrer: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<BindOutcome, StoreError>> + Send;

    fn reserve_claim(
        &self,
        wallet: &str,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<ClaimReservation, StoreError>> + Send;

    fn release_claim(
        &self,
        reservation: &ClaimReservation,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn leaderboard(&self, limit: usize)
        -> impl Future<Output = Result<Vec<UserRecord>, StoreError>> + Send;
}
