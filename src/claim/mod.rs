use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    chain::{PayoutError, TokenPayer},
    ledger::{Amount, LedgerError, TokenScale},
    locks::WalletLocks,
    store::{LedgerStore, StoreError},
    vesting::VestingStrategy,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClaimRequest {
    #[serde(default)]
    pub wallet: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClaimReceipt {
    pub tx: String,
    /// UI units, after truncation.
    pub amount: f64,
    pub amount_units: Amount,
    pub created_recipient_account: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("missing wallet")]
    MissingWallet,
    #[error("user not found")]
    UnknownUser,
    #[error("nothing to claim")]
    NothingToClaim,
    #[error("accumulated {accumulated} is below the minimum claim of {minimum}")]
    BelowMinimum { accumulated: String, minimum: String },
    #[error(transparent)]
    Payout(#[from] PayoutError),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl ClaimError {
    pub fn status(&self) -> u16 {
        match self {
            ClaimError::Payout(_) | ClaimError::Store(_) => 500,
            _ => 400,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClaimPolicy {
    pub scale: TokenScale,
    pub strategy: VestingStrategy,
    pub min_claim: Amount,
    pub payout_precision: u8,
}

/// Reserve-then-send payouts, one claim per wallet at a time.
pub struct ClaimService<S, T> {
    store: Arc<S>,
    payer: Arc<T>,
    locks: WalletLocks,
    policy: ClaimPolicy,
}

impl<S, T> Clone for ClaimService<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            payer: self.payer.clone(),
            locks: self.locks.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<S: LedgerStore, T: TokenPayer> ClaimService<S, T> {
    pub fn new(store: Arc<S>, payer: Arc<T>, policy: ClaimPolicy) -> Self {
        Self {
            store,
            payer,
            locks: WalletLocks::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &ClaimPolicy {
        &self.policy
    }

    pub async fn claim(&self, request: &ClaimRequest) -> Result<ClaimReceipt, ClaimError> {
        self.claim_at(request, Utc::now()).await
    }

    pub async fn claim_at(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<ClaimReceipt, ClaimError> {
        let wallet = match request.wallet.as_deref().map(str::trim) {
            Some(w) if !w.is_empty() => w,
            _ => return Err(ClaimError::MissingWallet),
        };
        let _guard = self.locks.acquire(wallet).await;
        let scale = self.policy.scale;

        let user = self
            .store
            .user(wallet)
            .await?
            .ok_or(ClaimError::UnknownUser)?;
        if user.locked_reward == 0 {
            return Err(ClaimError::NothingToClaim);
        }
        let strategy = self.policy.strategy;
        let sweeping = strategy.sweeps(&user);
        let amount = if sweeping {
            user.locked_reward
        } else {
            scale.truncate(strategy.releasable(&user, now), self.policy.payout_precision)
        };
        if amount == 0 || (!sweeping && amount < self.policy.min_claim) {
            return Err(ClaimError::BelowMinimum {
                accumulated: scale.format(amount),
                minimum: scale.format(self.policy.min_claim),
            });
        }

        let reservation = match self.store.reserve_claim(wallet, amount, now).await {
            Ok(reservation) => reservation,
            Err(StoreError::Ledger(LedgerError::InsufficientLocked { .. })) => {
                return Err(ClaimError::NothingToClaim)
            }
            Err(err) => return Err(err.into()),
        };

        match self.payer.pay(wallet, amount).await {
            Ok(receipt) => {
                info!(
                    wallet,
                    amount = %scale.format(amount),
                    strategy = self.policy.strategy.name(),
                    tx = %receipt.signature,
                    "claim paid"
                );
                Ok(ClaimReceipt {
                    tx: receipt.signature,
                    amount: scale.to_ui(amount),
                    amount_units: amount,
                    created_recipient_account: receipt.created_recipient_account,
                })
            }
            Err(err) if err.definitely_unsent() => {
                warn!(wallet, amount, error = %err, "payout not sent, releasing reservation");
                if let Err(release) = self.store.release_claim(&reservation, Utc::now()).await {
                    error!(wallet, amount, error = %release, "release failed, ledger needs reconciliation");
                }
                Err(err.into())
            }
            Err(err) => {
                error!(
                    wallet,
                    amount,
                    reserved_at = %reservation.reserved_at,
                    error = %err,
                    "payout may have been broadcast, reservation kept for reconciliation"
                );
                Err(err.into())
            }
        }
    }
}
