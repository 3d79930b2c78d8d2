use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod state;

pub use state::{LedgerSnapshot, LedgerState, SnapshotMetadata};

pub type Wallet = String;
pub type TxSignature = String;
/// Unsigned quantity of the tracked mint in base units.
pub type Amount = u64;
/// Signed quantity of the tracked mint in base units.
pub type Holding = i64;

pub const BPS_DENOMINATOR: u64 = 10_000;
/// Largest scale whose unit still fits a `u64`.
pub const MAX_DECIMALS: u8 = 18;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("unknown user {wallet}")]
    UnknownUser { wallet: Wallet },
    #[error("insufficient locked reward for {wallet}: have {available}, need {requested}")]
    InsufficientLocked {
        wallet: Wallet,
        available: Amount,
        requested: Amount,
    },
}

/// Fixed decimal scale of the tracked mint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenScale {
    decimals: u8,
}

impl TokenScale {
    /// Decimals beyond [`MAX_DECIMALS`] are clamped; configuration rejects them first.
    pub fn new(decimals: u8) -> Self {
        Self {
            decimals: decimals.min(MAX_DECIMALS),
        }
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn unit(&self) -> u64 {
        10u64.pow(self.decimals as u32)
    }

    /// Converts a UI amount (e.g. `1000.5`) to base units, rounding to the nearest unit.
    pub fn from_ui(&self, ui: f64) -> Option<Holding> {
        if !ui.is_finite() {
            return None;
        }
        let scaled = (ui * self.unit() as f64).round();
        if scaled.abs() >= i64::MAX as f64 {
            return None;
        }
        Some(scaled as Holding)
    }

    pub fn to_ui(&self, units: Amount) -> f64 {
        units as f64 / self.unit() as f64
    }

    pub fn signed_to_ui(&self, units: Holding) -> f64 {
        units as f64 / self.unit() as f64
    }

    pub fn usd_value(&self, units: Holding, price_usd: f64) -> f64 {
        self.signed_to_ui(units) * price_usd
    }

    /// Rounds `units` down to `precision` decimal places. Never rounds up.
    pub fn truncate(&self, units: Amount, precision: u8) -> Amount {
        if precision >= self.decimals {
            return units;
        }
        let step = 10u64.pow((self.decimals - precision) as u32);
        units - units % step
    }

    /// Formats base units with every decimal place, e.g. `12.345600`.
    pub fn format(&self, units: Amount) -> String {
        let unit = self.unit();
        if self.decimals == 0 {
            return units.to_string();
        }
        format!(
            "{}.{:0width$}",
            units / unit,
            units % unit,
            width = self.decimals as usize
        )
    }
}

pub fn apply_bps(amount: Amount, bps: u32) -> Amount {
    (amount as u128 * bps as u128 / BPS_DENOMINATOR as u128) as Amount
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub wallet: Wallet,
    #[serde(default)]
    pub referrer: Option<Wallet>,
    #[serde(default, alias = "pending_reward")]
    pub locked_reward: Amount,
    #[serde(default)]
    pub total_claimed: Amount,
    #[serde(default)]
    pub total_earned: Amount,
    #[serde(default)]
    pub net_mgt_holding: Holding,
    #[serde(default)]
    pub max_mgt_holding: Holding,
    #[serde(default)]
    pub team_volume: f64,
    #[serde(default)]
    pub referral_count: u32,
    #[serde(default)]
    pub last_vesting_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn new(wallet: Wallet, now: DateTime<Utc>) -> Self {
        Self {
            wallet,
            referrer: None,
            locked_reward: 0,
            total_claimed: 0,
            total_earned: 0,
            net_mgt_holding: 0,
            max_mgt_holding: 0,
            team_volume: 0.0,
            referral_count: 0,
            last_vesting_time: None,
            created_at: now,
        }
    }
}

/// Result of applying one net holding change to a wallet.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HoldingUpdate {
    pub wallet: Wallet,
    pub referrer: Option<Wallet>,
    pub previous_holding: Holding,
    pub previous_max: Holding,
    pub holding: Holding,
    pub max: Holding,
}

impl HoldingUpdate {
    /// Portion of the change that pushed the wallet past its previous peak.
    pub fn rewardable(&self) -> Amount {
        self.max.saturating_sub(self.previous_max).max(0) as Amount
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Reward,
    Clawback,
}

/// Append-only audit row, unique per (signature, buyer).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RewardRecord {
    pub signature: TxSignature,
    pub buyer: Wallet,
    pub referrer: Wallet,
    pub token_amount: Amount,
    pub reward_amount: Amount,
    pub usd_value: f64,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

impl RewardRecord {
    pub fn key(&self) -> (TxSignature, Wallet) {
        (self.signature.clone(), self.buyer.clone())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Audit row inserted; `amount` is what actually moved on the referrer's balance.
    Applied { amount: Amount },
    Duplicate,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BindOutcome {
    Bound,
    Unchanged,
    AlreadyBound { existing: Wallet },
    WouldCycle,
    SelfReferral,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimReservation {
    pub wallet: Wallet,
    pub amount: Amount,
    pub previous_checkpoint: Option<DateTime<Utc>>,
    pub reserved_at: DateTime<Utc>,
}
