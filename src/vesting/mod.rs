//! Release schedules for locked referral rewards.
//!
//! Every strategy reads the same three inputs from a user row (locked
//! balance, total claimed, checkpoint) and returns how many base units may be
//! released at `now`. The result is always `<= locked_reward`. A row without a
//! checkpoint has accrued no time yet.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::{Amount, UserRecord};

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum VestingStrategy {
    /// `(locked + claimed) * elapsed / period`, capped at the locked balance.
    Linear { period_secs: i64 },
    /// Nothing until `period` has passed since the checkpoint, then everything.
    Cliff { period_secs: i64 },
    /// Small balances release at once; larger ones accrue by whole days.
    DailySweep { period_days: u32, sweep_threshold: Amount },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Linear,
    Cliff,
    DailySweep,
}

impl VestingStrategy {
    pub fn from_kind(kind: StrategyKind, period_days: u32, sweep_threshold: Amount) -> Self {
        let period_secs = period_days as i64 * SECONDS_PER_DAY;
        match kind {
            StrategyKind::Linear => VestingStrategy::Linear { period_secs },
            StrategyKind::Cliff => VestingStrategy::Cliff { period_secs },
            StrategyKind::DailySweep => VestingStrategy::DailySweep {
                period_days,
                sweep_threshold,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VestingStrategy::Linear { .. } => "linear",
            VestingStrategy::Cliff { .. } => "cliff",
            VestingStrategy::DailySweep { .. } => "daily-sweep",
        }
    }

    /// True when the whole remaining balance is dust the strategy clears in
    /// one payout; such a payout bypasses precision and the claim minimum.
    pub fn sweeps(&self, user: &UserRecord) -> bool {
        match *self {
            VestingStrategy::DailySweep {
                sweep_threshold, ..
            } => user.locked_reward > 0 && user.locked_reward <= sweep_threshold,
            _ => false,
        }
    }

    pub fn releasable(&self, user: &UserRecord, now: DateTime<Utc>) -> Amount {
        let locked = user.locked_reward;
        if locked == 0 {
            return 0;
        }
        let elapsed = elapsed(user.last_vesting_time, now);
        let released = match *self {
            VestingStrategy::Linear { period_secs } => {
                if period_secs <= 0 {
                    return locked;
                }
                let pool = locked as u128 + user.total_claimed as u128;
                let secs = elapsed.num_seconds().max(0) as u128;
                pool.saturating_mul(secs) / period_secs as u128
            }
            VestingStrategy::Cliff { period_secs } => {
                if elapsed.num_seconds() >= period_secs {
                    locked as u128
                } else {
                    0
                }
            }
            VestingStrategy::DailySweep {
                period_days,
                sweep_threshold,
            } => {
                if locked <= sweep_threshold || period_days == 0 {
                    locked as u128
                } else {
                    let days = elapsed.num_days().max(0) as u128;
                    locked as u128 * days / period_days as u128
                }
            }
        };
        released.min(locked as u128) as Amount
    }
}

fn elapsed(checkpoint: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    match checkpoint {
        Some(at) if at < now => now - at,
        _ => Duration::zero(),
    }
}
