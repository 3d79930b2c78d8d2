use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, ValueEnum};

use crate::{
    accrual::AccrualPolicy,
    chain::PayerConfig,
    claim::ClaimPolicy,
    ledger::{Amount, TokenScale, BPS_DENOMINATOR, MAX_DECIMALS},
    oracle::OracleConfig,
    store::SupabaseConfig,
    vesting::{StrategyKind, VestingStrategy},
};

pub const DEFAULT_MINT: &str = "59eXaVJNG441QW54NTmpeDpXEzkuaRjSLm8M6N4Gpump";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required for this configuration")]
    Missing(&'static str),
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    Memory,
    Supabase,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum WebhookMode {
    /// Settle the batch before answering the webhook.
    Sync,
    /// Answer at once and settle on a spawned task.
    Deferred,
}

/// Every service setting, from flags or the environment.
#[derive(Clone, Debug, Args)]
pub struct Settings {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: SocketAddr,

    #[arg(long, env = "HELIUS_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: String,

    #[arg(long, env = "WEBHOOK_MODE", value_enum, default_value_t = WebhookMode::Sync)]
    pub webhook_mode: WebhookMode,

    #[arg(long, env = "TOKEN_MINT", default_value = DEFAULT_MINT)]
    pub token_mint: String,

    #[arg(long, env = "MINT_DECIMALS", default_value_t = 6)]
    pub mint_decimals: u8,

    #[arg(long, env = "REWARD_RATE_BPS", default_value_t = 500)]
    pub reward_rate_bps: u32,

    #[arg(long, env = "DUST_USD", default_value_t = 0.01)]
    pub dust_usd: f64,

    #[arg(long, env = "SETTLEMENT_CONCURRENCY", default_value_t = 8)]
    pub settlement_concurrency: usize,

    #[arg(long, env = "PRICE_ORACLE_URL", default_value = "https://api.dexscreener.com")]
    pub price_oracle_url: String,

    #[arg(long, env = "PRICE_TIMEOUT_MS", default_value_t = 1500)]
    pub price_timeout_ms: u64,

    #[arg(long, env = "FALLBACK_PRICE_USD", default_value_t = 0.0001)]
    pub fallback_price_usd: f64,

    #[arg(long, env = "VESTING_STRATEGY", value_enum, default_value_t = StrategyKind::Linear)]
    pub vesting_strategy: StrategyKind,

    #[arg(long, env = "VESTING_PERIOD_DAYS", default_value_t = 30)]
    pub vesting_period_days: u32,

    /// Balances at or below this many tokens release at once under daily-sweep.
    #[arg(long, env = "SWEEP_THRESHOLD", default_value_t = 1.0)]
    pub sweep_threshold: f64,

    /// Smallest payout, in tokens.
    #[arg(long, env = "MIN_CLAIM", default_value_t = 0.1)]
    pub min_claim: f64,

    #[arg(long, env = "PAYOUT_PRECISION", default_value_t = 4)]
    pub payout_precision: u8,

    #[arg(long, env = "SOLANA_RPC_URL", default_value = "https://api.mainnet-beta.solana.com")]
    pub solana_rpc_url: String,

    /// Base58 64-byte keypair of the custodial payer. Claims fail without it.
    #[arg(long, env = "PAYER_PRIVATE_KEY", hide_env_values = true)]
    pub payer_private_key: Option<String>,

    #[arg(long, env = "COMPUTE_UNIT_LIMIT", default_value_t = 300_000)]
    pub compute_unit_limit: u32,

    /// Priority fee in micro-lamports per compute unit.
    #[arg(long, env = "COMPUTE_UNIT_PRICE", default_value_t = 100_000)]
    pub compute_unit_price: u64,

    #[arg(long, env = "RPC_TIMEOUT_MS", default_value_t = 10_000)]
    pub rpc_timeout_ms: u64,

    #[arg(long = "store", env = "STORE", value_enum, default_value_t = StoreKind::Memory)]
    pub store: StoreKind,

    #[arg(long, env = "SNAPSHOT_PATH")]
    pub snapshot_path: Option<PathBuf>,

    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: Option<String>,

    #[arg(long, env = "SUPABASE_SERVICE_ROLE_KEY", hide_env_values = true)]
    pub supabase_service_role_key: Option<String>,
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.webhook_secret.trim().is_empty() {
            return Err(ConfigError::Missing("HELIUS_WEBHOOK_SECRET"));
        }
        if self.mint_decimals > MAX_DECIMALS {
            return Err(invalid("MINT_DECIMALS", format!("at most {MAX_DECIMALS}")));
        }
        if self.payout_precision > self.mint_decimals {
            return Err(invalid(
                "PAYOUT_PRECISION",
                format!("{} exceeds mint decimals {}", self.payout_precision, self.mint_decimals),
            ));
        }
        if self.vesting_period_days == 0 {
            return Err(invalid("VESTING_PERIOD_DAYS", "must be positive"));
        }
        if self.reward_rate_bps as u64 > BPS_DENOMINATOR {
            return Err(invalid("REWARD_RATE_BPS", "must not exceed 10000"));
        }
        for (name, value) in [
            ("DUST_USD", self.dust_usd),
            ("FALLBACK_PRICE_USD", self.fallback_price_usd),
            ("SWEEP_THRESHOLD", self.sweep_threshold),
            ("MIN_CLAIM", self.min_claim),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(name, "must be a non-negative number"));
            }
        }
        if self.settlement_concurrency == 0 {
            return Err(invalid("SETTLEMENT_CONCURRENCY", "must be positive"));
        }
        if self.token_mint.parse::<crate::chain::Pubkey>().is_err() {
            return Err(invalid("TOKEN_MINT", "not a base58 address"));
        }
        if self.store == StoreKind::Supabase {
            if self.supabase_url.is_none() {
                return Err(ConfigError::Missing("SUPABASE_URL"));
            }
            if self.supabase_service_role_key.is_none() {
                return Err(ConfigError::Missing("SUPABASE_SERVICE_ROLE_KEY"));
            }
        }
        Ok(())
    }

    pub fn scale(&self) -> TokenScale {
        TokenScale::new(self.mint_decimals)
    }

    fn tokens(&self, ui: f64) -> Amount {
        self.scale().from_ui(ui).unwrap_or(0).max(0) as Amount
    }

    pub fn accrual_policy(&self) -> AccrualPolicy {
        AccrualPolicy {
            mint: self.token_mint.clone(),
            scale: self.scale(),
            reward_rate_bps: self.reward_rate_bps,
            dust_usd: self.dust_usd,
            concurrency: self.settlement_concurrency,
        }
    }

    pub fn vesting(&self) -> VestingStrategy {
        VestingStrategy::from_kind(
            self.vesting_strategy,
            self.vesting_period_days,
            self.tokens(self.sweep_threshold),
        )
    }

    pub fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            scale: self.scale(),
            strategy: self.vesting(),
            min_claim: self.tokens(self.min_claim),
            payout_precision: self.payout_precision,
        }
    }

    pub fn oracle_config(&self) -> OracleConfig {
        OracleConfig {
            base_url: self.price_oracle_url.clone(),
            mint: self.token_mint.clone(),
            timeout: Duration::from_millis(self.price_timeout_ms),
            fallback_price_usd: self.fallback_price_usd,
        }
    }

    pub fn payer_config(&self) -> Option<PayerConfig> {
        let keypair = self.payer_private_key.as_ref()?;
        Some(PayerConfig {
            rpc_url: self.solana_rpc_url.clone(),
            payer_keypair: keypair.clone(),
            mint: self.token_mint.clone(),
            compute_unit_limit: self.compute_unit_limit,
            compute_unit_price: self.compute_unit_price,
            timeout: Duration::from_millis(self.rpc_timeout_ms),
        })
    }

    pub fn supabase_config(&self) -> Result<SupabaseConfig, ConfigError> {
        Ok(SupabaseConfig {
            url: self
                .supabase_url
                .clone()
                .ok_or(ConfigError::Missing("SUPABASE_URL"))?,
            service_role_key: self
                .supabase_service_role_key
                .clone()
                .ok_or(ConfigError::Missing("SUPABASE_SERVICE_ROLE_KEY"))?,
            timeout: Duration::from_millis(self.rpc_timeout_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        settings: Settings,
    }

    fn parse(args: &[&str]) -> Settings {
        let mut argv = vec!["referral-ledger", "--webhook-secret", "s3cret"];
        argv.extend_from_slice(args);
        Harness::parse_from(argv).settings
    }

    #[test]
    fn defaults_are_consistent() {
        let settings = parse(&[]);
        settings.validate().unwrap();
        let claim = settings.claim_policy();
        assert_eq!(claim.min_claim, 100_000);
        assert_eq!(claim.payout_precision, 4);
        let accrual = settings.accrual_policy();
        assert_eq!(accrual.reward_rate_bps, 500);
        assert_eq!(accrual.mint, DEFAULT_MINT);
        assert_eq!(
            settings.vesting(),
            VestingStrategy::Linear {
                period_secs: 30 * 86_400
            }
        );
        assert!(settings.payer_config().is_none());
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        let precise = parse(&["--payout-precision", "8"]);
        assert!(matches!(
            precise.validate(),
            Err(ConfigError::Invalid { name: "PAYOUT_PRECISION", .. })
        ));
        let rate = parse(&["--reward-rate-bps", "10001"]);
        assert!(rate.validate().is_err());
        let period = parse(&["--vesting-period-days", "0"]);
        assert!(period.validate().is_err());
        let supabase = parse(&["--store", "supabase"]);
        assert!(matches!(
            supabase.validate(),
            Err(ConfigError::Missing("SUPABASE_URL"))
        ));
    }

    #[test]
    fn daily_sweep_threshold_is_in_base_units() {
        let settings = parse(&["--vesting-strategy", "daily-sweep", "--sweep-threshold", "2.5"]);
        assert_eq!(
            settings.vesting(),
            VestingStrategy::DailySweep {
                period_days: 30,
                sweep_threshold: 2_500_000
            }
        );
    }
}
