use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ed25519_dalek::{Signer, SigningKey};
use rand::{rngs::OsRng, RngCore};
use serde_json::json;

use referral_ledger::{
    accrual::{parse_batch, AccrualEngine, AccrualPolicy},
    config::DEFAULT_MINT,
    ledger::{TokenScale, MAX_DECIMALS},
    locks::WalletLocks,
    oracle::FixedPrice,
    store::{LedgerStore, MemoryStore},
};

#[derive(Parser)]
#[command(name = "referral-tool", version, about = "Operator tooling for the referral ledger")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an ed25519 keypair (hex secret, base58 address and base58 keypair).
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Print a signed body for POST /api/referral/bind.
    SignBind {
        /// 32-byte ed25519 secret in hex.
        #[arg(long)]
        sk_hex: String,
        #[arg(long)]
        referrer: String,
        #[arg(long)]
        message: Option<String>,
    },
    /// Run webhook batch files through the accrual engine against a local snapshot.
    Replay {
        #[arg(required = true)]
        batches: Vec<PathBuf>,
        #[arg(long)]
        snapshot: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_MINT)]
        mint: String,
        #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(u8).range(0..=MAX_DECIMALS as i64))]
        decimals: u8,
        #[arg(long, default_value_t = 0.0001)]
        price: f64,
        #[arg(long, default_value_t = 500)]
        rate_bps: u32,
        #[arg(long, default_value_t = 0.01)]
        dust_usd: f64,
        /// Seed a referral edge before replaying, as `wallet=referrer`. Repeatable.
        #[arg(long = "bind")]
        binds: Vec<String>,
        /// Register a wallet without a referrer. Repeatable.
        #[arg(long = "user")]
        users: Vec<String>,
    },
}

//==================== keygen ====================//

fn keygen_cmd(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("mkdir {}", out_dir.display()))?;

    let mut sk_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut sk_bytes);
    let sk = SigningKey::from_bytes(&sk_bytes);
    let address = bs58::encode(sk.verifying_key().as_bytes()).into_string();

    fs::write(out_dir.join("sk.hex"), hex::encode(sk_bytes))?;
    fs::write(out_dir.join("address.txt"), &address)?;
    // PAYER_PRIVATE_KEY format
    fs::write(
        out_dir.join("keypair.b58"),
        bs58::encode(sk.to_keypair_bytes()).into_string(),
    )?;
    println!("keypair written → {} ({address})", out_dir.display());
    Ok(())
}

//==================== sign-bind ====================//

fn sign_bind_cmd(sk_hex: &str, referrer: &str, message: Option<String>) -> Result<()> {
    let bytes = hex::decode(sk_hex.trim()).context("sk-hex is not hex")?;
    let secret: [u8; 32] = match bytes.try_into() {
        Ok(secret) => secret,
        Err(bytes) => bail!("sk-hex must be 32 bytes, got {}", bytes.len()),
    };
    let sk = SigningKey::from_bytes(&secret);
    let wallet = bs58::encode(sk.verifying_key().as_bytes()).into_string();
    let message = message.unwrap_or_else(|| {
        format!(
            "Bind referrer {referrer} to {wallet} at {}",
            Utc::now().timestamp()
        )
    });
    let signature = sk.sign(message.as_bytes());
    let body = json!({
        "wallet": wallet,
        "referrer": referrer,
        "message": message,
        "signature": bs58::encode(signature.to_bytes()).into_string(),
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

//==================== replay ====================//

struct ReplayArgs {
    batches: Vec<PathBuf>,
    snapshot: Option<PathBuf>,
    policy: AccrualPolicy,
    price: f64,
    binds: Vec<String>,
    users: Vec<String>,
}

async fn replay_cmd(args: ReplayArgs) -> Result<()> {
    let store = Arc::new(match &args.snapshot {
        Some(path) => MemoryStore::with_snapshot(path)
            .with_context(|| format!("open snapshot {}", path.display()))?,
        None => MemoryStore::new(),
    });
    let now = Utc::now();
    for wallet in &args.users {
        store.upsert_user(wallet, now).await?;
    }
    for edge in &args.binds {
        let Some((wallet, referrer)) = edge.split_once('=') else {
            bail!("--bind expects wallet=referrer, got {edge:?}");
        };
        let outcome = store.bind_referrer(wallet.trim(), referrer.trim(), now).await?;
        println!("bind {wallet} → {referrer}: {}", serde_json::to_string(&outcome)?);
    }

    let engine = AccrualEngine::new(
        store.clone(),
        Arc::new(FixedPrice(args.price)),
        WalletLocks::new(),
        args.policy,
    );
    for path in &args.batches {
        let body = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let batch =
            parse_batch(&body).with_context(|| format!("{} is not a transaction array", path.display()))?;
        let report = engine.process_batch(batch).await;
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "batch": path.display().to_string(), "report": report }))?
        );
    }
    println!("state digest: {}", hex::encode(store.digest()?));
    Ok(())
}

//==================== main ====================//

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Keygen { out_dir } => keygen_cmd(&out_dir),
        Command::SignBind {
            sk_hex,
            referrer,
            message,
        } => sign_bind_cmd(&sk_hex, &referrer, message),
        Command::Replay {
            batches,
            snapshot,
            mint,
            decimals,
            price,
            rate_bps,
            dust_usd,
            binds,
            users,
        } => {
            replay_cmd(ReplayArgs {
                batches,
                snapshot,
                policy: AccrualPolicy {
                    mint,
                    scale: TokenScale::new(decimals),
                    reward_rate_bps: rate_bps,
                    dust_usd,
                    concurrency: 1,
                },
                price,
                binds,
                users,
            })
            .await
        }
    }
}
