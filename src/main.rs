use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use referral_ledger::{
    accrual::AccrualEngine,
    chain::RpcPayer,
    claim::ClaimService,
    config::{Settings, StoreKind},
    http::{router, AppState},
    locks::WalletLocks,
    oracle::DexScreenerOracle,
    referral::Binder,
    store::{LedgerStore, MemoryStore, SupabaseStore},
};

#[derive(Parser)]
#[command(name = "referral-ledger", version, about = "Referral reward ledger service")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Emit logs as JSON lines.
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

//==================== logging ====================//

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,referral_ledger=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

//==================== wiring ====================//

async fn serve<S: LedgerStore>(settings: Settings, store: Arc<S>) -> Result<()> {
    let prices = Arc::new(
        DexScreenerOracle::new(settings.oracle_config()).context("build price oracle client")?,
    );
    let payer = match settings.payer_config() {
        Some(config) => Some(RpcPayer::new(config).context("load payer keypair")?),
        None => {
            tracing::warn!("PAYER_PRIVATE_KEY not set, claims will be refused");
            None
        }
    };

    let engine = AccrualEngine::new(
        store.clone(),
        prices,
        WalletLocks::new(),
        settings.accrual_policy(),
    );
    let claims = ClaimService::new(store.clone(), Arc::new(payer), settings.claim_policy());
    let state = AppState {
        store: store.clone(),
        engine,
        binder: Binder::new(store.clone()),
        claims,
        webhook_secret: Arc::from(settings.webhook_secret.as_str()),
        webhook_mode: settings.webhook_mode,
        scale: settings.scale(),
    };

    let listener = TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("bind {}", settings.bind_addr))?;
    info!(
        addr = %settings.bind_addr,
        mint = %settings.token_mint,
        vesting = settings.vesting().name(),
        mode = ?settings.webhook_mode,
        "listening"
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

//==================== main ====================//

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let settings = cli.settings;
    settings.validate().context("invalid configuration")?;

    match settings.store {
        StoreKind::Memory => {
            let store = match &settings.snapshot_path {
                Some(path) => MemoryStore::with_snapshot(path)
                    .with_context(|| format!("load snapshot {}", path.display()))?,
                None => MemoryStore::new(),
            };
            serve(settings, Arc::new(store)).await
        }
        StoreKind::Supabase => {
            let config = settings.supabase_config()?;
            let store = SupabaseStore::new(config).context("build supabase client")?;
            serve(settings, Arc::new(store)).await
        }
    }
}
