use std::{future::Future, time::Duration};

use serde::Serialize;
use solana_commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_rpc_client_api::{
    client_error::{Error as ClientError, ErrorKind},
    config::RpcSendTransactionConfig,
    request::RpcError,
};
use solana_signer::Signer;
use solana_transaction::Transaction;
use tracing::{debug, info, warn};

use super::{
    associated_token_address, parse_address, payout_instructions, ChainError, ComputeBudget,
    PayerKey, Pubkey,
};
use crate::ledger::Amount;

#[derive(Debug, thiserror::Error)]
pub enum PayoutError {
    /// Nothing reached the cluster; safe to undo the ledger reservation.
    #[error("payout rejected: {0}")]
    Rejected(String),
    /// The transaction may have been broadcast.
    #[error("payout outcome unknown: {0}")]
    Unconfirmed(String),
    #[error("payout misconfigured: {0}")]
    Config(String),
}

impl PayoutError {
    pub fn definitely_unsent(&self) -> bool {
        !matches!(self, PayoutError::Unconfirmed(_))
    }
}

impl From<ChainError> for PayoutError {
    fn from(err: ChainError) -> Self {
        PayoutError::Rejected(err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PayoutReceipt {
    pub signature: String,
    pub created_recipient_account: bool,
}

/// Sends `amount` base units of the reward mint to a wallet.
pub trait TokenPayer: Send + Sync + 'static {
    fn pay(
        &self,
        recipient: &str,
        amount: Amount,
    ) -> impl Future<Output = Result<PayoutReceipt, PayoutError>> + Send;
}

/// An absent payer refuses every payout before anything is sent.
impl<T: TokenPayer> TokenPayer for Option<T> {
    async fn pay(&self, recipient: &str, amount: Amount) -> Result<PayoutReceipt, PayoutError> {
        match self {
            Some(payer) => payer.pay(recipient, amount).await,
            None => Err(PayoutError::Config("no payer keypair configured".into())),
        }
    }
}

/// Payer settings. No `Debug`: it carries the private key.
#[derive(Clone)]
pub struct PayerConfig {
    pub rpc_url: String,
    /// Base58 of the 64-byte secret+public keypair.
    pub payer_keypair: String,
    pub mint: String,
    pub compute_unit_limit: u32,
    pub compute_unit_price: u64,
    pub timeout: Duration,
}

pub struct RpcPayer {
    rpc: RpcClient,
    payer: PayerKey,
    mint: Pubkey,
    budget: ComputeBudget,
}

impl RpcPayer {
    pub fn new(config: PayerConfig) -> Result<Self, PayoutError> {
        let payer = PayerKey::from_base58(&config.payer_keypair)
            .map_err(|e| PayoutError::Config(e.to_string()))?;
        let mint = parse_address(&config.mint).map_err(|e| PayoutError::Config(e.to_string()))?;
        let rpc = RpcClient::new_with_timeout_and_commitment(
            config.rpc_url,
            config.timeout,
            CommitmentConfig::confirmed(),
        );
        info!(
            payer = %payer.pubkey(),
            source = %associated_token_address(&payer.pubkey(), &mint),
            mint = %mint,
            "payer ready"
        );
        Ok(Self {
            rpc,
            payer,
            mint,
            budget: ComputeBudget {
                unit_limit: config.compute_unit_limit,
                unit_price: config.compute_unit_price,
            },
        })
    }
}

fn send_config() -> RpcSendTransactionConfig {
    RpcSendTransactionConfig {
        skip_preflight: false,
        preflight_commitment: Some(CommitmentLevel::Processed),
        ..RpcSendTransactionConfig::default()
    }
}

/// A node-side refusal (preflight failure, bad transaction) or a connection
/// that never opened means nothing was broadcast. Anything after the request
/// left the process is an unknown outcome.
fn never_broadcast(err: &ClientError) -> bool {
    match err.kind() {
        ErrorKind::RpcError(RpcError::RpcResponseError { .. })
        | ErrorKind::TransactionError(_)
        | ErrorKind::SigningError(_) => true,
        ErrorKind::Reqwest(e) => e.is_connect(),
        _ => false,
    }
}

impl TokenPayer for RpcPayer {
    async fn pay(&self, recipient: &str, amount: Amount) -> Result<PayoutReceipt, PayoutError> {
        let wallet = parse_address(recipient)?;
        let payer = self.payer.pubkey();
        let destination = associated_token_address(&wallet, &self.mint);

        let exists = self
            .rpc
            .get_account_with_commitment(&destination, self.rpc.commitment())
            .await
            .map_err(|e| PayoutError::Rejected(format!("getAccountInfo: {e}")))?
            .value
            .is_some();
        if !exists {
            debug!(wallet = %wallet, account = %destination, "recipient token account missing, creating");
        }
        let instructions =
            payout_instructions(&payer, &wallet, &self.mint, amount, !exists, self.budget)?;

        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| PayoutError::Rejected(format!("getLatestBlockhash: {e}")))?;
        let mut tx = Transaction::new_with_payer(&instructions, Some(&payer));
        tx.try_sign(&[&self.payer], blockhash)
            .map_err(|e| PayoutError::Rejected(format!("sign: {e}")))?;
        let tx_id = tx.signatures.first().map(ToString::to_string).unwrap_or_default();

        match self.rpc.send_transaction_with_config(&tx, send_config()).await {
            Ok(signature) => {
                info!(wallet = %wallet, amount, tx = %signature, created_account = !exists, "payout broadcast");
                Ok(PayoutReceipt {
                    signature: signature.to_string(),
                    created_recipient_account: !exists,
                })
            }
            Err(err) if never_broadcast(&err) => Err(PayoutError::Rejected(err.to_string())),
            Err(err) => {
                warn!(wallet = %wallet, amount, tx = %tx_id, error = %err, "sendTransaction outcome unknown");
                Err(PayoutError::Unconfirmed(format!("{err} (tx {tx_id})")))
            }
        }
    }
}
