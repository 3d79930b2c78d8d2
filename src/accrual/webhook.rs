use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::ledger::{Holding, TokenScale, TxSignature, Wallet};

/// One enhanced-transaction descriptor as delivered by the webhook.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTransaction {
    pub signature: TxSignature,
    #[serde(default)]
    pub transaction_error: Option<Value>,
    #[serde(default)]
    pub token_transfers: Option<Vec<TokenTransfer>>,
}

impl WebhookTransaction {
    pub fn failed(&self) -> bool {
        self.transaction_error.is_some()
    }

    pub fn transfers(&self) -> &[TokenTransfer] {
        self.token_transfers.as_deref().unwrap_or_default()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransfer {
    pub mint: String,
    #[serde(default)]
    pub token_amount: UiAmount,
    #[serde(default)]
    pub from_user_account: Option<Wallet>,
    #[serde(default)]
    pub to_user_account: Option<Wallet>,
}

/// UI token amount; senders emit either a JSON number or a numeric string.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UiAmount {
    Number(f64),
    Text(String),
}

impl Default for UiAmount {
    fn default() -> Self {
        UiAmount::Number(0.0)
    }
}

impl UiAmount {
    pub fn value(&self) -> Option<f64> {
        match self {
            UiAmount::Number(v) => Some(*v),
            UiAmount::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// A decoded webhook body: the descriptors that parsed and a count of the
/// ones that did not.
#[derive(Clone, Debug, Default)]
pub struct ParsedBatch {
    pub transactions: Vec<WebhookTransaction>,
    pub malformed: usize,
}

impl From<Vec<WebhookTransaction>> for ParsedBatch {
    fn from(transactions: Vec<WebhookTransaction>) -> Self {
        Self {
            transactions,
            malformed: 0,
        }
    }
}

/// Decodes a webhook body descriptor by descriptor so that one malformed
/// entry does not discard the rest.
pub fn parse_batch(body: &[u8]) -> Result<ParsedBatch, serde_json::Error> {
    let raw: Vec<Value> = serde_json::from_slice(body)?;
    let mut parsed = ParsedBatch {
        transactions: Vec::with_capacity(raw.len()),
        malformed: 0,
    };
    for (idx, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<WebhookTransaction>(value) {
            Ok(tx) => parsed.transactions.push(tx),
            Err(err) => {
                warn!(index = idx, error = %err, "skipping malformed webhook descriptor");
                parsed.malformed += 1;
            }
        }
    }
    Ok(parsed)
}

/// Net signed change of the tracked mint for one wallet across a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetChange {
    pub wallet: Wallet,
    pub delta: Holding,
    /// Signature of the last transaction in the batch that touched this wallet.
    pub last_signature: TxSignature,
}

/// Collapses every leg of `mint` in the batch into one signed delta per wallet.
/// Router hops net out because all legs are summed before anything is settled.
pub fn aggregate(
    transactions: &[WebhookTransaction],
    mint: &str,
    scale: TokenScale,
) -> Vec<NetChange> {
    let mut net: BTreeMap<Wallet, (Holding, TxSignature)> = BTreeMap::new();
    let mut touch = |wallet: &Wallet, delta: Holding, signature: &TxSignature| {
        let entry = net
            .entry(wallet.clone())
            .or_insert_with(|| (0, signature.clone()));
        entry.0 = entry.0.saturating_add(delta);
        entry.1 = signature.clone();
    };

    for tx in transactions {
        for leg in tx.transfers() {
            if leg.mint != mint {
                continue;
            }
            let Some(units) = leg.token_amount.value().and_then(|ui| scale.from_ui(ui)) else {
                continue;
            };
            if units <= 0 {
                continue;
            }
            if leg.from_user_account.is_some() && leg.from_user_account == leg.to_user_account {
                continue;
            }
            if let Some(to) = &leg.to_user_account {
                touch(to, units, &tx.signature);
            }
            if let Some(from) = &leg.from_user_account {
                touch(from, -units, &tx.signature);
            }
        }
    }

    net.into_iter()
        .filter(|(_, (delta, _))| *delta != 0)
        .map(|(wallet, (delta, last_signature))| NetChange {
            wallet,
            delta,
            last_signature,
        })
        .collect()
}
