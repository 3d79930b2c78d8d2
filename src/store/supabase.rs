use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{LedgerStore, StoreError};
use crate::ledger::{
    Amount, BindOutcome, ClaimReservation, Holding, HoldingUpdate, LedgerError, RecordOutcome,
    RewardRecord, TxSignature, UserRecord,
};

#[derive(Clone, Debug)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_role_key: String,
    pub timeout: Duration,
}

/// PostgREST-backed store. Table reads go to `/rest/v1/users`; every
/// mutation is exactly one stored procedure call under `/rest/v1/rpc/`, so
/// the database provides the atomicity.
#[derive(Clone)]
pub struct SupabaseStore {
    http: Client,
    base: String,
    key: String,
}

#[derive(Deserialize)]
struct ReserveReply {
    ok: bool,
    #[serde(default)]
    available: Amount,
    previous_checkpoint: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct InsertReply {
    inserted: bool,
    #[serde(default)]
    amount: Amount,
}

impl SupabaseStore {
    pub fn new(config: SupabaseConfig) -> Result<Self, StoreError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base: config.url.trim_end_matches('/').to_string(),
            key: config.service_role_key,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
            .header("Content-Type", "application/json")
    }

    async fn rpc<T: DeserializeOwned>(&self, function: &str, args: Value) -> Result<T, StoreError> {
        debug!(function, "supabase rpc");
        let url = format!("{}/rest/v1/rpc/{function}", self.base);
        let response = self.authorize(self.http.post(url)).json(&args).send().await?;
        decode(function, response).await
    }

    /// Query values are url-encoded by reqwest, so a wallet filter matches
    /// exactly the string given.
    fn users_request(&self, params: &[(&str, String)]) -> RequestBuilder {
        let url = format!("{}/rest/v1/users", self.base);
        self.authorize(self.http.get(url)).query(params)
    }

    async fn select_users(&self, params: &[(&str, String)]) -> Result<Vec<UserRecord>, StoreError> {
        let response = self.users_request(params).send().await?;
        decode("users", response).await
    }
}

async fn decode<T: DeserializeOwned>(
    what: &str,
    response: reqwest::Response,
) -> Result<T, StoreError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(StoreError::Backend(format!("{what}: HTTP {status}: {body}")));
    }
    serde_json::from_str(&body).map_err(|e| StoreError::Decode(format!("{what}: {e}")))
}

fn wallet_filter(wallet: &str) -> [(&'static str, String); 3] {
    [
        ("wallet", format!("eq.{wallet}")),
        ("select", "*".into()),
        ("limit", "1".into()),
    ]
}

impl LedgerStore for SupabaseStore {
    async fn claim_signatures(
        &self,
        signatures: &[TxSignature],
        now: DateTime<Utc>,
    ) -> Result<Vec<TxSignature>, StoreError> {
        if signatures.is_empty() {
            return Ok(Vec::new());
        }
        self.rpc(
            "claim_processed_signatures",
            json!({ "signatures": signatures, "processed_at": now }),
        )
        .await
    }

    async fn upsert_user(&self, wallet: &str, now: DateTime<Utc>) -> Result<UserRecord, StoreError> {
        self.rpc("upsert_user", json!({ "user_wallet": wallet, "created_at": now }))
            .await
    }

    async fn user(&self, wallet: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .select_users(&wallet_filter(wallet))
            .await?
            .into_iter()
            .next())
    }

    async fn apply_holding_delta(
        &self,
        wallet: &str,
        delta: Holding,
        now: DateTime<Utc>,
    ) -> Result<Option<HoldingUpdate>, StoreError> {
        self.rpc(
            "apply_holding_delta",
            json!({ "user_wallet": wallet, "delta": delta, "updated_at": now }),
        )
        .await
    }

    async fn credit_referrer(
        &self,
        record: &RewardRecord,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, StoreError> {
        let reply: InsertReply = self
            .rpc("record_referral_reward", json!({ "record": record, "credited_at": now }))
            .await?;
        Ok(insert_outcome(reply))
    }

    async fn debit_referrer(
        &self,
        record: &RewardRecord,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, StoreError> {
        let reply: InsertReply = self
            .rpc("decrement_locked_reward", json!({ "record": record, "debited_at": now }))
            .await?;
        Ok(insert_outcome(reply))
    }

    async fn bind_referrer(
        &self,
        wallet: &str,
        referrer: &str,
        now: DateTime<Utc>,
    ) -> Result<BindOutcome, StoreError> {
        self.rpc(
            "bind_referrer",
            json!({ "user_wallet": wallet, "referrer_wallet": referrer, "bound_at": now }),
        )
        .await
    }

    async fn reserve_claim(
        &self,
        wallet: &str,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<ClaimReservation, StoreError> {
        let reply: ReserveReply = self
            .rpc(
                "reserve_claim",
                json!({ "user_wallet": wallet, "amount": amount, "reserved_at": now }),
            )
            .await?;
        if !reply.ok {
            return Err(LedgerError::InsufficientLocked {
                wallet: wallet.to_string(),
                available: reply.available,
                requested: amount,
            }
            .into());
        }
        Ok(ClaimReservation {
            wallet: wallet.to_string(),
            amount,
            previous_checkpoint: reply.previous_checkpoint,
            reserved_at: now,
        })
    }

    async fn release_claim(
        &self,
        reservation: &ClaimReservation,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _: Value = self
            .rpc(
                "release_claim",
                json!({ "reservation": reservation, "released_at": now }),
            )
            .await?;
        Ok(())
    }

    async fn leaderboard(&self, limit: usize) -> Result<Vec<UserRecord>, StoreError> {
        self.select_users(&[
            ("select", "*".into()),
            ("order", "team_volume.desc,wallet.asc".into()),
            ("limit", limit.to_string()),
        ])
        .await
    }
}

fn insert_outcome(reply: InsertReply) -> RecordOutcome {
    if reply.inserted {
        RecordOutcome::Applied {
            amount: reply.amount,
        }
    } else {
        RecordOutcome::Duplicate
    }
}
