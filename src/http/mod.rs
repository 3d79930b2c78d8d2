//! HTTP surface: webhook ingress, bind, claim and the read endpoints.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::{
    accrual::{parse_batch, AccrualEngine},
    chain::TokenPayer,
    claim::{ClaimError, ClaimRequest, ClaimService},
    config::WebhookMode,
    ledger::{TokenScale, UserRecord},
    oracle::PriceSource,
    referral::{decode_address, BindError, BindRequest, Binder},
    store::LedgerStore,
};

pub const DEFAULT_LEADERBOARD_LIMIT: usize = 20;
pub const MAX_LEADERBOARD_LIMIT: usize = 100;

pub struct AppState<S, P, T> {
    pub store: Arc<S>,
    pub engine: AccrualEngine<S, P>,
    pub binder: Binder<S>,
    pub claims: ClaimService<S, T>,
    pub webhook_secret: Arc<str>,
    pub webhook_mode: WebhookMode,
    pub scale: TokenScale,
}

impl<S, P, T> Clone for AppState<S, P, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            engine: self.engine.clone(),
            binder: self.binder.clone(),
            claims: self.claims.clone(),
            webhook_secret: self.webhook_secret.clone(),
            webhook_mode: self.webhook_mode,
            scale: self.scale,
        }
    }
}

pub fn router<S, P, T>(state: AppState<S, P, T>) -> Router
where
    S: LedgerStore,
    P: PriceSource,
    T: TokenPayer,
{
    Router::new()
        .route("/api/webhook/helius", post(webhook::<S, P, T>))
        .route("/api/referral/bind", post(bind::<S, P, T>))
        .route("/api/claim", post(claim::<S, P, T>))
        .route("/api/leaderboard", get(leaderboard::<S, P, T>))
        .route("/api/user/connect", post(connect::<S, P, T>))
        .route("/api/user/:wallet", get(profile::<S, P, T>))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// JSON `{ "error": … }` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<BindError> for ApiError {
    fn from(err: BindError) -> Self {
        if let BindError::Store(inner) = &err {
            error!(error = %inner, "bind failed in store");
        }
        ApiError::new(err.status(), err.to_string())
    }
}

impl From<ClaimError> for ApiError {
    fn from(err: ClaimError) -> Self {
        ApiError::new(err.status(), err.to_string())
    }
}

#[derive(Deserialize)]
struct SecretQuery {
    secret: Option<String>,
}

async fn webhook<S: LedgerStore, P: PriceSource, T: TokenPayer>(
    State(state): State<AppState<S, P, T>>,
    Query(query): Query<SecretQuery>,
    body: Bytes,
) -> Response {
    if query.secret.as_deref() != Some(&*state.webhook_secret) {
        warn!("webhook rejected: bad secret");
        return ApiError::new(401, "unauthorized").into_response();
    }
    let acknowledged = Json(json!({ "success": true })).into_response();

    let batch = match parse_batch(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, bytes = body.len(), "webhook body is not a transaction array");
            return acknowledged;
        }
    };
    match state.webhook_mode {
        WebhookMode::Sync => {
            let report = state.engine.process_batch(batch).await;
            debug!(malformed = report.malformed, errors = report.errors, "webhook handled");
        }
        WebhookMode::Deferred => {
            let engine = state.engine.clone();
            tokio::spawn(async move {
                let report = engine.process_batch(batch).await;
                debug!(malformed = report.malformed, errors = report.errors, "deferred webhook handled");
            });
        }
    }
    acknowledged
}

async fn bind<S: LedgerStore, P: PriceSource, T: TokenPayer>(
    State(state): State<AppState<S, P, T>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request: BindRequest = serde_json::from_slice(&body).map_err(|_| BindError::MissingParams)?;
    let referrer = state.binder.bind(&request).await?;
    Ok(Json(json!({ "success": true, "referrer": referrer })))
}

async fn claim<S: LedgerStore, P: PriceSource, T: TokenPayer>(
    State(state): State<AppState<S, P, T>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request: ClaimRequest = serde_json::from_slice(&body).map_err(|_| ClaimError::MissingWallet)?;
    let receipt = state.claims.claim(&request).await?;
    Ok(Json(json!({
        "success": true,
        "tx": receipt.tx,
        "amount": receipt.amount,
    })))
}

#[derive(Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub wallet: String,
    pub referrals: u32,
    pub reward: f64,
    pub team_volume: f64,
    pub gap: f64,
}

/// Ranks pre-sorted rows; `gap` is the team-volume distance to the row above.
pub fn rank(users: &[UserRecord], scale: TokenScale) -> Vec<LeaderboardEntry> {
    let mut previous: Option<f64> = None;
    users
        .iter()
        .enumerate()
        .map(|(idx, user)| {
            let gap = previous.map_or(0.0, |above| (above - user.team_volume).max(0.0));
            previous = Some(user.team_volume);
            LeaderboardEntry {
                rank: idx + 1,
                wallet: user.wallet.clone(),
                referrals: user.referral_count,
                reward: scale.to_ui(user.locked_reward),
                team_volume: user.team_volume,
                gap,
            }
        })
        .collect()
}

async fn leaderboard<S: LedgerStore, P: PriceSource, T: TokenPayer>(
    State(state): State<AppState<S, P, T>>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LEADERBOARD_LIMIT)
        .clamp(1, MAX_LEADERBOARD_LIMIT);
    let users = state.store.leaderboard(limit).await.map_err(|err| {
        error!(error = %err, "leaderboard read failed");
        ApiError::new(500, "store unavailable")
    })?;
    Ok(Json(rank(&users, state.scale)))
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub wallet: String,
    pub referrer: Option<String>,
    pub referral_count: u32,
    pub locked_reward: f64,
    pub claimable: f64,
    pub total_claimed: f64,
    pub total_earned: f64,
    pub net_holding: f64,
    pub max_holding: f64,
    pub team_volume: f64,
    pub last_vesting_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    fn build<S: LedgerStore, T: TokenPayer>(
        user: UserRecord,
        claims: &ClaimService<S, T>,
        now: DateTime<Utc>,
    ) -> Self {
        let policy = claims.policy();
        let scale = policy.scale;
        let claimable = scale.truncate(policy.strategy.releasable(&user, now), policy.payout_precision);
        Profile {
            referral_count: user.referral_count,
            locked_reward: scale.to_ui(user.locked_reward),
            claimable: scale.to_ui(claimable),
            total_claimed: scale.to_ui(user.total_claimed),
            total_earned: scale.to_ui(user.total_earned),
            net_holding: scale.signed_to_ui(user.net_mgt_holding),
            max_holding: scale.signed_to_ui(user.max_mgt_holding),
            team_volume: user.team_volume,
            last_vesting_time: user.last_vesting_time,
            created_at: user.created_at,
            referrer: user.referrer,
            wallet: user.wallet,
        }
    }
}

#[derive(Deserialize)]
struct ConnectRequest {
    #[serde(default)]
    wallet: Option<String>,
}

async fn connect<S: LedgerStore, P: PriceSource, T: TokenPayer>(
    State(state): State<AppState<S, P, T>>,
    body: Bytes,
) -> Result<Json<Profile>, ApiError> {
    let request: ConnectRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::new(400, "missing wallet"))?;
    let wallet = request
        .wallet
        .as_deref()
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .ok_or_else(|| ApiError::new(400, "missing wallet"))?;
    decode_address(wallet)?;
    let now = Utc::now();
    let user = state.store.upsert_user(wallet, now).await.map_err(|err| {
        error!(wallet, error = %err, "connect upsert failed");
        ApiError::new(500, "store unavailable")
    })?;
    Ok(Json(Profile::build(user, &state.claims, now)))
}

async fn profile<S: LedgerStore, P: PriceSource, T: TokenPayer>(
    State(state): State<AppState<S, P, T>>,
    Path(wallet): Path<String>,
) -> Result<Json<Profile>, ApiError> {
    let user = state
        .store
        .user(&wallet)
        .await
        .map_err(|err| {
            error!(wallet = %wallet, error = %err, "profile read failed");
            ApiError::new(500, "store unavailable")
        })?
        .ok_or_else(|| ApiError::new(404, "user not found"))?;
    Ok(Json(Profile::build(user, &state.claims, Utc::now())))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        accrual::AccrualPolicy,
        chain::RpcPayer,
        claim::ClaimPolicy,
        ledger::{RecordStatus, RewardRecord},
        locks::WalletLocks,
        oracle::FixedPrice,
        store::MemoryStore,
        vesting::{StrategyKind, VestingStrategy},
    };

    const MINT: &str = "59eXaVJNG441QW54NTmpeDpXEzkuaRjSLm8M6N4Gpump";

    fn app(mode: WebhookMode) -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let scale = TokenScale::new(6);
        let engine = AccrualEngine::new(
            store.clone(),
            Arc::new(FixedPrice(0.0001)),
            WalletLocks::new(),
            AccrualPolicy {
                mint: MINT.into(),
                scale,
                reward_rate_bps: 500,
                dust_usd: 0.01,
                concurrency: 4,
            },
        );
        let claims = ClaimService::new(
            store.clone(),
            Arc::new(None::<RpcPayer>),
            ClaimPolicy {
                scale,
                strategy: VestingStrategy::from_kind(StrategyKind::Cliff, 0, 0),
                min_claim: 100_000,
                payout_precision: 4,
            },
        );
        let state = AppState {
            store: store.clone(),
            engine,
            binder: Binder::new(store.clone()),
            claims,
            webhook_secret: Arc::from("hunter2"),
            webhook_mode: mode,
            scale,
        };
        (router(state), store)
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(if body.is_null() {
                Body::empty()
            } else {
                Body::from(body.to_string())
            })
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn buy(signature: &str, wallet: &str, amount: f64) -> Value {
        json!({
            "signature": signature,
            "transactionError": null,
            "tokenTransfers": [{
                "mint": MINT,
                "tokenAmount": amount,
                "fromUserAccount": "pool",
                "toUserAccount": wallet
            }]
        })
    }

    #[tokio::test]
    async fn webhook_requires_secret() {
        let (router, _) = app(WebhookMode::Sync);
        let (status, body) = send(&router, "POST", "/api/webhook/helius?secret=nope", json!([])).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
        let (status, _) = send(&router, "POST", "/api/webhook/helius", json!([])).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_settles_and_always_acknowledges() {
        let (router, store) = app(WebhookMode::Sync);
        store.bind_referrer("C", "R", Utc::now()).await.unwrap();
        let uri = "/api/webhook/helius?secret=hunter2";
        let (status, body) = send(&router, "POST", uri, json!([buy("s1", "C", 1000.0)])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(store.user("R").await.unwrap().unwrap().locked_reward, 50_000_000);

        let (status, body) = send(&router, "POST", uri, json!({"not": "an array"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn deferred_webhook_settles_in_background() {
        let (router, store) = app(WebhookMode::Deferred);
        store.bind_referrer("C", "R", Utc::now()).await.unwrap();
        let (status, _) = send(
            &router,
            "POST",
            "/api/webhook/helius?secret=hunter2",
            json!([buy("s1", "C", 1000.0)]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        for _ in 0..50 {
            if store.user("R").await.unwrap().unwrap().locked_reward > 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("deferred batch never settled");
    }

    #[tokio::test]
    async fn bind_statuses() {
        let (router, _) = app(WebhookMode::Sync);
        let key = SigningKey::generate(&mut OsRng);
        let wallet = bs58::encode(key.verifying_key().as_bytes()).into_string();
        let referrer = bs58::encode(SigningKey::generate(&mut OsRng).verifying_key().as_bytes()).into_string();
        let signature = bs58::encode(key.sign(b"bind").to_bytes()).into_string();

        let body = json!({ "wallet": wallet, "referrer": referrer, "message": "bind", "signature": signature });
        let (status, reply) = send(&router, "POST", "/api/referral/bind", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["referrer"], referrer.as_str());

        let forged = json!({ "wallet": wallet, "referrer": referrer, "message": "other", "signature": signature });
        let (status, reply) = send(&router, "POST", "/api/referral/bind", forged).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(reply["error"], "bad signature");

        let selfie = json!({ "wallet": wallet, "referrer": wallet, "message": "bind", "signature": signature });
        let (status, _) = send(&router, "POST", "/api/referral/bind", selfie).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, reply) = send(&router, "POST", "/api/referral/bind", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply["error"], "missing params");
    }

    #[tokio::test]
    async fn leaderboard_orders_by_team_volume_with_gaps() {
        let (router, store) = app(WebhookMode::Sync);
        let now = Utc::now();
        for (sig, buyer, referrer, usd) in [("a", "x", "R1", 3.0), ("b", "y", "R2", 5.0), ("c", "z", "R3", 3.0)] {
            store
                .credit_referrer(
                    &RewardRecord {
                        signature: sig.into(),
                        buyer: buyer.into(),
                        referrer: referrer.into(),
                        token_amount: 20_000_000,
                        reward_amount: 1_000_000,
                        usd_value: usd,
                        status: RecordStatus::Reward,
                        created_at: now,
                    },
                    now,
                )
                .await
                .unwrap();
        }
        let (status, body) = send(&router, "GET", "/api/leaderboard?limit=3", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        let entries: Vec<LeaderboardEntry> = serde_json::from_value(body).unwrap();
        let wallets: Vec<_> = entries.iter().map(|e| e.wallet.as_str()).collect();
        assert_eq!(wallets, ["R2", "R1", "R3"]);
        assert_eq!(entries[0].gap, 0.0);
        assert_eq!(entries[1].gap, 2.0);
        assert_eq!(entries[2].gap, 0.0);
        assert_eq!(entries[0].reward, 1.0);
    }

    #[tokio::test]
    async fn connect_then_profile() {
        let (router, _) = app(WebhookMode::Sync);
        let wallet = bs58::encode(SigningKey::generate(&mut OsRng).verifying_key().as_bytes()).into_string();
        let uri = format!("/api/user/{wallet}");
        let (status, _) = send(&router, "GET", &uri, Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&router, "POST", "/api/user/connect", json!({ "wallet": wallet })).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&router, "GET", &uri, Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        let profile: Profile = serde_json::from_value(body).unwrap();
        assert_eq!(profile.wallet, wallet);
        assert_eq!(profile.locked_reward, 0.0);

        let (status, _) = send(&router, "POST", "/api/user/connect", json!({ "wallet": "??" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn claim_without_payer_fails_and_restores_balance() {
        let (router, store) = app(WebhookMode::Sync);
        store.bind_referrer("C", "R", Utc::now()).await.unwrap();
        send(
            &router,
            "POST",
            "/api/webhook/helius?secret=hunter2",
            json!([buy("s1", "C", 1000.0)]),
        )
        .await;

        let (status, body) = send(&router, "POST", "/api/claim", json!({ "wallet": "R" })).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("no payer"));
        let r = store.user("R").await.unwrap().unwrap();
        assert_eq!(r.locked_reward, 50_000_000);
        assert_eq!(r.total_claimed, 0);

        let (status, body) = send(&router, "POST", "/api/claim", json!({ "wallet": "nobody" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "user not found");
    }

    #[tokio::test]
    async fn healthz() {
        let (router, _) = app(WebhookMode::Sync);
        let response = router
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
