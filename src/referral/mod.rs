use std::sync::Arc;

use chrono::Utc;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    ledger::{BindOutcome, Wallet},
    store::{LedgerStore, StoreError},
};

/// Body of `POST /api/referral/bind`. Every field is optional on the wire so
/// that absence maps to `MissingParams` instead of a decode failure.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BindRequest {
    #[serde(default)]
    pub wallet: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("missing params")]
    MissingParams,
    #[error("cannot bind yourself as referrer")]
    SelfReferral,
    #[error("malformed address: {0}")]
    MalformedAddress(String),
    #[error("malformed signature")]
    MalformedSignature,
    #[error("bad signature")]
    BadSignature,
    #[error("already bound to someone else")]
    AlreadyBound { existing: Wallet },
    #[error("binding would create a referral cycle")]
    WouldCycle,
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl BindError {
    pub fn status(&self) -> u16 {
        match self {
            BindError::BadSignature => 401,
            BindError::Store(_) => 500,
            _ => 400,
        }
    }
}

/// Parses a base58 address into a 32-byte public key.
pub fn decode_address(address: &str) -> Result<[u8; 32], BindError> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|_| BindError::MalformedAddress(address.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| BindError::MalformedAddress(address.to_string()))
}

/// Strict ed25519 check that `signature` (base58) was made by `wallet` over `message`.
pub fn verify_wallet_signature(wallet: &str, message: &str, signature: &str) -> Result<(), BindError> {
    let key_bytes = decode_address(wallet)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| BindError::MalformedSignature)?;
    let sig_bytes = bs58::decode(signature)
        .into_vec()
        .map_err(|_| BindError::MalformedSignature)?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|_| BindError::MalformedSignature)?;
    key.verify_strict(message.as_bytes(), &signature)
        .map_err(|_| BindError::BadSignature)
}

fn required(field: &Option<String>) -> Result<&str, BindError> {
    match field.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(BindError::MissingParams),
    }
}

pub struct Binder<S> {
    store: Arc<S>,
}

impl<S> Clone for Binder<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: LedgerStore> Binder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Verifies the request and binds `referrer` as the wallet's up-line.
    /// Returns the referrer now in effect.
    pub async fn bind(&self, request: &BindRequest) -> Result<Wallet, BindError> {
        let wallet = required(&request.wallet)?;
        let referrer = required(&request.referrer)?;
        let message = required(&request.message)?;
        let signature = required(&request.signature)?;

        if wallet == referrer {
            return Err(BindError::SelfReferral);
        }
        decode_address(wallet)?;
        decode_address(referrer)?;
        if let Err(err) = verify_wallet_signature(wallet, message, signature) {
            warn!(wallet, error = %err, "bind signature rejected");
            return Err(err);
        }

        match self.store.bind_referrer(wallet, referrer, Utc::now()).await? {
            BindOutcome::Bound => {
                info!(wallet, referrer, "referrer bound");
                Ok(referrer.to_string())
            }
            BindOutcome::Unchanged => {
                debug!(wallet, referrer, "bind repeated, already in effect");
                Ok(referrer.to_string())
            }
            BindOutcome::AlreadyBound { existing } => {
                debug!(wallet, referrer, existing = %existing, "wallet already has a referrer");
                Err(BindError::AlreadyBound { existing })
            }
            BindOutcome::WouldCycle => Err(BindError::WouldCycle),
            BindOutcome::SelfReferral => Err(BindError::SelfReferral),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn address(key: &SigningKey) -> String {
        bs58::encode(key.verifying_key().as_bytes()).into_string()
    }

    fn request(signer: &SigningKey, wallet: &str, referrer: &str, message: &str) -> BindRequest {
        let signature = signer.sign(message.as_bytes());
        BindRequest {
            wallet: Some(wallet.into()),
            referrer: Some(referrer.into()),
            message: Some(message.into()),
            signature: Some(bs58::encode(signature.to_bytes()).into_string()),
        }
    }

    fn binder() -> (Binder<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Binder::new(store.clone()), store)
    }

    #[tokio::test]
    async fn valid_signature_binds_once() {
        let (binder, store) = binder();
        let wallet = SigningKey::generate(&mut OsRng);
        let first = address(&SigningKey::generate(&mut OsRng));
        let second = address(&SigningKey::generate(&mut OsRng));
        let me = address(&wallet);

        let bound = binder.bind(&request(&wallet, &me, &first, "bind")).await.unwrap();
        assert_eq!(bound, first);
        // same referrer again is a no-op success
        binder.bind(&request(&wallet, &me, &first, "bind")).await.unwrap();

        let err = binder
            .bind(&request(&wallet, &me, &second, "bind"))
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::AlreadyBound { ref existing } if *existing == first));
        assert_eq!(err.status(), 400);

        let user = store.user(&me).await.unwrap().unwrap();
        assert_eq!(user.referrer.as_deref(), Some(first.as_str()));
        assert_eq!(store.user(&first).await.unwrap().unwrap().referral_count, 1);
    }

    #[tokio::test]
    async fn self_referral_fails_even_with_valid_signature() {
        let (binder, store) = binder();
        let wallet = SigningKey::generate(&mut OsRng);
        let me = address(&wallet);
        let err = binder.bind(&request(&wallet, &me, &me, "bind")).await.unwrap_err();
        assert!(matches!(err, BindError::SelfReferral));
        assert!(store.user(&me).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_signer_is_unauthorized() {
        let (binder, store) = binder();
        let wallet = SigningKey::generate(&mut OsRng);
        let impostor = SigningKey::generate(&mut OsRng);
        let referrer = address(&SigningKey::generate(&mut OsRng));
        let me = address(&wallet);
        let err = binder
            .bind(&request(&impostor, &me, &referrer, "bind"))
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::BadSignature));
        assert_eq!(err.status(), 401);
        assert!(store.user(&me).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tampered_message_is_unauthorized() {
        let (binder, _) = binder();
        let wallet = SigningKey::generate(&mut OsRng);
        let me = address(&wallet);
        let referrer = address(&SigningKey::generate(&mut OsRng));
        let mut req = request(&wallet, &me, &referrer, "bind to A");
        req.message = Some("bind to B".into());
        assert!(matches!(
            binder.bind(&req).await.unwrap_err(),
            BindError::BadSignature
        ));
    }

    #[tokio::test]
    async fn malformed_inputs_are_client_errors() {
        let (binder, _) = binder();
        let wallet = SigningKey::generate(&mut OsRng);
        let me = address(&wallet);
        let referrer = address(&SigningKey::generate(&mut OsRng));

        let mut missing = request(&wallet, &me, &referrer, "bind");
        missing.message = Some("  ".into());
        assert!(matches!(binder.bind(&missing).await.unwrap_err(), BindError::MissingParams));

        let bad_addr = request(&wallet, &me, "not-base58-0OIl", "bind");
        assert!(matches!(
            binder.bind(&bad_addr).await.unwrap_err(),
            BindError::MalformedAddress(_)
        ));

        let mut short_sig = request(&wallet, &me, &referrer, "bind");
        short_sig.signature = Some(bs58::encode([7u8; 12]).into_string());
        let err = binder.bind(&short_sig).await.unwrap_err();
        assert!(matches!(err, BindError::MalformedSignature));
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn cycles_are_rejected() {
        let (binder, _) = binder();
        let a = SigningKey::generate(&mut OsRng);
        let b = SigningKey::generate(&mut OsRng);
        let (a_addr, b_addr) = (address(&a), address(&b));
        binder.bind(&request(&b, &b_addr, &a_addr, "bind")).await.unwrap();
        let err = binder
            .bind(&request(&a, &a_addr, &b_addr, "bind"))
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::WouldCycle));
    }
}
