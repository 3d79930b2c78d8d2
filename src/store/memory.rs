use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{LedgerStore, StoreError};
use crate::ledger::{
    Amount, BindOutcome, ClaimReservation, Holding, HoldingUpdate, LedgerSnapshot, LedgerState,
    RecordOutcome, RewardRecord, TxSignature, UserRecord,
};

/// Process-local store: one mutex around the whole ledger, with an optional
/// JSON snapshot brought up to date before each mutation returns.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<LedgerState>>,
    writer: Option<Arc<SnapshotWriter>>,
}

/// Serializes snapshot writes. Holds the height last written to disk, so a
/// caller that waited behind a newer write has nothing left to do.
struct SnapshotWriter {
    path: PathBuf,
    written: tokio::sync::Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `path` if it exists and keeps writing snapshots back to it.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = if path.exists() {
            let bytes = fs::read(&path)
                .map_err(|e| StoreError::Backend(format!("read {}: {e}", path.display())))?;
            let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Decode(format!("snapshot {}: {e}", path.display())))?;
            LedgerState::from_snapshot(snapshot)
        } else {
            LedgerState::new()
        };
        let written = state.meta.height;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            writer: Some(Arc::new(SnapshotWriter {
                path,
                written: tokio::sync::Mutex::new(written),
            })),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn snapshot(&self) -> Result<LedgerSnapshot, StoreError> {
        Ok(self.lock()?.snapshot())
    }

    pub fn digest(&self) -> Result<[u8; 32], StoreError> {
        Ok(self.lock()?.digest())
    }

    pub fn records(&self) -> Result<Vec<RewardRecord>, StoreError> {
        Ok(self.lock()?.records().cloned().collect())
    }

    /// Runs one atomic step on the ledger, then persists it.
    async fn apply<T>(&self, step: impl FnOnce(&mut LedgerState) -> T) -> Result<T, StoreError> {
        let out = {
            let mut state = self.lock()?;
            step(&mut state)
        };
        self.persist().await;
        Ok(out)
    }

    /// Brings the snapshot file up to the current height. The ledger lock is
    /// held only to copy the state; encoding and file I/O run on the
    /// blocking pool.
    async fn persist(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let mut written = writer.written.lock().await;
        let snapshot = {
            let Ok(state) = self.lock() else {
                return;
            };
            if state.meta.height <= *written {
                return;
            }
            state.snapshot()
        };
        let height = snapshot.meta.height;
        let path = writer.path.clone();
        match tokio::task::spawn_blocking(move || write_snapshot(&path, &snapshot)).await {
            Ok(true) => *written = height,
            Ok(false) => {}
            Err(err) => warn!(error = %err, "snapshot writer task failed"),
        }
    }
}

fn write_snapshot(path: &Path, snapshot: &LedgerSnapshot) -> bool {
    let json = match serde_json::to_vec_pretty(snapshot) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "snapshot encode failed");
            return false;
        }
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }
    let tmp = path.with_extension("tmp");
    let result = fs::write(&tmp, json).and_then(|_| fs::rename(&tmp, path));
    match result {
        Ok(()) => {
            debug!(path = %path.display(), height = snapshot.meta.height, "snapshot written");
            true
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "snapshot write failed");
            false
        }
    }
}

impl LedgerStore for MemoryStore {
    async fn claim_signatures(
        &self,
        signatures: &[TxSignature],
        now: DateTime<Utc>,
    ) -> Result<Vec<TxSignature>, StoreError> {
        self.apply(|s| s.claim_signatures(signatures, now)).await
    }

    async fn upsert_user(&self, wallet: &str, now: DateTime<Utc>) -> Result<UserRecord, StoreError> {
        self.apply(|s| s.upsert_user(wallet, now)).await
    }

    async fn user(&self, wallet: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.lock()?.user(wallet).cloned())
    }

    async fn apply_holding_delta(
        &self,
        wallet: &str,
        delta: Holding,
        now: DateTime<Utc>,
    ) -> Result<Option<HoldingUpdate>, StoreError> {
        self.apply(|s| s.apply_holding_delta(wallet, delta, now)).await
    }

    async fn credit_referrer(
        &self,
        record: &RewardRecord,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, StoreError> {
        self.apply(|s| s.credit_referrer(record, now)).await
    }

    async fn debit_referrer(
        &self,
        record: &RewardRecord,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, StoreError> {
        self.apply(|s| s.debit_referrer(record, now)).await
    }

    async fn bind_referrer(
        &self,
        wallet: &str,
        referrer: &str,
        now: DateTime<Utc>,
    ) -> Result<BindOutcome, StoreError> {
        self.apply(|s| s.bind_referrer(wallet, referrer, now)).await
    }

    async fn reserve_claim(
        &self,
        wallet: &str,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<ClaimReservation, StoreError> {
        Ok(self.apply(|s| s.reserve_claim(wallet, amount, now)).await??)
    }

    async fn release_claim(
        &self,
        reservation: &ClaimReservation,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(self.apply(|s| s.release_claim(reservation, now)).await??)
    }

    async fn leaderboard(&self, limit: usize) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self.lock()?.leaderboard(limit))
    }
}
