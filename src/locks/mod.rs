use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-wallet async mutexes shared by every request in the process.
#[derive(Clone, Default)]
pub struct WalletLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl WalletLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, wallet: &str) -> WalletGuard {
        let lock = self
            .inner
            .entry(wallet.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        WalletGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Returns `None` without waiting when the wallet is already locked.
    #[cfg(test)]
    pub fn try_acquire(&self, wallet: &str) -> Option<WalletGuard> {
        let lock = self
            .inner
            .entry(wallet.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned()
            .ok()
            .map(|guard| WalletGuard { _guard: guard })
    }

    /// Drops entries nobody holds or waits on.
    pub fn prune(&self) {
        self.inner.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

pub struct WalletGuard {
    _guard: OwnedMutexGuard<()>,
}
