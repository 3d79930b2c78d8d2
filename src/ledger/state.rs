use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{
    Amount, BindOutcome, ClaimReservation, Holding, HoldingUpdate, LedgerError, RecordOutcome,
    RewardRecord, TxSignature, UserRecord, Wallet,
};

/// Upper bound on up-line walks; chains longer than this are treated as cyclic.
const MAX_UPLINE_DEPTH: usize = 4_096;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub height: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub users: BTreeMap<Wallet, UserRecord>,
    pub records: Vec<RewardRecord>,
    pub processed: BTreeSet<TxSignature>,
    #[serde(with = "hex_digest")]
    pub digest: [u8; 32],
}

/// Whole-ledger state behind the in-memory store. Every method is one atomic step.
#[derive(Default)]
pub struct LedgerState {
    pub meta: SnapshotMetadata,
    users: BTreeMap<Wallet, UserRecord>,
    records: BTreeMap<(TxSignature, Wallet), RewardRecord>,
    processed: BTreeSet<TxSignature>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let records = snapshot
            .records
            .into_iter()
            .map(|record| (record.key(), record))
            .collect();
        Self {
            meta: snapshot.meta,
            users: snapshot.users,
            records,
            processed: snapshot.processed,
        }
    }

    pub fn user(&self, wallet: &str) -> Option<&UserRecord> {
        self.users.get(wallet)
    }

    pub fn records(&self) -> impl Iterator<Item = &RewardRecord> {
        self.records.values()
    }

    #[cfg(test)]
    pub fn is_processed(&self, signature: &str) -> bool {
        self.processed.contains(signature)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.meta.height += 1;
        self.meta.updated_at = Some(now);
    }

    /// Inserts every unseen signature and returns exactly those, in input order.
    pub fn claim_signatures(
        &mut self,
        signatures: &[TxSignature],
        now: DateTime<Utc>,
    ) -> Vec<TxSignature> {
        let fresh: Vec<TxSignature> = signatures
            .iter()
            .filter(|sig| self.processed.insert((*sig).clone()))
            .cloned()
            .collect();
        if !fresh.is_empty() {
            self.touch(now);
        }
        fresh
    }

    pub fn upsert_user(&mut self, wallet: &str, now: DateTime<Utc>) -> UserRecord {
        if !self.users.contains_key(wallet) {
            self.touch(now);
        }
        self.users
            .entry(wallet.to_string())
            .or_insert_with(|| UserRecord::new(wallet.to_string(), now))
            .clone()
    }

    /// Adds `delta` to the wallet's net holding and raises its high-water mark.
    /// Unknown wallets are left untouched.
    pub fn apply_holding_delta(
        &mut self,
        wallet: &str,
        delta: Holding,
        now: DateTime<Utc>,
    ) -> Option<HoldingUpdate> {
        let user = self.users.get_mut(wallet)?;
        let previous_holding = user.net_mgt_holding;
        let previous_max = user.max_mgt_holding;
        user.net_mgt_holding = previous_holding.saturating_add(delta);
        user.max_mgt_holding = previous_max.max(user.net_mgt_holding);
        let update = HoldingUpdate {
            wallet: user.wallet.clone(),
            referrer: user.referrer.clone(),
            previous_holding,
            previous_max,
            holding: user.net_mgt_holding,
            max: user.max_mgt_holding,
        };
        self.touch(now);
        Some(update)
    }

    /// Inserts the audit row and, only when it is new, credits the referrer.
    pub fn credit_referrer(&mut self, record: &RewardRecord, now: DateTime<Utc>) -> RecordOutcome {
        let key = record.key();
        if self.records.contains_key(&key) {
            return RecordOutcome::Duplicate;
        }
        self.records.insert(key, record.clone());
        let referrer = self
            .users
            .entry(record.referrer.clone())
            .or_insert_with(|| UserRecord::new(record.referrer.clone(), now));
        referrer.locked_reward = referrer.locked_reward.saturating_add(record.reward_amount);
        referrer.total_earned = referrer.total_earned.saturating_add(record.reward_amount);
        referrer.team_volume += record.usd_value;
        if referrer.last_vesting_time.is_none() {
            referrer.last_vesting_time = Some(now);
        }
        self.touch(now);
        RecordOutcome::Applied {
            amount: record.reward_amount,
        }
    }

    /// Inserts the clawback audit row and, only when it is new, debits the
    /// referrer's locked balance clamped at zero.
    pub fn debit_referrer(&mut self, record: &RewardRecord, now: DateTime<Utc>) -> RecordOutcome {
        let key = record.key();
        if self.records.contains_key(&key) {
            return RecordOutcome::Duplicate;
        }
        let debited = match self.users.get_mut(&record.referrer) {
            Some(referrer) => {
                let debited = referrer.locked_reward.min(record.reward_amount);
                referrer.locked_reward -= debited;
                debited
            }
            None => 0,
        };
        let mut stored = record.clone();
        stored.reward_amount = debited;
        self.records.insert(key, stored);
        self.touch(now);
        RecordOutcome::Applied { amount: debited }
    }

    /// Walks the sponsor chain upwards from `start`, stopping on a repeat.
    fn upline(&self, start: &str, limit: usize) -> Vec<Wallet> {
        let mut chain = Vec::new();
        let mut visited = BTreeSet::new();
        let mut node = start.to_string();
        while let Some(parent) = self.users.get(&node).and_then(|u| u.referrer.clone()) {
            if !visited.insert(parent.clone()) {
                break;
            }
            chain.push(parent.clone());
            if chain.len() >= limit {
                break;
            }
            node = parent;
        }
        chain
    }

    pub fn bind_referrer(&mut self, wallet: &str, referrer: &str, now: DateTime<Utc>) -> BindOutcome {
        if wallet == referrer {
            return BindOutcome::SelfReferral;
        }
        if let Some(existing) = self.users.get(wallet).and_then(|u| u.referrer.clone()) {
            if existing == referrer {
                return BindOutcome::Unchanged;
            }
            return BindOutcome::AlreadyBound { existing };
        }
        let upline = self.upline(referrer, MAX_UPLINE_DEPTH);
        if upline.len() >= MAX_UPLINE_DEPTH || upline.iter().any(|w| w == wallet) {
            return BindOutcome::WouldCycle;
        }

        self.users
            .entry(wallet.to_string())
            .or_insert_with(|| UserRecord::new(wallet.to_string(), now))
            .referrer = Some(referrer.to_string());
        let sponsor = self
            .users
            .entry(referrer.to_string())
            .or_insert_with(|| UserRecord::new(referrer.to_string(), now));
        sponsor.referral_count = sponsor.referral_count.saturating_add(1);
        self.touch(now);
        BindOutcome::Bound
    }

    pub fn reserve_claim(
        &mut self,
        wallet: &str,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<ClaimReservation, LedgerError> {
        let user = self
            .users
            .get_mut(wallet)
            .ok_or_else(|| LedgerError::UnknownUser {
                wallet: wallet.to_string(),
            })?;
        if user.locked_reward < amount {
            return Err(LedgerError::InsufficientLocked {
                wallet: wallet.to_string(),
                available: user.locked_reward,
                requested: amount,
            });
        }
        user.locked_reward -= amount;
        user.total_claimed = user.total_claimed.saturating_add(amount);
        let previous_checkpoint = user.last_vesting_time.replace(now);
        self.touch(now);
        Ok(ClaimReservation {
            wallet: wallet.to_string(),
            amount,
            previous_checkpoint,
            reserved_at: now,
        })
    }

    /// Undoes a reservation whose payout was never broadcast.
    pub fn release_claim(
        &mut self,
        reservation: &ClaimReservation,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let user = self
            .users
            .get_mut(&reservation.wallet)
            .ok_or_else(|| LedgerError::UnknownUser {
                wallet: reservation.wallet.clone(),
            })?;
        user.locked_reward = user.locked_reward.saturating_add(reservation.amount);
        user.total_claimed = user.total_claimed.saturating_sub(reservation.amount);
        if user.last_vesting_time == Some(reservation.reserved_at) {
            user.last_vesting_time = reservation.previous_checkpoint;
        }
        self.touch(now);
        Ok(())
    }

    /// Top wallets by team volume, ties broken by wallet address.
    pub fn leaderboard(&self, limit: usize) -> Vec<UserRecord> {
        let mut users: Vec<&UserRecord> = self.users.values().collect();
        users.sort_by(|a, b| {
            b.team_volume
                .total_cmp(&a.team_volume)
                .then_with(|| a.wallet.cmp(&b.wallet))
        });
        users.into_iter().take(limit).cloned().collect()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            users: self.users.clone(),
            records: self.records.values().cloned().collect(),
            processed: self.processed.clone(),
            digest: self.digest(),
        }
    }

    /// Content digest over users, audit rows and processed signatures.
    /// Independent of `meta`, so replays that change nothing keep the digest.
    pub fn digest(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::new();
        for (wallet, user) in &self.users {
            let mut hasher = Sha256::new();
            hasher.update(b"user");
            hasher.update(wallet.as_bytes());
            hasher.update(user.referrer.as_deref().unwrap_or("").as_bytes());
            hasher.update(user.locked_reward.to_le_bytes());
            hasher.update(user.total_claimed.to_le_bytes());
            hasher.update(user.total_earned.to_le_bytes());
            hasher.update(user.net_mgt_holding.to_le_bytes());
            hasher.update(user.max_mgt_holding.to_le_bytes());
            hasher.update(user.team_volume.to_bits().to_le_bytes());
            hasher.update(user.referral_count.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        for ((signature, buyer), record) in &self.records {
            let mut hasher = Sha256::new();
            hasher.update(b"record");
            hasher.update(signature.as_bytes());
            hasher.update(buyer.as_bytes());
            hasher.update(record.referrer.as_bytes());
            hasher.update(record.token_amount.to_le_bytes());
            hasher.update(record.reward_amount.to_le_bytes());
            hasher.update([record.status as u8]);
            leaves.push(hasher.finalize().into());
        }
        for signature in &self.processed {
            let mut hasher = Sha256::new();
            hasher.update(b"sig");
            hasher.update(signature.as_bytes());
            leaves.push(hasher.finalize().into());
        }
        build_merkle(leaves)
    }
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"referral-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len().div_ceil(2));
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

mod hex_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("digest must be 32 bytes"))
    }
}
