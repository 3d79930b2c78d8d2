//! Reward accrual: webhook batch → per-wallet net change → high-water-mark
//! credit or sell-side clawback for the wallet's referrer.

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    ledger::{apply_bps, Amount, RecordOutcome, RecordStatus, RewardRecord, TokenScale},
    locks::WalletLocks,
    oracle::PriceSource,
    store::{LedgerStore, StoreError},
};

mod webhook;

pub use webhook::{
    aggregate, parse_batch, NetChange, ParsedBatch, TokenTransfer, UiAmount, WebhookTransaction,
};

#[derive(Clone, Debug)]
pub struct AccrualPolicy {
    pub mint: String,
    pub scale: TokenScale,
    pub reward_rate_bps: u32,
    pub dust_usd: f64,
    pub concurrency: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Settlement {
    Dust,
    UnknownWallet,
    /// Holding persisted, nothing owed either way.
    HoldingOnly,
    Credited { referrer: String, reward: Amount },
    ClawedBack { referrer: String, debited: Amount },
    Duplicate,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct BatchReport {
    pub received: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub failed_transactions: usize,
    pub wallets: usize,
    pub dust: usize,
    pub unknown: usize,
    pub holding_only: usize,
    pub credited: usize,
    pub clawbacks: usize,
    pub duplicate_records: usize,
    pub rewards_total: Amount,
    pub clawed_back_total: Amount,
    pub errors: usize,
    pub price_usd: Option<f64>,
    pub price_fallback: bool,
}

impl BatchReport {
    fn absorb(&mut self, settlement: &Settlement) {
        match settlement {
            Settlement::Dust => self.dust += 1,
            Settlement::UnknownWallet => self.unknown += 1,
            Settlement::HoldingOnly => self.holding_only += 1,
            Settlement::Credited { reward, .. } => {
                self.credited += 1;
                self.rewards_total += reward;
            }
            Settlement::ClawedBack { debited, .. } => {
                self.clawbacks += 1;
                self.clawed_back_total += debited;
            }
            Settlement::Duplicate => self.duplicate_records += 1,
        }
    }
}

pub struct AccrualEngine<S, P> {
    store: Arc<S>,
    prices: Arc<P>,
    locks: WalletLocks,
    policy: AccrualPolicy,
}

impl<S, P> Clone for AccrualEngine<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            prices: self.prices.clone(),
            locks: self.locks.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<S: LedgerStore, P: PriceSource> AccrualEngine<S, P> {
    pub fn new(store: Arc<S>, prices: Arc<P>, locks: WalletLocks, policy: AccrualPolicy) -> Self {
        Self {
            store,
            prices,
            locks,
            policy,
        }
    }

    pub fn policy(&self) -> &AccrualPolicy {
        &self.policy
    }

    /// Processes one delivery. Never fails: problems are logged and counted in the report.
    pub async fn process_batch(&self, batch: impl Into<ParsedBatch>) -> BatchReport {
        let now = Utc::now();
        let ParsedBatch {
            transactions: batch,
            malformed,
        } = batch.into();
        let mut report = BatchReport {
            received: batch.len(),
            malformed,
            ..BatchReport::default()
        };

        // first occurrence of each signature only
        let mut seen = BTreeSet::new();
        let batch: Vec<WebhookTransaction> = batch
            .into_iter()
            .filter(|tx| seen.insert(tx.signature.clone()))
            .collect();
        let signatures: Vec<String> = batch.iter().map(|tx| tx.signature.clone()).collect();

        let fresh = match self.store.claim_signatures(&signatures, now).await {
            Ok(fresh) => fresh.into_iter().collect::<BTreeSet<_>>(),
            Err(err) => {
                error!(error = %err, signatures = signatures.len(), "processed-signature log unavailable, batch dropped");
                report.errors += 1;
                return report;
            }
        };
        report.duplicates = report.received - fresh.len();

        let live: Vec<WebhookTransaction> = batch
            .into_iter()
            .filter(|tx| fresh.contains(&tx.signature))
            .filter(|tx| {
                if tx.failed() {
                    report.failed_transactions += 1;
                    false
                } else {
                    true
                }
            })
            .collect();

        let changes = aggregate(&live, &self.policy.mint, self.policy.scale);
        report.wallets = changes.len();
        if changes.is_empty() {
            debug!(received = report.received, duplicates = report.duplicates, "batch has no tracked transfers");
            return report;
        }

        let quote = self.prices.quote().await;
        report.price_usd = Some(quote.price_usd);
        report.price_fallback = quote.fallback;

        let price_usd = quote.price_usd;
        let results: Vec<(NetChange, Result<Settlement, StoreError>)> = stream::iter(changes)
            .map(|change| {
                let engine = self.clone();
                async move {
                    let outcome = engine.settle(&change, price_usd, now).await;
                    (change, outcome)
                }
            })
            .buffer_unordered(self.policy.concurrency.max(1))
            .collect()
            .await;

        for (change, outcome) in results {
            match outcome {
                Ok(settlement) => report.absorb(&settlement),
                Err(err) => {
                    error!(wallet = %change.wallet, delta = change.delta, signature = %change.last_signature, error = %err, "wallet settlement failed");
                    report.errors += 1;
                }
            }
        }
        self.locks.prune();

        info!(
            received = report.received,
            malformed = report.malformed,
            duplicates = report.duplicates,
            wallets = report.wallets,
            credited = report.credited,
            clawbacks = report.clawbacks,
            rewards_total = report.rewards_total,
            errors = report.errors,
            price_usd = quote.price_usd,
            fallback = quote.fallback,
            "webhook batch settled"
        );
        report
    }

    /// Settles one wallet while holding its lock.
    pub async fn settle(
        &self,
        change: &NetChange,
        price_usd: f64,
        now: DateTime<Utc>,
    ) -> Result<Settlement, StoreError> {
        let _guard = self.locks.acquire(&change.wallet).await;
        let scale = self.policy.scale;
        let change_usd = scale.usd_value(change.delta, price_usd).abs();
        if change_usd < self.policy.dust_usd {
            return Ok(Settlement::Dust);
        }

        let Some(update) = self
            .store
            .apply_holding_delta(&change.wallet, change.delta, now)
            .await?
        else {
            return Ok(Settlement::UnknownWallet);
        };
        let Some(referrer) = update.referrer.clone() else {
            return Ok(Settlement::HoldingOnly);
        };

        if change.delta > 0 {
            let rewardable = update.rewardable();
            if rewardable == 0 {
                debug!(wallet = %change.wallet, holding = update.holding, max = update.max, "rebuy below high-water mark");
                return Ok(Settlement::HoldingOnly);
            }
            let volume_usd = scale.usd_value(rewardable as i64, price_usd);
            if volume_usd < self.policy.dust_usd {
                return Ok(Settlement::HoldingOnly);
            }
            let record = RewardRecord {
                signature: change.last_signature.clone(),
                buyer: change.wallet.clone(),
                referrer: referrer.clone(),
                token_amount: rewardable,
                reward_amount: apply_bps(rewardable, self.policy.reward_rate_bps),
                usd_value: volume_usd,
                status: RecordStatus::Reward,
                created_at: now,
            };
            match self.store.credit_referrer(&record, now).await? {
                RecordOutcome::Applied { amount } => {
                    info!(wallet = %change.wallet, referrer = %referrer, rewardable, reward = amount, volume_usd, signature = %record.signature, "referrer credited");
                    Ok(Settlement::Credited {
                        referrer,
                        reward: amount,
                    })
                }
                RecordOutcome::Duplicate => {
                    debug!(signature = %record.signature, wallet = %change.wallet, "reward row already recorded");
                    Ok(Settlement::Duplicate)
                }
            }
        } else {
            let sold = change.delta.unsigned_abs();
            let record = RewardRecord {
                signature: change.last_signature.clone(),
                buyer: change.wallet.clone(),
                referrer: referrer.clone(),
                token_amount: sold,
                reward_amount: apply_bps(sold, self.policy.reward_rate_bps),
                usd_value: change_usd,
                status: RecordStatus::Clawback,
                created_at: now,
            };
            match self.store.debit_referrer(&record, now).await? {
                RecordOutcome::Applied { amount } => {
                    if amount < record.reward_amount {
                        warn!(referrer = %referrer, penalty = record.reward_amount, debited = amount, "clawback clamped at zero");
                    }
                    info!(wallet = %change.wallet, referrer = %referrer, sold, debited = amount, signature = %record.signature, "referrer clawed back");
                    Ok(Settlement::ClawedBack {
                        referrer,
                        debited: amount,
                    })
                }
                RecordOutcome::Duplicate => Ok(Settlement::Duplicate),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ledger::Holding, oracle::FixedPrice, store::MemoryStore};

    const MINT: &str = "59eXaVJNG441QW54NTmpeDpXEzkuaRjSLm8M6N4Gpump";
    const TOKEN: Amount = 1_000_000;

    fn engine(store: &Arc<MemoryStore>) -> AccrualEngine<MemoryStore, FixedPrice> {
        AccrualEngine::new(
            store.clone(),
            Arc::new(FixedPrice(0.0001)),
            WalletLocks::new(),
            AccrualPolicy {
                mint: MINT.into(),
                scale: TokenScale::new(6),
                reward_rate_bps: 500,
                dust_usd: 0.01,
                concurrency: 4,
            },
        )
    }

    fn transfer(signature: &str, amount: f64, from: &str, to: &str) -> WebhookTransaction {
        WebhookTransaction {
            signature: signature.into(),
            transaction_error: None,
            token_transfers: Some(vec![TokenTransfer {
                mint: MINT.into(),
                token_amount: UiAmount::Number(amount),
                from_user_account: Some(from.into()),
                to_user_account: Some(to.into()),
            }]),
        }
    }

    async fn setup() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store.upsert_user("B", now).await.unwrap();
        store.bind_referrer("C", "R", now).await.unwrap();
        store
    }

    #[tokio::test]
    async fn buyer_without_referrer_only_moves_holdings() {
        let store = setup().await;
        let report = engine(&store)
            .process_batch(vec![transfer("b-1", 1000.0, "pool", "B")])
            .await;
        assert_eq!(report.unknown, 1); // the pool
        assert_eq!(report.holding_only, 1);
        let b = store.user("B").await.unwrap().unwrap();
        assert_eq!(b.net_mgt_holding, 1000 * TOKEN as Holding);
        assert_eq!(b.max_mgt_holding, 1000 * TOKEN as Holding);
        assert!(store.records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_buy_credits_referrer_once() {
        let store = setup().await;
        let report = engine(&store)
            .process_batch(vec![transfer("c-1", 1000.0, "pool", "C")])
            .await;
        assert_eq!(report.credited, 1);
        let r = store.user("R").await.unwrap().unwrap();
        assert_eq!(r.locked_reward, 50 * TOKEN);
        assert!((r.team_volume - 0.10).abs() < 1e-9);
        let records = store.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].signature, "c-1");
        assert_eq!(records[0].status, RecordStatus::Reward);
    }

    #[tokio::test]
    async fn replayed_batch_changes_nothing() {
        let store = setup().await;
        let engine = engine(&store);
        let batch = vec![
            transfer("c-1", 1000.0, "pool", "C"),
            transfer("c-2", 400.0, "C", "pool"),
        ];
        engine.process_batch(batch.clone()).await;
        let digest = store.digest().unwrap();
        let report = engine.process_batch(batch).await;
        assert_eq!(report.duplicates, 2);
        assert_eq!(report.wallets, 0);
        assert_eq!(store.digest().unwrap(), digest);
    }

    #[tokio::test]
    async fn rebuy_below_peak_earns_nothing() {
        let store = setup().await;
        let engine = engine(&store);
        engine.process_batch(vec![transfer("s1", 1000.0, "pool", "C")]).await;
        engine.process_batch(vec![transfer("s2", 1000.0, "C", "pool")]).await;
        let c = store.user("C").await.unwrap().unwrap();
        assert_eq!(c.net_mgt_holding, 0);
        assert_eq!(c.max_mgt_holding, 1000 * TOKEN as Holding);

        let report = engine.process_batch(vec![transfer("s3", 1000.0, "pool", "C")]).await;
        assert_eq!(report.credited, 0);
        assert_eq!(report.holding_only, 1);
        let r = store.user("R").await.unwrap().unwrap();
        assert_eq!(r.total_earned, 50 * TOKEN);
    }

    #[tokio::test]
    async fn sell_rebuy_then_new_peak_scenario() {
        let store = setup().await;
        let engine = engine(&store);
        engine.process_batch(vec![transfer("buy", 1000.0, "pool", "C")]).await;

        let report = engine.process_batch(vec![transfer("sell", 1000.0, "C", "pool")]).await;
        assert_eq!(report.clawbacks, 1);
        assert_eq!(report.clawed_back_total, 50 * TOKEN);
        assert_eq!(store.user("R").await.unwrap().unwrap().locked_reward, 0);

        engine.process_batch(vec![transfer("rebuy", 600.0, "pool", "C")]).await;
        assert_eq!(store.user("R").await.unwrap().unwrap().total_earned, 50 * TOKEN);

        let report = engine.process_batch(vec![transfer("top-up", 500.0, "pool", "C")]).await;
        assert_eq!(report.credited, 1);
        assert_eq!(report.rewards_total, 5 * TOKEN);

        let c = store.user("C").await.unwrap().unwrap();
        assert_eq!(c.net_mgt_holding, 1100 * TOKEN as Holding);
        assert_eq!(c.max_mgt_holding, 1100 * TOKEN as Holding);
        let r = store.user("R").await.unwrap().unwrap();
        assert_eq!(r.locked_reward, 5 * TOKEN);
        assert_eq!(r.total_earned, 55 * TOKEN);
        let top_up = store
            .records()
            .unwrap()
            .into_iter()
            .find(|rec| rec.signature == "top-up")
            .unwrap();
        assert_eq!(top_up.token_amount, 100 * TOKEN);
        assert_eq!(top_up.reward_amount, 5 * TOKEN);
    }

    #[tokio::test]
    async fn dust_changes_leave_ledger_untouched() {
        let store = setup().await;
        // 50 tokens at $0.0001 = $0.005
        let report = engine(&store)
            .process_batch(vec![transfer("tiny", 50.0, "pool", "C")])
            .await;
        assert_eq!(report.dust, 2);
        let c = store.user("C").await.unwrap().unwrap();
        assert_eq!(c.net_mgt_holding, 0);
        assert_eq!(c.max_mgt_holding, 0);
        assert_eq!(store.user("R").await.unwrap().unwrap().locked_reward, 0);
    }

    #[tokio::test]
    async fn high_water_mark_never_decreases() {
        let store = setup().await;
        let engine = engine(&store);
        let moves: [(f64, bool); 6] = [
            (300.0, true),
            (200.0, false),
            (150.0, true),
            (500.0, false),
            (900.0, true),
            (100.0, false),
        ];
        let mut last_max = 0;
        for (idx, (amount, buy)) in moves.into_iter().enumerate() {
            let sig = format!("m-{idx}");
            let tx = if buy {
                transfer(&sig, amount, "pool", "C")
            } else {
                transfer(&sig, amount, "C", "pool")
            };
            engine.process_batch(vec![tx]).await;
            let c = store.user("C").await.unwrap().unwrap();
            assert!(c.max_mgt_holding >= last_max);
            assert!(c.max_mgt_holding >= c.net_mgt_holding);
            last_max = c.max_mgt_holding;
        }
        assert_eq!(last_max, 650 * TOKEN as Holding);
    }

    #[tokio::test]
    async fn failed_transactions_are_logged_but_not_settled() {
        let store = setup().await;
        let mut tx = transfer("boom", 1000.0, "pool", "C");
        tx.transaction_error = Some(serde_json::json!({"InstructionError": [0, "Custom"]}));
        let report = engine(&store).process_batch(vec![tx.clone()]).await;
        assert_eq!(report.failed_transactions, 1);
        assert_eq!(store.user("C").await.unwrap().unwrap().net_mgt_holding, 0);
        let again = engine(&store).process_batch(vec![tx]).await;
        assert_eq!(again.duplicates, 1);
    }

    #[tokio::test]
    async fn malformed_descriptors_are_counted_in_the_report() {
        let store = setup().await;
        let body = serde_json::to_vec(&serde_json::json!([
            { "transactionError": null },
            {
                "signature": "good",
                "transactionError": null,
                "tokenTransfers": [{
                    "mint": MINT,
                    "tokenAmount": 1000.0,
                    "fromUserAccount": "pool",
                    "toUserAccount": "C"
                }]
            }
        ]))
        .unwrap();
        let report = engine(&store)
            .process_batch(parse_batch(&body).unwrap())
            .await;
        assert_eq!(report.malformed, 1);
        assert_eq!(report.received, 1);
        assert_eq!(report.credited, 1);
    }

    #[tokio::test]
    async fn concurrent_batches_for_one_wallet_do_not_lose_updates() {
        let store = setup().await;
        let engine = engine(&store);
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .process_batch(vec![transfer(&format!("p-{i}"), 250.0, "pool", "C")])
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        let c = store.user("C").await.unwrap().unwrap();
        assert_eq!(c.net_mgt_holding, 2000 * TOKEN as Holding);
        let r = store.user("R").await.unwrap().unwrap();
        assert_eq!(r.locked_reward, 100 * TOKEN);
    }
}
