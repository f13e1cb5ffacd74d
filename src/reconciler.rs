// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Background balance reconciler.
//!
//! ## Strategy
//!
//! Every cycle the reconciler takes a TTL lock, walks the whole balance
//! table in small batches, reads each balance's on-chain counterpart, and
//! corrects any drift beyond a float-noise epsilon by appending a ledger
//! entry. Corrections are ordinary entries with a synthetic `recon-` hash,
//! so the audit trail shows exactly when and by how much the ledger was
//! pulled back in line.
//!
//! Balances with an in-flight transfer marker are skipped for the cycle:
//! a half-settled transfer looks like drift but is not.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chain::AdapterRegistry;
use crate::ledger::lock::SweepLockGuard;
use crate::ledger::models::{Balance, TxType};
use crate::ledger::{EventOutcome, EventRecord, LedgerResult, LedgerStore, BALANCE_EPSILON};
use crate::retry;
use crate::tokens::TokenRegistry;

/// Name of the cross-process sweep lock.
const RECONCILER_LOCK: &str = "reconciler_sweep";

/// On-chain reads issued concurrently per batch.
const BATCH_SIZE: usize = 5;

/// Per-cycle counters, logged at the end of each sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub checked: u64,
    pub corrected: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug)]
pub enum SweepOutcome {
    Completed(SweepStats),
    /// Another worker holds the sweep lock; nothing was done.
    LockHeld,
}

pub struct BalanceReconciler {
    ledger: Arc<LedgerStore>,
    adapters: Arc<AdapterRegistry>,
    tokens: Arc<TokenRegistry>,
    interval: Duration,
    lock_ttl: Duration,
}

impl BalanceReconciler {
    pub fn new(
        ledger: Arc<LedgerStore>,
        adapters: Arc<AdapterRegistry>,
        tokens: Arc<TokenRegistry>,
        interval: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            ledger,
            adapters,
            tokens,
            interval,
            lock_ttl,
        }
    }

    /// Run the sweep loop until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Balance reconciler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Balance reconciler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.sweep().await {
                Ok(SweepOutcome::Completed(stats)) => {
                    tracing::info!(
                        checked = stats.checked,
                        corrected = stats.corrected,
                        skipped = stats.skipped,
                        failed = stats.failed,
                        "Reconciliation sweep complete"
                    );
                }
                Ok(SweepOutcome::LockHeld) => {
                    tracing::debug!("Reconciliation sweep skipped, lock held elsewhere");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Reconciliation sweep failed");
                }
            }
        }
    }

    /// One full pass over the balance table.
    pub async fn sweep(&self) -> LedgerResult<SweepOutcome> {
        let Some(_guard) =
            SweepLockGuard::acquire(self.ledger.clone(), RECONCILER_LOCK, self.lock_ttl)?
        else {
            return Ok(SweepOutcome::LockHeld);
        };

        let balances = self.ledger.all_balances()?;
        let mut stats = SweepStats::default();

        for batch in balances.chunks(BATCH_SIZE) {
            let checks = batch.iter().map(|balance| self.check_balance(balance));
            for result in futures::future::join_all(checks).await {
                match result {
                    CheckResult::Clean => stats.checked += 1,
                    CheckResult::Corrected => {
                        stats.checked += 1;
                        stats.corrected += 1;
                    }
                    CheckResult::Skipped => stats.skipped += 1,
                    CheckResult::Failed => stats.failed += 1,
                }
            }
        }

        Ok(SweepOutcome::Completed(stats))
    }

    async fn check_balance(&self, balance: &Balance) -> CheckResult {
        match self.try_check_balance(balance).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    user_id = %balance.user_id,
                    token_id = balance.token_id,
                    error = %e,
                    "Balance check failed"
                );
                CheckResult::Failed
            }
        }
    }

    async fn try_check_balance(
        &self,
        balance: &Balance,
    ) -> Result<CheckResult, Box<dyn std::error::Error + Send + Sync>> {
        if self.ledger.is_in_flight(&balance.user_id, balance.token_id)? {
            return Ok(CheckResult::Skipped);
        }

        let token = self
            .tokens
            .by_id(balance.token_id)
            .ok_or_else(|| format!("unknown token id {}", balance.token_id))?;
        let adapter = self
            .adapters
            .get(token.symbol)
            .ok_or_else(|| format!("no adapter for {}", token.symbol))?;
        let user = self
            .ledger
            .get_user(&balance.user_id)?
            .ok_or_else(|| format!("orphan balance for user {}", balance.user_id))?;

        let observed = retry::with_backoff(
            "reconciler balance read",
            retry::DEFAULT_ATTEMPTS,
            retry::DEFAULT_BASE_DELAY,
            || adapter.get_balance(&user.tag),
        )
        .await?;

        let drift = observed - balance.amount;
        if drift.abs() <= BALANCE_EPSILON {
            return Ok(CheckResult::Clean);
        }

        // In-flight may have been set while we were reading the chain.
        if self.ledger.is_in_flight(&balance.user_id, balance.token_id)? {
            return Ok(CheckResult::Skipped);
        }

        let (tx_type, description) = if drift > 0.0 {
            (TxType::Credit, "Deposit")
        } else {
            (TxType::Debit, "Withdrawal")
        };
        let (from_address, to_address) = match tx_type {
            TxType::Credit => (None, Some(balance.wallet_address.clone())),
            TxType::Debit => (Some(balance.wallet_address.clone()), None),
        };

        tracing::info!(
            user_id = %balance.user_id,
            token = token.symbol,
            ledger = balance.amount,
            observed,
            drift,
            "Correcting ledger drift"
        );

        let outcome = self.ledger.record_event(EventRecord {
            user_id: balance.user_id.clone(),
            token_id: balance.token_id,
            tx_type,
            amount: drift.abs(),
            tx_hash: format!("recon-{}", Uuid::new_v4()),
            price: self.tokens.price(balance.token_id),
            from_address,
            to_address,
            description: description.to_string(),
            extra: Some(serde_json::json!({
                "source": "reconciler",
                "observed": observed,
                "ledger": balance.amount,
            })),
        })?;

        if matches!(outcome, EventOutcome::Applied(_)) {
            let message = format!(
                "{description} of {:.8} {} detected on-chain",
                drift.abs(),
                token.symbol
            );
            if let Err(e) = self.ledger.create_notification(&balance.user_id, &message) {
                tracing::warn!(error = %e, "Failed to write reconciliation notification");
            }
        }
        Ok(CheckResult::Corrected)
    }
}

enum CheckResult {
    Clean,
    Corrected,
    Skipped,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChainAdapter;
    use crate::chain::ChainAdapter;

    struct Fixture {
        _dir: tempfile::TempDir,
        ledger: Arc<LedgerStore>,
        adapter: Arc<MockChainAdapter>,
        reconciler: BalanceReconciler,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(LedgerStore::open(&dir.path().join("ledger.redb")).unwrap());
        let adapter = Arc::new(MockChainAdapter::new("STRK", 18));
        let mut adapters = AdapterRegistry::new();
        adapters.insert(adapter.clone() as Arc<dyn ChainAdapter>);
        let reconciler = BalanceReconciler::new(
            ledger.clone(),
            Arc::new(adapters),
            Arc::new(TokenRegistry::default()),
            Duration::from_secs(10),
            Duration::from_secs(15),
        );
        Fixture {
            _dir: dir,
            ledger,
            adapter,
            reconciler,
        }
    }

    fn seed(fixture: &Fixture, tag: &str, ledger_amount: f64, chain_amount: f64) -> String {
        let user = fixture.ledger.create_user(tag).unwrap();
        fixture
            .ledger
            .get_or_create_balance(&user.id, 1, &format!("0x{tag}"))
            .unwrap();
        if ledger_amount != 0.0 {
            fixture
                .ledger
                .apply_delta(&user.id, 1, ledger_amount, 0.0)
                .unwrap();
        }
        fixture.adapter.set_balance(&user.tag, chain_amount);
        user.id
    }

    #[tokio::test]
    async fn drift_up_is_credited() {
        let fx = fixture();
        let user_id = seed(&fx, "alice", 100.0, 130.0);

        let outcome = fx.reconciler.sweep().await.unwrap();
        let SweepOutcome::Completed(stats) = outcome else {
            panic!("lock unexpectedly held")
        };
        assert_eq!(stats.corrected, 1);

        let balance = fx.ledger.get_balance(&user_id, 1).unwrap().unwrap();
        assert!((balance.amount - 130.0).abs() < 1e-9);

        let txs = fx.ledger.list_transactions_for_user(&user_id, 10).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].tx_type, TxType::Credit);
        assert!(txs[0].tx_hash.as_deref().unwrap().starts_with("recon-"));
    }

    #[tokio::test]
    async fn drift_down_is_debited() {
        let fx = fixture();
        let user_id = seed(&fx, "bob", 100.0, 60.0);

        fx.reconciler.sweep().await.unwrap();

        let balance = fx.ledger.get_balance(&user_id, 1).unwrap().unwrap();
        assert!((balance.amount - 60.0).abs() < 1e-9);
        let txs = fx.ledger.list_transactions_for_user(&user_id, 10).unwrap();
        assert_eq!(txs[0].tx_type, TxType::Debit);
        assert!((txs[0].amount - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn float_noise_is_ignored() {
        let fx = fixture();
        let user_id = seed(&fx, "carol", 100.0, 100.0 + 1e-12);

        let SweepOutcome::Completed(stats) = fx.reconciler.sweep().await.unwrap() else {
            panic!("lock unexpectedly held")
        };
        assert_eq!(stats.corrected, 0);
        assert!(fx
            .ledger
            .list_transactions_for_user(&user_id, 10)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn in_flight_balances_are_skipped() {
        let fx = fixture();
        let user_id = seed(&fx, "dave", 100.0, 130.0);
        fx.ledger
            .mark_in_flight(&user_id, 1, Duration::from_secs(60))
            .unwrap();

        let SweepOutcome::Completed(stats) = fx.reconciler.sweep().await.unwrap() else {
            panic!("lock unexpectedly held")
        };
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.corrected, 0);

        let balance = fx.ledger.get_balance(&user_id, 1).unwrap().unwrap();
        assert!((balance.amount - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sweep_yields_when_lock_is_held() {
        let fx = fixture();
        seed(&fx, "erin", 100.0, 130.0);
        assert!(fx
            .ledger
            .try_acquire_lock(RECONCILER_LOCK, Duration::from_secs(60))
            .unwrap());

        assert!(matches!(
            fx.reconciler.sweep().await.unwrap(),
            SweepOutcome::LockHeld
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn read_failures_are_counted_not_fatal() {
        let fx = fixture();
        seed(&fx, "frank", 100.0, 130.0);
        fx.adapter
            .fail_reads
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let SweepOutcome::Completed(stats) = fx.reconciler.sweep().await.unwrap() else {
            panic!("lock unexpectedly held")
        };
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.corrected, 0);
    }
}
