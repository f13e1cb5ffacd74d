// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Queue consumer that applies chain events to the ledger.

use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::U256;
use async_trait::async_trait;

use super::EventJob;
use crate::chain::amount::units_to_decimal;
use crate::chain::{AdapterRegistry, EventKind};
use crate::ledger::models::TxType;
use crate::ledger::{EventOutcome, EventRecord, LedgerStore};
use crate::queue::{JobHandler, JobResult};
use crate::tokens::TokenRegistry;

pub struct EventConsumer {
    ledger: Arc<LedgerStore>,
    adapters: Arc<AdapterRegistry>,
    tokens: Arc<TokenRegistry>,
}

impl EventConsumer {
    pub fn new(
        ledger: Arc<LedgerStore>,
        adapters: Arc<AdapterRegistry>,
        tokens: Arc<TokenRegistry>,
    ) -> Self {
        Self {
            ledger,
            adapters,
            tokens,
        }
    }
}

#[async_trait]
impl JobHandler<EventJob> for EventConsumer {
    async fn handle(&self, job: &EventJob) -> JobResult {
        let (tx_type, description) = match job.kind {
            EventKind::Deposit => (TxType::Credit, "Deposit"),
            EventKind::Withdrawal => (TxType::Debit, "Withdrawal"),
        };

        // Fast path for redelivered jobs; record_event re-checks inside
        // its own transaction.
        if self.ledger.has_event(&job.tx_hash, tx_type)? {
            tracing::debug!(tx_hash = %job.tx_hash, "Event already recorded, skipping");
            return Ok(());
        }

        let adapter = self
            .adapters
            .get(&job.chain_key)
            .ok_or_else(|| format!("no adapter for chain {}", job.chain_key))?;

        let Some(balance) = self
            .ledger
            .find_balance_by_address(job.token_id, &job.wallet_address)?
        else {
            // Vault traffic for an address the ledger never issued.
            tracing::warn!(
                chain = %job.chain_key,
                address = %job.wallet_address,
                tx_hash = %job.tx_hash,
                "Event for unknown wallet address, dropping"
            );
            return Ok(());
        };

        let units = U256::from_str(&job.amount_units)
            .map_err(|e| format!("bad amount in job: {e}"))?;
        let amount = units_to_decimal(units, adapter.decimals());

        let (from_address, to_address) = match job.kind {
            EventKind::Deposit => (None, Some(balance.wallet_address.clone())),
            EventKind::Withdrawal => (Some(balance.wallet_address.clone()), None),
        };

        let outcome = self.ledger.record_event(EventRecord {
            user_id: balance.user_id.clone(),
            token_id: job.token_id,
            tx_type,
            amount,
            tx_hash: job.tx_hash.clone(),
            price: self.tokens.price(job.token_id),
            from_address,
            to_address,
            description: description.to_string(),
            extra: Some(serde_json::json!({
                "source": "listener",
                "chain": job.chain_key,
                "block_number": job.block_number,
            })),
        })?;

        match outcome {
            EventOutcome::Applied(tx) => {
                tracing::info!(
                    chain = %job.chain_key,
                    user_id = %balance.user_id,
                    reference = %tx.reference,
                    amount,
                    "Applied chain event"
                );
                let symbol = self
                    .tokens
                    .by_id(job.token_id)
                    .map(|t| t.symbol)
                    .unwrap_or("?");
                let message = match job.kind {
                    EventKind::Deposit => format!("You received {amount} {symbol}"),
                    EventKind::Withdrawal => format!("You sent {amount} {symbol}"),
                };
                if let Err(e) = self.ledger.create_notification(&balance.user_id, &message) {
                    tracing::warn!(error = %e, "Failed to write event notification");
                }
            }
            EventOutcome::Duplicate(reference) => {
                tracing::debug!(tx_hash = %job.tx_hash, reference, "Event raced a duplicate");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChainAdapter;
    use crate::chain::ChainAdapter;

    fn consumer_fixture() -> (tempfile::TempDir, Arc<LedgerStore>, EventConsumer) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(LedgerStore::open(&dir.path().join("ledger.redb")).unwrap());
        let mut adapters = AdapterRegistry::new();
        adapters.insert(Arc::new(MockChainAdapter::new("LSK", 18)) as Arc<dyn ChainAdapter>);
        let consumer = EventConsumer::new(
            ledger.clone(),
            Arc::new(adapters),
            Arc::new(TokenRegistry::default()),
        );
        (dir, ledger, consumer)
    }

    fn deposit_job(wallet: &str, hash: &str) -> EventJob {
        EventJob {
            chain_key: "LSK".to_string(),
            token_id: 2,
            kind: EventKind::Deposit,
            wallet_address: wallet.to_string(),
            // 2.5 tokens at 18 decimals.
            amount_units: "2500000000000000000".to_string(),
            tx_hash: hash.to_string(),
            block_number: 42,
        }
    }

    #[tokio::test]
    async fn replayed_event_credits_exactly_once() {
        let (_dir, ledger, consumer) = consumer_fixture();
        let user = ledger.create_user("alice").unwrap();
        ledger.get_or_create_balance(&user.id, 2, "0xdeadbeef").unwrap();

        let job = deposit_job("0xDEADBEEF", "0xevent1");
        consumer.handle(&job).await.unwrap();
        consumer.handle(&job).await.unwrap();

        let balance = ledger.get_balance(&user.id, 2).unwrap().unwrap();
        assert!((balance.amount - 2.5).abs() < 1e-9);
        assert_eq!(ledger.list_transactions_for_user(&user.id, 10).unwrap().len(), 1);
        assert_eq!(ledger.list_notifications(&user.id, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn withdrawal_debits_the_balance() {
        let (_dir, ledger, consumer) = consumer_fixture();
        let user = ledger.create_user("bob").unwrap();
        ledger.get_or_create_balance(&user.id, 2, "0xcafe").unwrap();
        ledger.apply_delta(&user.id, 2, 10.0, 0.0).unwrap();

        let mut job = deposit_job("0xcafe", "0xevent2");
        job.kind = EventKind::Withdrawal;
        consumer.handle(&job).await.unwrap();

        let balance = ledger.get_balance(&user.id, 2).unwrap().unwrap();
        assert!((balance.amount - 7.5).abs() < 1e-9);
        let txs = ledger.list_transactions_for_user(&user.id, 10).unwrap();
        assert_eq!(txs[0].tx_type, TxType::Debit);
    }

    #[tokio::test]
    async fn unknown_address_is_dropped_not_retried() {
        let (_dir, ledger, consumer) = consumer_fixture();

        let job = deposit_job("0xnobody", "0xevent3");
        // Ok means the queue will not redeliver.
        consumer.handle(&job).await.unwrap();
        assert!(!ledger.has_event("0xevent3", TxType::Credit).unwrap());
    }

    #[tokio::test]
    async fn orchestrated_transfer_hash_is_not_double_counted() {
        let (_dir, ledger, consumer) = consumer_fixture();
        let sender = ledger.create_user("carol").unwrap();
        let receiver = ledger.create_user("dan").unwrap();
        ledger.get_or_create_balance(&sender.id, 2, "0xaaa").unwrap();
        ledger.get_or_create_balance(&receiver.id, 2, "0xbbb").unwrap();
        ledger.apply_delta(&sender.id, 2, 5.0, 0.0).unwrap();

        ledger
            .record_transfer(crate::ledger::TransferRecord {
                debit: crate::ledger::TransferLeg {
                    user_id: sender.id.clone(),
                    token_id: 2,
                    amount: 2.5,
                    description: "Transfer to @dan".to_string(),
                },
                credit: crate::ledger::TransferLeg {
                    user_id: receiver.id.clone(),
                    token_id: 2,
                    amount: 2.5,
                    description: "Transfer from @carol".to_string(),
                },
                tx_hash: "0xxferhash".to_string(),
                price: 0.0,
                from_address: None,
                to_address: None,
            })
            .unwrap();

        // The listener later observes the same movement on-chain.
        let mut deposit = deposit_job("0xbbb", "0xxferhash");
        deposit.kind = EventKind::Deposit;
        consumer.handle(&deposit).await.unwrap();

        let receiver_balance = ledger.get_balance(&receiver.id, 2).unwrap().unwrap();
        assert!((receiver_balance.amount - 2.5).abs() < 1e-9);
    }
}
