// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Transfer orchestrator.
//!
//! Sequences a user-initiated transfer: validate against the ledger, mark
//! the touched balances in-flight, submit on-chain with retries, then write
//! the ledger legs atomically. The ledger's write transaction is the
//! authoritative funds check, so concurrent transfers cannot overdraw.
//! Withdrawals go through a `Pending` reservation that is settled with the
//! chain hash on success and refunded on failure. The in-flight markers keep
//! the reconciler from "correcting" a transfer that has settled on-chain but
//! not yet in the ledger; their TTL bounds the damage if the process dies
//! mid-way.

use std::sync::Arc;
use std::time::Duration;

use crate::chain::{AdapterRegistry, ChainAdapter, ChainError, Recipient};
use crate::ledger::models::{LedgerTransaction, User};
use crate::ledger::{
    LedgerError, LedgerStore, TransferLeg, TransferRecord, BALANCE_EPSILON,
};
use crate::retry;
use crate::tokens::TokenRegistry;

/// How long an in-flight marker outlives a crash before the reconciler may
/// touch the balance again.
const IN_FLIGHT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unknown user")]
    UnknownUser,

    #[error("no user owns tag @{0}")]
    UnknownTag(String),

    #[error("unknown token {0}")]
    UnknownToken(String),

    #[error("chain for {0} is not configured")]
    ChainUnavailable(String),

    #[error("cannot transfer to yourself")]
    SelfTransfer,

    #[error("invalid amount {0}")]
    InvalidAmount(f64),

    #[error("insufficient balance: have {available}, need {requested}")]
    InsufficientBalance { available: f64, requested: f64 },

    #[error("on-chain transfer failed: {0}")]
    OnchainTransfer(#[from] ChainError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub type TransferResult<T> = Result<T, TransferError>;

/// What a completed transfer produced.
#[derive(Debug)]
pub struct TransferOutcome {
    pub tx_hash: String,
    pub debit: LedgerTransaction,
    /// Present only for tag-to-tag transfers; external sends have no
    /// credit side in this ledger.
    pub credit: Option<LedgerTransaction>,
}

pub struct TransferOrchestrator {
    ledger: Arc<LedgerStore>,
    adapters: Arc<AdapterRegistry>,
    tokens: Arc<TokenRegistry>,
}

impl TransferOrchestrator {
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

    /// Transfer between two tags on the same chain.
    pub async fn send_to_tag(
        &self,
        sender_user_id: &str,
        recipient_tag: &str,
        token_symbol: &str,
        amount: f64,
    ) -> TransferResult<TransferOutcome> {
        let (token_id, adapter) = self.resolve_token(token_symbol)?;
        validate_amount(amount)?;

        let sender = self
            .ledger
            .get_user(sender_user_id)?
            .ok_or(TransferError::UnknownUser)?;
        let recipient = self
            .ledger
            .find_user_by_tag(recipient_tag)?
            .ok_or_else(|| TransferError::UnknownTag(recipient_tag.to_string()))?;
        if sender.id == recipient.id {
            return Err(TransferError::SelfTransfer);
        }

        self.check_funds(&sender.id, token_id, amount)?;

        // The recipient may have never held this token yet; the on-chain
        // registration is idempotent and yields their vault address.
        if self.ledger.get_balance(&recipient.id, token_id)?.is_none() {
            let address = retry::with_backoff(
                "tag registration",
                retry::DEFAULT_ATTEMPTS,
                retry::DEFAULT_BASE_DELAY,
                || adapter.register_tag(&recipient.tag),
            )
            .await?;
            self.ledger
                .get_or_create_balance(&recipient.id, token_id, &address)?;
        }

        self.ledger.mark_in_flight(&sender.id, token_id, IN_FLIGHT_TTL)?;
        self.ledger
            .mark_in_flight(&recipient.id, token_id, IN_FLIGHT_TTL)?;

        let result = self
            .submit_and_record_tag_transfer(&sender, &recipient, token_id, adapter.as_ref(), amount)
            .await;

        // Markers are cleared on every exit path; the TTL covers a crash
        // in between.
        self.clear_marker(&sender.id, token_id);
        self.clear_marker(&recipient.id, token_id);

        let (tx_hash, debit, credit) = result?;

        self.notify(
            &sender.id,
            &format!("You sent {amount} {token_symbol} to @{}", recipient.tag),
        );
        self.notify(
            &recipient.id,
            &format!("You received {amount} {token_symbol} from @{}", sender.tag),
        );

        tracing::info!(
            sender = %sender.tag,
            recipient = %recipient.tag,
            token = token_symbol,
            amount,
            tx_hash = %tx_hash,
            "Tag transfer complete"
        );

        Ok(TransferOutcome {
            tx_hash,
            debit,
            credit: Some(credit),
        })
    }

    /// Withdraw to an external wallet address.
    pub async fn send_to_wallet(
        &self,
        sender_user_id: &str,
        address: &str,
        token_symbol: &str,
        amount: f64,
    ) -> TransferResult<TransferOutcome> {
        let (token_id, adapter) = self.resolve_token(token_symbol)?;
        validate_amount(amount)?;

        let sender = self
            .ledger
            .get_user(sender_user_id)?
            .ok_or(TransferError::UnknownUser)?;

        self.ledger.mark_in_flight(&sender.id, token_id, IN_FLIGHT_TTL)?;

        let result = self
            .reserve_submit_settle(&sender, address, token_id, adapter.as_ref(), amount)
            .await;

        self.clear_marker(&sender.id, token_id);

        let (tx_hash, debit) = result?;
        self.notify(
            &sender.id,
            &format!("You sent {amount} {token_symbol} to {address}"),
        );

        tracing::info!(
            sender = %sender.tag,
            token = token_symbol,
            amount,
            tx_hash = %tx_hash,
            "Wallet withdrawal complete"
        );

        Ok(TransferOutcome {
            tx_hash,
            debit,
            credit: None,
        })
    }

    async fn submit_and_record_tag_transfer(
        &self,
        sender: &User,
        recipient: &User,
        token_id: u32,
        adapter: &dyn ChainAdapter,
        amount: f64,
    ) -> TransferResult<(String, LedgerTransaction, LedgerTransaction)> {
        let target = Recipient::Tag(recipient.tag.clone());
        let tx_hash = retry::with_backoff(
            "tag transfer",
            retry::DEFAULT_ATTEMPTS,
            retry::DEFAULT_BASE_DELAY,
            || adapter.transfer(&sender.tag, &target, amount),
        )
        .await?;

        let (debit, credit) = self
            .ledger
            .record_transfer(TransferRecord {
                debit: TransferLeg {
                    user_id: sender.id.clone(),
                    token_id,
                    amount,
                    description: format!("Transfer to @{}", recipient.tag),
                },
                credit: TransferLeg {
                    user_id: recipient.id.clone(),
                    token_id,
                    amount,
                    description: format!("Transfer from @{}", sender.tag),
                },
                tx_hash: tx_hash.clone(),
                price: self.tokens.price(token_id),
                from_address: self.vault_address(&sender.id, token_id)?,
                to_address: self.vault_address(&recipient.id, token_id)?,
            })
            .map_err(map_funds)?;
        Ok((tx_hash, debit, credit))
    }

    /// Reserve the funds, submit on-chain, then settle or refund.
    ///
    /// The reservation is a `Pending` debit written before submission, so
    /// two concurrent withdrawals serialize on the ledger's write
    /// transaction and the second one fails instead of overdrawing.
    async fn reserve_submit_settle(
        &self,
        sender: &User,
        address: &str,
        token_id: u32,
        adapter: &dyn ChainAdapter,
        amount: f64,
    ) -> TransferResult<(String, LedgerTransaction)> {
        let from_address = self.vault_address(&sender.id, token_id)?;
        let pending = self
            .ledger
            .record_pending_withdrawal(
                TransferLeg {
                    user_id: sender.id.clone(),
                    token_id,
                    amount,
                    description: format!("Withdrawal to {address}"),
                },
                self.tokens.price(token_id),
                from_address.as_deref(),
                Some(address),
            )
            .map_err(map_funds)?;

        let recipient = Recipient::Address(address.to_string());
        let submitted = retry::with_backoff(
            "wallet transfer",
            retry::DEFAULT_ATTEMPTS,
            retry::DEFAULT_BASE_DELAY,
            || adapter.transfer(&sender.tag, &recipient, amount),
        )
        .await;

        let tx_hash = match submitted {
            Ok(hash) => hash,
            Err(e) => {
                // Return the reserved funds before surfacing the failure.
                if let Err(refund_err) = self.ledger.fail_transaction(&pending.reference) {
                    tracing::error!(
                        reference = %pending.reference,
                        error = %refund_err,
                        "Failed to refund a rejected withdrawal reservation"
                    );
                }
                return Err(e.into());
            }
        };

        let debit = self.ledger.settle_transaction(&pending.reference, &tx_hash)?;
        Ok((tx_hash, debit))
    }

    fn vault_address(&self, user_id: &str, token_id: u32) -> TransferResult<Option<String>> {
        Ok(self
            .ledger
            .get_balance(user_id, token_id)?
            .map(|b| b.wallet_address))
    }

    fn resolve_token(
        &self,
        symbol: &str,
    ) -> TransferResult<(u32, Arc<dyn ChainAdapter>)> {
        let token = self
            .tokens
            .by_symbol(symbol)
            .ok_or_else(|| TransferError::UnknownToken(symbol.to_string()))?;
        let adapter = self
            .adapters
            .get(token.symbol)
            .ok_or_else(|| TransferError::ChainUnavailable(token.symbol.to_string()))?;
        Ok((token.id, adapter))
    }

    /// Early rejection before any chain traffic. Not authoritative: the
    /// ledger re-checks inside its write transaction when the legs land.
    fn check_funds(&self, user_id: &str, token_id: u32, amount: f64) -> TransferResult<()> {
        let available = self
            .ledger
            .get_balance(user_id, token_id)?
            .map(|b| b.amount)
            .unwrap_or(0.0);
        if available + BALANCE_EPSILON < amount {
            return Err(TransferError::InsufficientBalance {
                available,
                requested: amount,
            });
        }
        Ok(())
    }

    fn clear_marker(&self, user_id: &str, token_id: u32) {
        if let Err(e) = self.ledger.clear_in_flight(user_id, token_id) {
            tracing::warn!(user_id, token_id, error = %e, "Failed to clear in-flight marker");
        }
    }

    fn notify(&self, user_id: &str, message: &str) {
        if let Err(e) = self.ledger.create_notification(user_id, message) {
            tracing::warn!(user_id, error = %e, "Failed to write transfer notification");
        }
    }
}

fn validate_amount(amount: f64) -> TransferResult<()> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(TransferError::InvalidAmount(amount));
    }
    Ok(())
}

fn map_funds(e: LedgerError) -> TransferError {
    match e {
        LedgerError::InsufficientFunds {
            available,
            requested,
        } => TransferError::InsufficientBalance {
            available,
            requested,
        },
        other => TransferError::Ledger(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChainAdapter;
    use crate::ledger::models::{TxStatus, TxType};
    use std::sync::atomic::Ordering;

    struct Fixture {
        _dir: tempfile::TempDir,
        ledger: Arc<LedgerStore>,
        adapter: Arc<MockChainAdapter>,
        orchestrator: TransferOrchestrator,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(LedgerStore::open(&dir.path().join("ledger.redb")).unwrap());
        let adapter = Arc::new(MockChainAdapter::new("STRK", 18));
        let mut adapters = AdapterRegistry::new();
        adapters.insert(adapter.clone() as Arc<dyn ChainAdapter>);
        let orchestrator = TransferOrchestrator::new(
            ledger.clone(),
            Arc::new(adapters),
            Arc::new(TokenRegistry::default()),
        );
        Fixture {
            _dir: dir,
            ledger,
            adapter,
            orchestrator,
        }
    }

    fn funded_user(fx: &Fixture, tag: &str, amount: f64) -> String {
        let user = fx.ledger.create_user(tag).unwrap();
        fx.ledger
            .get_or_create_balance(&user.id, 1, &format!("0x{tag}"))
            .unwrap();
        if amount != 0.0 {
            fx.ledger.apply_delta(&user.id, 1, amount, 0.0).unwrap();
        }
        fx.adapter.set_balance(&user.tag, amount);
        user.id
    }

    #[tokio::test]
    async fn tag_transfer_writes_both_legs() {
        let fx = fixture();
        let alice = funded_user(&fx, "alice", 50.0);
        let bob = funded_user(&fx, "bob", 0.0);

        let outcome = fx
            .orchestrator
            .send_to_tag(&alice, "bob", "STRK", 20.0)
            .await
            .unwrap();

        assert!(outcome.tx_hash.starts_with("0xmocktx"));
        assert_eq!(outcome.credit.as_ref().unwrap().tx_type, TxType::Credit);

        let alice_balance = fx.ledger.get_balance(&alice, 1).unwrap().unwrap();
        let bob_balance = fx.ledger.get_balance(&bob, 1).unwrap().unwrap();
        assert!((alice_balance.amount - 30.0).abs() < 1e-9);
        assert!((bob_balance.amount - 20.0).abs() < 1e-9);

        // Markers were cleared, the chain saw exactly one submission.
        assert!(!fx.ledger.is_in_flight(&alice, 1).unwrap());
        assert!(!fx.ledger.is_in_flight(&bob, 1).unwrap());
        assert_eq!(fx.adapter.transfers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recipient_balance_row_is_created_on_first_receive() {
        let fx = fixture();
        let alice = funded_user(&fx, "alice", 50.0);
        // Bob exists but has never held STRK.
        let bob = fx.ledger.create_user("bob").unwrap();

        fx.orchestrator
            .send_to_tag(&alice, "bob", "STRK", 5.0)
            .await
            .unwrap();

        let bob_balance = fx.ledger.get_balance(&bob.id, 1).unwrap().unwrap();
        assert!((bob_balance.amount - 5.0).abs() < 1e-9);
        assert_eq!(bob_balance.wallet_address, "0xmockstrkbob");
    }

    #[tokio::test]
    async fn insufficient_ledger_balance_rejects_before_chain() {
        let fx = fixture();
        let alice = funded_user(&fx, "alice", 10.0);
        funded_user(&fx, "bob", 0.0);

        let err = fx
            .orchestrator
            .send_to_tag(&alice, "bob", "STRK", 11.0)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::InsufficientBalance { .. }));
        assert!(fx.adapter.transfers.lock().unwrap().is_empty());
        assert!(fx
            .ledger
            .list_transactions_for_user(&alice, 10)
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn onchain_failure_leaves_ledger_untouched() {
        let fx = fixture();
        let alice = funded_user(&fx, "alice", 50.0);
        funded_user(&fx, "bob", 0.0);
        fx.adapter.fail_transfers.store(true, Ordering::SeqCst);

        let err = fx
            .orchestrator
            .send_to_tag(&alice, "bob", "STRK", 20.0)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::OnchainTransfer(_)));
        let alice_balance = fx.ledger.get_balance(&alice, 1).unwrap().unwrap();
        assert!((alice_balance.amount - 50.0).abs() < 1e-9);
        // Marker cleared even on failure.
        assert!(!fx.ledger.is_in_flight(&alice, 1).unwrap());
    }

    #[tokio::test]
    async fn self_transfer_is_rejected() {
        let fx = fixture();
        let alice = funded_user(&fx, "alice", 50.0);

        let err = fx
            .orchestrator
            .send_to_tag(&alice, "ALICE", "STRK", 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SelfTransfer));
    }

    #[tokio::test]
    async fn zero_and_negative_amounts_are_rejected() {
        let fx = fixture();
        let alice = funded_user(&fx, "alice", 50.0);
        funded_user(&fx, "bob", 0.0);

        for bad in [0.0, -5.0, f64::NAN] {
            let err = fx
                .orchestrator
                .send_to_tag(&alice, "bob", "STRK", bad)
                .await
                .unwrap_err();
            assert!(matches!(err, TransferError::InvalidAmount(_)));
        }
    }

    #[tokio::test]
    async fn wallet_withdrawal_debits_single_sided() {
        let fx = fixture();
        let alice = funded_user(&fx, "alice", 50.0);

        let outcome = fx
            .orchestrator
            .send_to_wallet(&alice, "0xexternal", "STRK", 12.5)
            .await
            .unwrap();

        assert!(outcome.credit.is_none());
        assert_eq!(outcome.debit.tx_type, TxType::Debit);
        assert_eq!(outcome.debit.status, TxStatus::Completed);
        assert_eq!(outcome.debit.tx_hash.as_deref(), Some(outcome.tx_hash.as_str()));
        assert_eq!(outcome.debit.to_address.as_deref(), Some("0xexternal"));
        let balance = fx.ledger.get_balance(&alice, 1).unwrap().unwrap();
        assert!((balance.amount - 37.5).abs() < 1e-9);
        assert!(fx
            .ledger
            .has_event(&outcome.tx_hash, TxType::Debit)
            .unwrap());
    }

    #[tokio::test]
    async fn concurrent_transfers_cannot_overdraw() {
        let fx = fixture();
        let alice = funded_user(&fx, "alice", 50.0);
        let bob = funded_user(&fx, "bob", 0.0);
        // Plenty on-chain, so only the ledger can refuse.
        fx.adapter.set_balance("alice", 100.0);

        let (first, second) = tokio::join!(
            fx.orchestrator.send_to_tag(&alice, "bob", "STRK", 40.0),
            fx.orchestrator.send_to_tag(&alice, "bob", "STRK", 40.0),
        );

        let succeeded = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded, 1);
        let loser = if first.is_err() { first } else { second };
        assert!(matches!(
            loser.unwrap_err(),
            TransferError::InsufficientBalance { .. }
        ));

        let alice_balance = fx.ledger.get_balance(&alice, 1).unwrap().unwrap();
        let bob_balance = fx.ledger.get_balance(&bob, 1).unwrap().unwrap();
        assert!((alice_balance.amount - 10.0).abs() < 1e-9);
        assert!((bob_balance.amount - 40.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_withdrawal_refunds_the_reservation() {
        let fx = fixture();
        let alice = funded_user(&fx, "alice", 50.0);
        fx.adapter.fail_transfers.store(true, Ordering::SeqCst);

        let err = fx
            .orchestrator
            .send_to_wallet(&alice, "0xexternal", "STRK", 20.0)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::OnchainTransfer(_)));

        let balance = fx.ledger.get_balance(&alice, 1).unwrap().unwrap();
        assert!((balance.amount - 50.0).abs() < 1e-9);
        let txs = fx.ledger.list_transactions_for_user(&alice, 10).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].status, TxStatus::Failed);
        assert!(!fx.ledger.is_in_flight(&alice, 1).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_registration_failure_is_retried() {
        let fx = fixture();
        let alice = funded_user(&fx, "alice", 50.0);
        let bob = fx.ledger.create_user("bob").unwrap();
        fx.adapter.fail_registers.store(1, Ordering::SeqCst);

        fx.orchestrator
            .send_to_tag(&alice, "bob", "STRK", 5.0)
            .await
            .unwrap();

        let bob_balance = fx.ledger.get_balance(&bob.id, 1).unwrap().unwrap();
        assert!((bob_balance.amount - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_token_and_tag_are_rejected() {
        let fx = fixture();
        let alice = funded_user(&fx, "alice", 50.0);

        assert!(matches!(
            fx.orchestrator
                .send_to_tag(&alice, "bob", "DOGE", 1.0)
                .await
                .unwrap_err(),
            TransferError::UnknownToken(_)
        ));
        assert!(matches!(
            fx.orchestrator
                .send_to_tag(&alice, "nobody", "STRK", 1.0)
                .await
                .unwrap_err(),
            TransferError::UnknownTag(_)
        ));
    }
}
