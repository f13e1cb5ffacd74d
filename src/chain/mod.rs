// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! # Chain Adapters
//!
//! One adapter per supported chain, behind a uniform trait. The registry
//! maps chain keys (token symbols) to adapters and is built once at startup;
//! no call site branches on symbol strings.
//!
//! Adapters do not retry: callers wrap calls in [`crate::retry::with_backoff`]
//! so the reconciler, listener, and orchestrator share one backoff policy.

pub mod amount;
pub mod evm;
pub mod starknet;

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors surfaced by chain adapters.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("on-chain balance {available} is below requested {requested}")]
    InsufficientOnChain { available: f64, requested: f64 },

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error(transparent)]
    Amount(#[from] amount::AmountError),
}

/// Destination of an on-chain transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// Another registered tag on the same chain.
    Tag(String),
    /// A raw wallet address outside the tag system.
    Address(String),
}

/// Kind of vault event observed in chain logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Deposit,
    Withdrawal,
}

/// A decoded tag-vault event.
#[derive(Debug, Clone)]
pub struct ChainEvent {
    pub kind: EventKind,
    /// Custodial wallet address the event concerns (lowercased by adapters).
    pub wallet_address: String,
    /// Raw amount in chain units.
    pub amount_units: U256,
    /// On-chain transaction hash.
    pub tx_hash: String,
    pub block_number: u64,
}

/// Uniform interface over one chain's tag-vault contract.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Chain key; matches the token symbol in [`crate::tokens`].
    fn chain_key(&self) -> &str;

    /// Fixed-point decimals of the chain's vault token.
    fn decimals(&self) -> u8;

    /// Resolve or create the custodial wallet address for a tag.
    ///
    /// Idempotent: if the tag is already registered the existing address is
    /// returned without touching the chain.
    async fn register_tag(&self, tag: &str) -> Result<String, ChainError>;

    /// Current on-chain balance for a tag in canonical decimal units.
    ///
    /// Returns `0.0` for an unregistered tag; `Err` means genuine RPC
    /// failure and is retried by callers.
    async fn get_balance(&self, tag: &str) -> Result<f64, ChainError>;

    /// Submit a transfer and suspend until the chain accepts it.
    ///
    /// Pre-checks the sender's on-chain balance as a courtesy; the
    /// authoritative balance check happens against the ledger before this
    /// is called. Returns the transaction hash.
    async fn transfer(
        &self,
        sender_tag: &str,
        recipient: &Recipient,
        amount: f64,
    ) -> Result<String, ChainError>;

    /// Latest block number, for the event listener.
    async fn head_block(&self) -> Result<u64, ChainError>;

    /// Decoded vault events in the inclusive block range `[from, to]`.
    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<ChainEvent>, ChainError>;
}

/// Registry of chain adapters keyed by chain key, built once at startup.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own chain key.
    pub fn insert(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters
            .insert(adapter.chain_key().to_uppercase(), adapter);
    }

    /// Look up the adapter for a chain key (case-insensitive).
    pub fn get(&self, chain_key: &str) -> Option<Arc<dyn ChainAdapter>> {
        self.adapters.get(&chain_key.trim().to_uppercase()).cloned()
    }

    /// All registered adapters, for the per-chain listeners.
    pub fn all(&self) -> Vec<Arc<dyn ChainAdapter>> {
        self.adapters.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockChainAdapter;
    use super::*;

    #[test]
    fn registry_dispatches_by_key_case_insensitively() {
        let mut registry = AdapterRegistry::new();
        registry.insert(Arc::new(MockChainAdapter::new("LSK", 18)));
        registry.insert(Arc::new(MockChainAdapter::new("FLOW", 8)));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("lsk").unwrap().chain_key(), "LSK");
        assert_eq!(registry.get(" flow ").unwrap().decimals(), 8);
        assert!(registry.get("STRK").is_none());
    }

    #[tokio::test]
    async fn mock_transfer_fails_fast_on_insufficient_onchain_balance() {
        let adapter = MockChainAdapter::new("LSK", 18);
        adapter.set_balance("alice", 1.0);

        let err = adapter
            .transfer("alice", &Recipient::Tag("bob".to_string()), 5.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::InsufficientOnChain { .. }));
        // No submission happened.
        assert!(adapter.transfers.lock().unwrap().is_empty());
    }
}
