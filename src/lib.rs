// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Tagpay - Multi-Chain Tag Wallet Service
//!
//! Custodial wallet service where users hold balances under a human-readable
//! tag across Starknet and several EVM chains. An embedded redb ledger is
//! the off-chain source of truth; background tasks keep it consistent with
//! the on-chain vaults.
//!
//! ## Modules
//!
//! - `api` - HTTP API handlers (Axum)
//! - `chain` - Per-chain vault adapters (alloy for EVM, JSON-RPC for Starknet)
//! - `ledger` - Embedded ACID ledger (redb)
//! - `ingest` - Chain event listeners and the queue consumer
//! - `reconciler` - Periodic on-chain vs. ledger balance sweep
//! - `orchestrator` - User transfer sequencing

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod orchestrator;
pub mod pricefeed;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod state;
pub mod tokens;
