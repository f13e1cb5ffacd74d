// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Chain event ingestion.
//!
//! A listener per chain polls for vault deposit/withdrawal events and
//! enqueues them; a single consumer applies them to the ledger. Delivery
//! is at-least-once (the checkpoint only advances after enqueueing a whole
//! chunk), so the consumer deduplicates on (tx_hash, direction).

pub mod consumer;
pub mod listener;

use serde::{Deserialize, Serialize};

use crate::chain::EventKind;

/// One observed on-chain event, as carried through the task queue.
///
/// The amount is a base-unit decimal string rather than a float so nothing
/// is lost between observation and ledger write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventJob {
    pub chain_key: String,
    pub token_id: u32,
    pub kind: EventKind,
    pub wallet_address: String,
    pub amount_units: String,
    pub tx_hash: String,
    pub block_number: u64,
}
