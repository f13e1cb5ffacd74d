// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Checkpointed per-chain event listener.
//!
//! ## Strategy
//!
//! Each cycle reads the chain head, scans from the last checkpoint in
//! fixed-size block chunks, and enqueues every vault event found. The
//! checkpoint advances once a whole chunk has been handed to the in-process
//! queue, so a mid-chunk error re-delivers the chunk next cycle (the
//! consumer deduplicates by hash). Events already queued are not persisted:
//! a process crash drops them, and the reconciler restores the affected
//! balances on its next sweep with a synthetic correction entry in place of
//! the original hash. A fresh database starts a bounded lookback behind the
//! head instead of replaying the whole chain.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::EventJob;
use crate::chain::ChainAdapter;
use crate::ledger::LedgerStore;
use crate::queue::TaskQueue;

/// Blocks scanned behind head when no checkpoint exists yet.
const LOOKBACK_BLOCKS: u64 = 10_000;

/// Blocks per fetch_events call, bounded by RPC log-range limits.
const CHUNK_BLOCKS: u64 = 2_000;

pub struct ChainEventListener {
    ledger: Arc<LedgerStore>,
    adapter: Arc<dyn ChainAdapter>,
    token_id: u32,
    queue: Arc<TaskQueue<EventJob>>,
    interval: Duration,
}

impl ChainEventListener {
    pub fn new(
        ledger: Arc<LedgerStore>,
        adapter: Arc<dyn ChainAdapter>,
        token_id: u32,
        queue: Arc<TaskQueue<EventJob>>,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            adapter,
            token_id,
            queue,
            interval,
        }
    }

    /// Run the polling loop until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let chain = self.adapter.chain_key().to_string();
        tracing::info!(chain, interval_secs = self.interval.as_secs(), "Event listener started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(chain, "Event listener shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.poll_once().await {
                Ok(0) => {}
                Ok(enqueued) => {
                    tracing::info!(chain, enqueued, "Enqueued chain events");
                }
                Err(e) => {
                    tracing::warn!(chain, error = %e, "Event poll failed, will retry next cycle");
                }
            }
        }
    }

    /// One poll: scan new blocks and enqueue their events.
    pub async fn poll_once(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let chain = self.adapter.chain_key().to_string();
        let head = self.adapter.head_block().await?;

        let last = self.ledger.last_processed_block(&chain)?;
        let mut from = if last == 0 {
            head.saturating_sub(LOOKBACK_BLOCKS)
        } else {
            last + 1
        };
        if from > head {
            return Ok(0);
        }

        let mut enqueued = 0u64;
        while from <= head {
            let to = (from + CHUNK_BLOCKS - 1).min(head);
            let events = self.adapter.fetch_events(from, to).await?;

            for event in events {
                self.queue.enqueue(EventJob {
                    chain_key: chain.clone(),
                    token_id: self.token_id,
                    kind: event.kind,
                    wallet_address: event.wallet_address,
                    amount_units: event.amount_units.to_string(),
                    tx_hash: event.tx_hash,
                    block_number: event.block_number,
                });
                enqueued += 1;
            }

            // Checkpoint after the whole chunk is enqueued. Queued jobs are
            // not persisted; if the process dies before the consumer drains
            // them the reconciler heals the balances.
            self.ledger.set_last_processed_block(&chain, to)?;
            from = to + 1;
        }

        Ok(enqueued)
    }
}
