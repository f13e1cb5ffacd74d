// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! # Token Price Poller
//!
//! Background task that refreshes USD prices for every supported token so
//! balance responses can carry fiat values without a blocking upstream call.
//!
//! ## Strategy
//!
//! Every `poll_interval` (default 60 s) the poller fetches the configured
//! price endpoint, which returns a symbol → USD map, and writes the result
//! into the shared [`TokenRegistry`]. A failed fetch keeps the previous
//! prices; balances degrade to stale fiat values rather than errors.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown,
//! following the same pattern as the reconciler and listeners.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::tokens::TokenRegistry;

/// Default interval between price refreshes.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Background price poller feeding the token registry.
pub struct PricePoller {
    tokens: Arc<TokenRegistry>,
    endpoint: String,
    http: reqwest::Client,
    poll_interval: Duration,
}

impl PricePoller {
    pub fn new(tokens: Arc<TokenRegistry>, endpoint: String) -> Self {
        Self {
            tokens,
            endpoint,
            http: reqwest::Client::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Run the poller loop until the cancellation token is triggered.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            endpoint = %self.endpoint,
            "Price poller starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Price poller shutting down");
                return;
            }

            self.poll_step().await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Price poller shutting down");
                    return;
                }
            }
        }
    }

    /// One refresh: fetch the symbol → USD map and store it.
    async fn poll_step(&self) {
        let prices: HashMap<String, f64> = match self.fetch_prices().await {
            Ok(prices) => prices,
            Err(e) => {
                warn!(error = %e, "Price fetch failed, keeping previous prices");
                return;
            }
        };

        let mut updated = 0u32;
        for (symbol, usd) in &prices {
            if let Some(token) = self.tokens.by_symbol(symbol) {
                self.tokens.set_price(token.id, *usd);
                updated += 1;
            }
        }
        info!(updated, "Token prices refreshed");
    }

    async fn fetch_prices(&self) -> Result<HashMap<String, f64>, reqwest::Error> {
        self.http
            .get(&self.endpoint)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}
