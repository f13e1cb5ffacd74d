// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tagpay::api::router;
use tagpay::chain::{evm::EvmAdapter, starknet::StarknetAdapter, AdapterRegistry, ChainAdapter};
use tagpay::config::Config;
use tagpay::ingest::consumer::EventConsumer;
use tagpay::ingest::listener::ChainEventListener;
use tagpay::ingest::EventJob;
use tagpay::ledger::LedgerStore;
use tagpay::pricefeed::PricePoller;
use tagpay::queue::TaskQueue;
use tagpay::reconciler::BalanceReconciler;
use tagpay::state::AppState;
use tagpay::tokens::TokenRegistry;

#[tokio::main]
async fn main() {
    init_tracing();

    let config = Config::from_env();
    let tokens = Arc::new(TokenRegistry::new());

    let ledger = match LedgerStore::open(&config.ledger_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(path = %config.ledger_path().display(), error = %e, "Cannot open ledger");
            std::process::exit(1);
        }
    };

    let adapters = Arc::new(build_adapters(&config, &tokens));
    if adapters.is_empty() {
        tracing::warn!("No chain adapters configured; transfers and ingestion are disabled");
    }

    let shutdown = CancellationToken::new();

    // Event pipeline: one listener per chain feeding a single consumer.
    let queue: Arc<TaskQueue<EventJob>> = Arc::new(TaskQueue::new());
    let consumer = Arc::new(EventConsumer::new(
        ledger.clone(),
        adapters.clone(),
        tokens.clone(),
    ));
    tokio::spawn(queue.clone().run_worker(consumer, shutdown.clone()));

    for adapter in adapters.all() {
        let Some(token) = tokens.by_symbol(adapter.chain_key()) else {
            tracing::warn!(chain = adapter.chain_key(), "No token for chain, listener skipped");
            continue;
        };
        let listener = ChainEventListener::new(
            ledger.clone(),
            adapter,
            token.id,
            queue.clone(),
            config.listener_interval,
        );
        tokio::spawn(listener.run(shutdown.clone()));
    }

    let reconciler = BalanceReconciler::new(
        ledger.clone(),
        adapters.clone(),
        tokens.clone(),
        config.reconcile_interval,
        config.reconcile_lock_ttl,
    );
    tokio::spawn(reconciler.run(shutdown.clone()));

    if let Some(endpoint) = config.price_feed_url.clone() {
        let poller = PricePoller::new(tokens.clone(), endpoint);
        tokio::spawn(poller.run(shutdown.clone()));
    } else {
        tracing::info!("PRICE_FEED_URL not set, fiat values will stay at zero");
    }

    let state = AppState::new(ledger, adapters, tokens);
    let app = router(state);

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(host = %config.host, port = config.port, error = %e, "Bad bind address");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, error = %e, "Cannot bind");
            std::process::exit(1);
        }
    };

    tracing::info!(%addr, "Tagpay server listening (docs at /docs)");

    let server_shutdown = shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await;

    shutdown.cancel();
    if let Err(e) = result {
        tracing::error!(error = %e, "Server failed");
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_adapters(config: &Config, tokens: &TokenRegistry) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();

    if let Some(starknet) = &config.starknet {
        let decimals = tokens.by_symbol("STRK").map(|t| t.decimals).unwrap_or(18);
        match StarknetAdapter::new(starknet, decimals) {
            Ok(adapter) => registry.insert(Arc::new(adapter) as Arc<dyn ChainAdapter>),
            Err(e) => tracing::warn!(error = %e, "Starknet adapter skipped"),
        }
    }

    for settings in &config.evm_chains {
        let decimals = tokens
            .by_symbol(&settings.key)
            .map(|t| t.decimals)
            .unwrap_or(18);
        match EvmAdapter::new(settings, decimals) {
            Ok(adapter) => registry.insert(Arc::new(adapter) as Arc<dyn ChainAdapter>),
            Err(e) => {
                tracing::warn!(chain = %settings.key, error = %e, "EVM adapter skipped");
            }
        }
    }

    tracing::info!(chains = registry.len(), "Chain adapters configured");
    registry
}
