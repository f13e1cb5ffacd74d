// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! # Runtime Configuration
//!
//! This module defines environment variable names, default values, and the
//! `Config` struct loaded from the environment at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Root directory for the embedded ledger database | `/data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `{SYMBOL}_RPC_URL` | EVM chain RPC endpoint (LSK, BASE, CELO, FLOW) | Chain disabled if unset |
//! | `{SYMBOL}_VAULT_CONTRACT` | Tag-vault contract address on that chain | Chain disabled if unset |
//! | `{SYMBOL}_SIGNER_KEY` | Hex private key for the custodial signer | Chain disabled if unset |
//! | `STARKNET_RPC_URL` | Starknet JSON-RPC endpoint | Chain disabled if unset |
//! | `STARKNET_VAULT_CONTRACT` | Tag-vault contract address (felt hex) | Chain disabled if unset |
//! | `STARKNET_INVOKER_URL` | Account-invoker sidecar for write calls | Chain disabled if unset |
//! | `PRICE_FEED_URL` | JSON price endpoint (symbol -> USD) | Price poller disabled if unset |
//! | `RECONCILE_INTERVAL_SECS` | Seconds between reconciler sweeps | `10` |
//! | `RECONCILE_LOCK_TTL_SECS` | TTL of the sweep mutual-exclusion lock | `15` |
//! | `LISTENER_INTERVAL_SECS` | Seconds between listener polls | `5` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable name for the ledger data directory path.
pub const DATA_DIR_ENV: &str = "DATA_DIR";

/// Default data directory when `DATA_DIR` is unset.
pub const DEFAULT_DATA_DIR: &str = "/data";

/// File name of the embedded ledger database inside the data directory.
pub const LEDGER_DB_FILE: &str = "ledger.redb";

/// EVM chain symbols whose settings are read from the environment.
pub const EVM_CHAIN_KEYS: [&str; 4] = ["LSK", "BASE", "CELO", "FLOW"];

/// Settings for one EVM chain adapter.
#[derive(Debug, Clone)]
pub struct EvmChainSettings {
    /// Chain key, matching the token symbol (e.g. "LSK").
    pub key: String,
    /// HTTP JSON-RPC endpoint.
    pub rpc_url: String,
    /// Tag-vault contract address (0x-prefixed).
    pub contract: String,
    /// Hex-encoded private key of the custodial signer (no 0x prefix).
    pub signer_key: String,
}

/// Settings for the Starknet adapter.
#[derive(Debug, Clone)]
pub struct StarknetSettings {
    /// HTTP JSON-RPC endpoint.
    pub rpc_url: String,
    /// Tag-vault contract address (felt hex).
    pub contract: String,
    /// Account-invoker sidecar base URL (write path).
    pub invoker_url: String,
}

/// Application configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub evm_chains: Vec<EvmChainSettings>,
    pub starknet: Option<StarknetSettings>,
    pub price_feed_url: Option<String>,
    pub reconcile_interval: Duration,
    pub reconcile_lock_ttl: Duration,
    pub listener_interval: Duration,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Chains with incomplete settings are skipped; the service can run
    /// with any subset of chains configured.
    pub fn from_env() -> Self {
        let evm_chains = EVM_CHAIN_KEYS
            .iter()
            .filter_map(|key| {
                let rpc_url = env::var(format!("{key}_RPC_URL")).ok()?;
                let contract = env::var(format!("{key}_VAULT_CONTRACT")).ok()?;
                let signer_key = env::var(format!("{key}_SIGNER_KEY")).ok()?;
                Some(EvmChainSettings {
                    key: (*key).to_string(),
                    rpc_url,
                    contract,
                    signer_key,
                })
            })
            .collect();

        let starknet = match (
            env::var("STARKNET_RPC_URL"),
            env::var("STARKNET_VAULT_CONTRACT"),
            env::var("STARKNET_INVOKER_URL"),
        ) {
            (Ok(rpc_url), Ok(contract), Ok(invoker_url)) => Some(StarknetSettings {
                rpc_url,
                contract,
                invoker_url,
            }),
            _ => None,
        };

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: env::var(DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR)),
            evm_chains,
            starknet,
            price_feed_url: env::var("PRICE_FEED_URL").ok(),
            reconcile_interval: env_duration_secs("RECONCILE_INTERVAL_SECS", 10),
            reconcile_lock_ttl: env_duration_secs("RECONCILE_LOCK_TTL_SECS", 15),
            listener_interval: env_duration_secs("LISTENER_INTERVAL_SECS", 5),
        }
    }

    /// Path to the embedded ledger database file.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_DB_FILE)
    }
}

/// Read a duration (in whole seconds) from the environment with a default.
fn env_duration_secs(var: &str, default_secs: u64) -> Duration {
    let secs = env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}
