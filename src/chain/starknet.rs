// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Starknet chain adapter.
//!
//! Reads go straight to the Starknet JSON-RPC node (`starknet_call`,
//! `starknet_blockNumber`, `starknet_getEvents`). Writes are delegated to
//! the account-invoker sidecar, which holds the custodial Starknet account
//! and signs invoke transactions; this adapter then polls the node for the
//! receipt. Tags are encoded as Cairo short strings (max 31 ASCII bytes).

use std::time::Duration;

use alloy::primitives::{keccak256, U256};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::amount::{decimal_to_units, units_to_decimal};
use super::{ChainAdapter, ChainError, ChainEvent, EventKind, Recipient};
use crate::config::StarknetSettings;

/// Timeout applied to every RPC/invoker HTTP call, separate from retry
/// backoff. A hung call must not stall a reconciler batch.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Receipt polling: attempts and delay while waiting for acceptance.
const RECEIPT_POLL_ATTEMPTS: u32 = 30;
const RECEIPT_POLL_DELAY: Duration = Duration::from_secs(2);

/// Adapter for the Starknet tag-vault.
pub struct StarknetAdapter {
    key: String,
    decimals: u8,
    rpc_url: String,
    invoker_url: String,
    contract: String,
    http: reqwest::Client,
}

impl StarknetAdapter {
    pub fn new(settings: &StarknetSettings, decimals: u8) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        Ok(Self {
            key: "STRK".to_string(),
            decimals,
            rpc_url: settings.rpc_url.clone(),
            invoker_url: settings.invoker_url.trim_end_matches('/').to_string(),
            contract: settings.contract.clone(),
            http,
        })
    }

    /// Perform a JSON-RPC call against the Starknet node.
    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response: Value = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        if let Some(error) = response.get("error") {
            return Err(ChainError::Rpc(format!("{method}: {error}")));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| ChainError::Rpc(format!("{method}: missing result")))
    }

    /// Read-only contract call returning the raw felt array.
    async fn contract_call(
        &self,
        entry_point: &str,
        calldata: Vec<String>,
    ) -> Result<Vec<String>, ChainError> {
        let result = self
            .rpc(
                "starknet_call",
                json!([
                    {
                        "contract_address": self.contract,
                        "entry_point_selector": selector(entry_point),
                        "calldata": calldata,
                    },
                    "latest",
                ]),
            )
            .await?;

        serde_json::from_value(result)
            .map_err(|e| ChainError::Rpc(format!("starknet_call result: {e}")))
    }

    /// Submit an invoke via the account-invoker sidecar; returns the tx hash.
    async fn invoke(&self, entry_point: &str, calldata: Vec<String>) -> Result<String, ChainError> {
        #[derive(Deserialize)]
        struct InvokeResponse {
            transaction_hash: String,
        }

        let response = self
            .http
            .post(format!("{}/invoke", self.invoker_url))
            .json(&json!({
                "contract_address": self.contract,
                "entry_point": entry_point,
                "calldata": calldata,
            }))
            .send()
            .await
            .map_err(|e| ChainError::Submission(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChainError::Submission(format!(
                "invoker returned {}",
                response.status()
            )));
        }

        let parsed: InvokeResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Submission(e.to_string()))?;
        Ok(parsed.transaction_hash)
    }

    /// Poll for a transaction receipt until it is accepted or times out.
    async fn await_acceptance(&self, tx_hash: &str) -> Result<(), ChainError> {
        for _ in 0..RECEIPT_POLL_ATTEMPTS {
            match self
                .rpc("starknet_getTransactionReceipt", json!([tx_hash]))
                .await
            {
                Ok(receipt) => {
                    if receipt
                        .get("execution_status")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s == "REVERTED")
                    {
                        return Err(ChainError::Submission(format!("tx {tx_hash} reverted")));
                    }
                    let finality = receipt
                        .get("finality_status")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if finality == "ACCEPTED_ON_L2" || finality == "ACCEPTED_ON_L1" {
                        return Ok(());
                    }
                }
                // Not found yet: the tx has not entered a block.
                Err(_) => {}
            }
            tokio::time::sleep(RECEIPT_POLL_DELAY).await;
        }
        Err(ChainError::Timeout(format!("acceptance of tx {tx_hash}")))
    }
}

#[async_trait]
impl ChainAdapter for StarknetAdapter {
    fn chain_key(&self) -> &str {
        &self.key
    }

    fn decimals(&self) -> u8 {
        self.decimals
    }

    async fn register_tag(&self, tag: &str) -> Result<String, ChainError> {
        let tag_felt = encode_short_string(tag)?;

        let existing = self.contract_call("wallet_of", vec![tag_felt.clone()]).await?;
        if let Some(address) = existing.first() {
            if !is_zero_felt(address) {
                return Ok(address.clone());
            }
        }

        let tx_hash = self.invoke("register_tag", vec![tag_felt.clone()]).await?;
        self.await_acceptance(&tx_hash).await?;

        let derived = self.contract_call("wallet_of", vec![tag_felt]).await?;
        match derived.first() {
            Some(address) if !is_zero_felt(address) => Ok(address.clone()),
            _ => Err(ChainError::Submission(format!(
                "no wallet derived for tag `{tag}` after registration"
            ))),
        }
    }

    async fn get_balance(&self, tag: &str) -> Result<f64, ChainError> {
        let tag_felt = encode_short_string(tag)?;
        let result = self.contract_call("balance_of_tag", vec![tag_felt]).await?;
        let units = parse_uint256(&result)?;
        Ok(units_to_decimal(units, self.decimals))
    }

    async fn transfer(
        &self,
        sender_tag: &str,
        recipient: &Recipient,
        amount: f64,
    ) -> Result<String, ChainError> {
        let units = decimal_to_units(amount, self.decimals)?;

        let available = {
            let sender_felt = encode_short_string(sender_tag)?;
            let result = self.contract_call("balance_of_tag", vec![sender_felt]).await?;
            parse_uint256(&result)?
        };
        if available < units {
            return Err(ChainError::InsufficientOnChain {
                available: units_to_decimal(available, self.decimals),
                requested: amount,
            });
        }

        let sender_felt = encode_short_string(sender_tag)?;
        let (low, high) = split_uint256(units);
        let (entry_point, mut calldata) = match recipient {
            Recipient::Tag(tag) => (
                "transfer_to_tag",
                vec![sender_felt, encode_short_string(tag)?],
            ),
            Recipient::Address(address) => (
                "transfer_to_address",
                vec![sender_felt, address.clone()],
            ),
        };
        calldata.push(low);
        calldata.push(high);

        let tx_hash = self.invoke(entry_point, calldata).await?;
        self.await_acceptance(&tx_hash).await?;
        Ok(tx_hash)
    }

    async fn head_block(&self) -> Result<u64, ChainError> {
        let result = self.rpc("starknet_blockNumber", json!([])).await?;
        result
            .as_u64()
            .ok_or_else(|| ChainError::Rpc("non-numeric block number".to_string()))
    }

    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<ChainEvent>, ChainError> {
        #[derive(Deserialize)]
        struct EventsPage {
            events: Vec<RawEvent>,
            continuation_token: Option<String>,
        }

        #[derive(Deserialize)]
        struct RawEvent {
            keys: Vec<String>,
            data: Vec<String>,
            transaction_hash: String,
            block_number: u64,
        }

        let deposit_key = selector("DepositReceived");
        let withdrawal_key = selector("WithdrawalCompleted");

        let mut events = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut filter = json!({
                "from_block": { "block_number": from },
                "to_block": { "block_number": to },
                "address": self.contract,
                "keys": [[deposit_key, withdrawal_key]],
                "chunk_size": 100,
            });
            if let Some(token) = &continuation {
                filter["continuation_token"] = json!(token);
            }

            let result = self.rpc("starknet_getEvents", json!([filter])).await?;
            let page: EventsPage = serde_json::from_value(result)
                .map_err(|e| ChainError::Rpc(format!("starknet_getEvents result: {e}")))?;

            for raw in page.events {
                let Some(key) = raw.keys.first() else { continue };
                let kind = if felt_eq(key, &deposit_key) {
                    EventKind::Deposit
                } else if felt_eq(key, &withdrawal_key) {
                    EventKind::Withdrawal
                } else {
                    continue;
                };
                // Event data layout: [wallet, amount_low, amount_high].
                if raw.data.len() < 3 {
                    continue;
                }
                let amount_units = parse_uint256(&raw.data[1..3])?;
                events.push(ChainEvent {
                    kind,
                    wallet_address: raw.data[0].to_lowercase(),
                    amount_units,
                    tx_hash: raw.transaction_hash,
                    block_number: raw.block_number,
                });
            }

            match page.continuation_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        Ok(events)
    }
}

/// Cairo short-string encoding: up to 31 ASCII bytes packed into one felt.
fn encode_short_string(tag: &str) -> Result<String, ChainError> {
    if tag.is_empty() || tag.len() > 31 || !tag.is_ascii() {
        return Err(ChainError::InvalidTag(format!(
            "`{tag}` is not a valid short string (1-31 ASCII bytes)"
        )));
    }
    Ok(format!("0x{}", alloy::hex::encode(tag.as_bytes())))
}

/// starknet_keccak: keccak256 masked to 250 bits, as a felt hex string.
fn selector(name: &str) -> String {
    let mut hash = keccak256(name.as_bytes()).0;
    hash[0] &= 0x03;
    format!("0x{}", alloy::hex::encode(hash))
}

/// Parse a Cairo `Uint256` from `[low, high]` felts.
fn parse_uint256(felts: &[String]) -> Result<U256, ChainError> {
    let parse = |felt: &str| {
        let trimmed = felt.trim_start_matches("0x");
        U256::from_str_radix(trimmed, 16)
            .map_err(|e| ChainError::Rpc(format!("bad felt `{felt}`: {e}")))
    };
    match felts {
        [low, high, ..] => Ok(parse(low)? | (parse(high)? << 128)),
        [low] => parse(low),
        [] => Err(ChainError::Rpc("empty uint256 response".to_string())),
    }
}

/// Split a `U256` into Cairo `Uint256` calldata `[low, high]` felt strings.
fn split_uint256(value: U256) -> (String, String) {
    let mask = (U256::from(1u8) << 128) - U256::from(1u8);
    let low = value & mask;
    let high = value >> 128;
    (format!("{low:#x}"), format!("{high:#x}"))
}

fn is_zero_felt(felt: &str) -> bool {
    felt.trim_start_matches("0x")
        .chars()
        .all(|c| c == '0')
}

fn felt_eq(a: &str, b: &str) -> bool {
    let norm = |s: &str| s.trim_start_matches("0x").trim_start_matches('0').to_lowercase();
    norm(a) == norm(b)
}
