// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! EVM chain adapter over the tag-vault contract.
//!
//! One instance per EVM chain (Lisk, Base, Celo, Flow EVM), parameterized by
//! RPC endpoint, contract address, and the custodial signer key. All four
//! chains deploy the same vault contract, so the `sol!` interface below is
//! shared.

use std::str::FromStr;

use alloy::{
    network::{Ethereum, EthereumWallet},
    primitives::{Address, U256},
    providers::{
        fillers::{
            BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller,
            WalletFiller,
        },
        Identity, Provider, ProviderBuilder, RootProvider,
    },
    rpc::types::Filter,
    signers::local::PrivateKeySigner,
    sol,
    sol_types::SolEvent,
};
use async_trait::async_trait;

use super::amount::{decimal_to_units, units_to_decimal};
use super::{ChainAdapter, ChainError, ChainEvent, EventKind, Recipient};
use crate::config::EvmChainSettings;

sol! {
    #[sol(rpc)]
    interface ITagVault {
        function registerTag(string tag) external returns (address);
        function walletOf(string tag) external view returns (address);
        function balanceOfTag(string tag) external view returns (uint256);
        function transferToTag(string senderTag, string recipientTag, uint256 amount) external returns (bool);
        function transferToAddress(string senderTag, address recipient, uint256 amount) external returns (bool);

        event DepositReceived(address indexed wallet, uint256 amount);
        event WithdrawalCompleted(address indexed wallet, uint256 amount);
    }
}

/// HTTP provider with signing capabilities (all fillers + wallet).
type SignerProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider<Ethereum>,
>;

/// Adapter for one EVM chain's tag-vault.
pub struct EvmAdapter {
    key: String,
    decimals: u8,
    contract_address: Address,
    provider: SignerProvider,
}

impl EvmAdapter {
    /// Build an adapter from chain settings.
    pub fn new(settings: &EvmChainSettings, decimals: u8) -> Result<Self, ChainError> {
        let url: url::Url = settings
            .rpc_url
            .parse()
            .map_err(|e: url::ParseError| ChainError::Rpc(e.to_string()))?;

        let contract_address = Address::from_str(&settings.contract)
            .map_err(|e| ChainError::InvalidAddress(e.to_string()))?;

        let key_bytes = alloy::hex::decode(settings.signer_key.trim_start_matches("0x"))
            .map_err(|e| ChainError::InvalidAddress(format!("signer key: {e}")))?;
        let signer = PrivateKeySigner::from_slice(&key_bytes)
            .map_err(|e| ChainError::InvalidAddress(format!("signer key: {e}")))?;

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url);

        Ok(Self {
            key: settings.key.clone(),
            decimals,
            contract_address,
            provider,
        })
    }

    fn vault(&self) -> ITagVault::ITagVaultInstance<SignerProvider> {
        ITagVault::new(self.contract_address, self.provider.clone())
    }

    /// Raw on-chain balance for a tag.
    async fn balance_units(&self, tag: &str) -> Result<U256, ChainError> {
        self.vault()
            .balanceOfTag(tag.to_string())
            .call()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain_key(&self) -> &str {
        &self.key
    }

    fn decimals(&self) -> u8 {
        self.decimals
    }

    async fn register_tag(&self, tag: &str) -> Result<String, ChainError> {
        let vault = self.vault();

        let existing: Address = vault
            .walletOf(tag.to_string())
            .call()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        if existing != Address::ZERO {
            return Ok(format!("{existing:#x}"));
        }

        let pending = vault
            .registerTag(tag.to_string())
            .send()
            .await
            .map_err(|e| ChainError::Submission(e.to_string()))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| ChainError::Timeout(format!("registration receipt: {e}")))?;
        if !receipt.status() {
            return Err(ChainError::Submission(format!(
                "tag registration reverted in tx {:#x}",
                receipt.transaction_hash
            )));
        }

        let derived: Address = vault
            .walletOf(tag.to_string())
            .call()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        if derived == Address::ZERO {
            return Err(ChainError::Submission(format!(
                "no wallet derived for tag `{tag}` after registration"
            )));
        }
        Ok(format!("{derived:#x}"))
    }

    async fn get_balance(&self, tag: &str) -> Result<f64, ChainError> {
        let units = self.balance_units(tag).await?;
        Ok(units_to_decimal(units, self.decimals))
    }

    async fn transfer(
        &self,
        sender_tag: &str,
        recipient: &Recipient,
        amount: f64,
    ) -> Result<String, ChainError> {
        let units = decimal_to_units(amount, self.decimals)?;

        // Courtesy pre-check; the ledger check already happened.
        let available = self.balance_units(sender_tag).await?;
        if available < units {
            return Err(ChainError::InsufficientOnChain {
                available: units_to_decimal(available, self.decimals),
                requested: amount,
            });
        }

        let vault = self.vault();
        let pending = match recipient {
            Recipient::Tag(tag) => vault
                .transferToTag(sender_tag.to_string(), tag.clone(), units)
                .send()
                .await,
            Recipient::Address(addr) => {
                let to = Address::from_str(addr)
                    .map_err(|e| ChainError::InvalidAddress(e.to_string()))?;
                vault
                    .transferToAddress(sender_tag.to_string(), to, units)
                    .send()
                    .await
            }
        }
        .map_err(|e| ChainError::Submission(e.to_string()))?;

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| ChainError::Timeout(format!("transfer receipt: {e}")))?;
        if !receipt.status() {
            return Err(ChainError::Submission(format!(
                "transfer reverted in tx {:#x}",
                receipt.transaction_hash
            )));
        }
        Ok(format!("{:#x}", receipt.transaction_hash))
    }

    async fn head_block(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<ChainEvent>, ChainError> {
        let filter = Filter::new()
            .address(self.contract_address)
            .event_signature(vec![
                ITagVault::DepositReceived::SIGNATURE_HASH,
                ITagVault::WithdrawalCompleted::SIGNATURE_HASH,
            ])
            .from_block(from)
            .to_block(to);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            // Both events share the layout: topics = [sig, wallet], data = amount.
            if log.topics().len() < 2 {
                continue;
            }
            let kind = if log.topics()[0] == ITagVault::DepositReceived::SIGNATURE_HASH {
                EventKind::Deposit
            } else {
                EventKind::Withdrawal
            };

            // Indexed address lives in the last 20 bytes of the 32-byte topic.
            let wallet_address = format!("0x{}", alloy::hex::encode(&log.topics()[1][12..]));

            let amount_units = if log.data().data.len() >= 32 {
                U256::from_be_slice(&log.data().data[..32])
            } else {
                U256::ZERO
            };

            let Some(tx_hash) = log.transaction_hash.map(|h| format!("{h:#x}")) else {
                continue;
            };
            let Some(block_number) = log.block_number else {
                continue;
            };

            events.push(ChainEvent {
                kind,
                wallet_address,
                amount_units,
                tx_hash,
                block_number,
            });
        }

        Ok(events)
    }
}
