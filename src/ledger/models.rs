// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Ledger record types persisted in redb as JSON values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Account holder, addressed by their unique tag.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: String,
    /// Normalized (lowercase) tag, unique across the system.
    pub tag: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(tag: &str) -> Self {
        Self {
            id: format!("usr-{}", Uuid::new_v4()),
            tag: tag.trim().to_lowercase(),
            created_at: Utc::now(),
        }
    }
}

/// One row of the balance table: a (user, token) pair and its custodial
/// on-chain wallet address.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Balance {
    pub user_id: String,
    pub token_id: u32,
    /// Custodial vault wallet backing this balance, lowercase.
    pub wallet_address: String,
    pub amount: f64,
    /// USD value at the price in effect when the row was last written.
    #[serde(default)]
    pub usd_value: f64,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn new(user_id: &str, token_id: u32, wallet_address: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            token_id,
            wallet_address: wallet_address.to_lowercase(),
            amount: 0.0,
            usd_value: 0.0,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        balance_key(&self.user_id, self.token_id)
    }
}

/// Composite key for the balance table.
pub fn balance_key(user_id: &str, token_id: u32) -> String {
    format!("{user_id}|{token_id}")
}

/// Direction of a ledger entry relative to the user it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Completed,
    Failed,
}

/// Append-only transaction record. Never mutated after the status leaves
/// `Pending`; corrections are recorded as new entries.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LedgerTransaction {
    /// Internal reference, unique per ledger entry.
    pub reference: String,
    pub user_id: String,
    pub token_id: u32,
    pub tx_type: TxType,
    pub status: TxStatus,
    pub amount: f64,
    /// USD value of `amount` at the price in effect when the entry was written.
    #[serde(default)]
    pub usd_value: f64,
    /// On-chain transaction hash this entry was derived from, if any.
    pub tx_hash: Option<String>,
    /// Source wallet of the underlying movement, where known.
    #[serde(default)]
    pub from_address: Option<String>,
    /// Destination wallet of the underlying movement, where known.
    #[serde(default)]
    pub to_address: Option<String>,
    pub description: String,
    /// Free-form structured context (counterparty, observed values, ...).
    pub extra: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn new(
        user_id: &str,
        token_id: u32,
        tx_type: TxType,
        amount: f64,
        description: &str,
    ) -> Self {
        Self {
            reference: format!("tx-{}", Uuid::new_v4()),
            user_id: user_id.to_string(),
            token_id,
            tx_type,
            status: TxStatus::Completed,
            amount,
            usd_value: 0.0,
            tx_hash: None,
            from_address: None,
            to_address: None,
            description: description.to_string(),
            extra: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_hash(mut self, tx_hash: &str) -> Self {
        self.tx_hash = Some(tx_hash.to_string());
        self
    }

    pub fn with_usd_value(mut self, usd_value: f64) -> Self {
        self.usd_value = usd_value;
        self
    }

    pub fn with_addresses(mut self, from: Option<String>, to: Option<String>) -> Self {
        self.from_address = from;
        self.to_address = to;
        self
    }

    /// Entries are born `Completed`; submission-gated flows downgrade to
    /// `Pending` and settle once the chain answers.
    pub fn pending(mut self) -> Self {
        self.status = TxStatus::Pending;
        self
    }

    pub fn with_reference(mut self, reference: &str) -> Self {
        self.reference = reference.to_string();
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// User-facing notification, written best-effort after the ledger commit.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: &str, message: &str) -> Self {
        Self {
            id: format!("ntf-{}", Uuid::new_v4()),
            user_id: user_id.to_string(),
            message: message.to_string(),
            read: false,
            created_at: Utc::now(),
        }
    }
}
