// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Embedded ledger backed by redb (pure Rust, ACID).
//!
//! The ledger is the off-chain source of truth for user balances. Every
//! balance mutation is written in the same redb transaction as the ledger
//! entry that explains it, so the balance table and the transaction history
//! can never diverge from each other.
//!
//! ## Table Layout
//!
//! - `users`: user_id → serialized User
//! - `tag_index`: normalized tag → user_id
//! - `balances`: composite key (user_id|token_id) → serialized Balance
//! - `address_index`: composite key (token_id|address) → balance key
//! - `transactions`: reference → serialized LedgerTransaction
//! - `tx_event_index`: composite key (tx_hash|tx_type) → reference
//! - `user_tx_index`: composite key (user_id|!timestamp|reference) → reference
//! - `notifications`: composite key (user_id|!timestamp|id) → serialized Notification
//! - `listener_state`: key → value bytes (e.g., "last_block_BASE" → u64 big-endian)
//! - `locks`: lock name → expiry timestamp millis (u64 big-endian)

pub mod cache;
pub mod lock;
pub mod models;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use cache::BalanceCache;
use models::{balance_key, Balance, LedgerTransaction, Notification, TxStatus, TxType, User};

// =============================================================================
// Table Definitions
// =============================================================================

const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
const TAG_INDEX: TableDefinition<&str, &str> = TableDefinition::new("tag_index");
const BALANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("balances");
const ADDRESS_INDEX: TableDefinition<&str, &str> = TableDefinition::new("address_index");
const TRANSACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("transactions");

/// Idempotency index: (tx_hash|tx_type) → reference. An on-chain hash may
/// appear at most once per entry direction.
const TX_EVENT_INDEX: TableDefinition<&str, &str> = TableDefinition::new("tx_event_index");

/// Key format: `user_id|!timestamp_be|reference` for descending-time scans.
const USER_TX_INDEX: TableDefinition<&[u8], &str> = TableDefinition::new("user_tx_index");

const NOTIFICATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("notifications");
const LISTENER_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("listener_state");
const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

/// Balance cache sizing: one entry per hot (user, token) pair.
const BALANCE_CACHE_CAPACITY: usize = 1024;
const BALANCE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Balance differences below this are float noise, not real money.
pub const BALANCE_EPSILON: f64 = 1e-10;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("tag already taken: {0}")]
    DuplicateTag(String),

    #[error("no balance row for key {0}")]
    MissingBalance(String),

    #[error("insufficient funds: have {available}, need {requested}")]
    InsufficientFunds { available: f64, requested: f64 },
}

pub type LedgerResult<T> = Result<T, LedgerError>;

// =============================================================================
// Index Key Helpers
// =============================================================================

/// Composite key for the user_tx_index table.
///
/// The inverted timestamp ensures newest-first ordering when scanning forward.
fn make_tx_index_key(user_id: &str, timestamp: i64, reference: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_id.len() + 1 + 8 + 1 + reference.len());
    key.extend_from_slice(user_id.as_bytes());
    key.push(b'|');
    key.extend_from_slice(&(!timestamp as u64).to_be_bytes());
    key.push(b'|');
    key.extend_from_slice(reference.as_bytes());
    key
}

fn make_prefix(user_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(user_id.len() + 1);
    prefix.extend_from_slice(user_id.as_bytes());
    prefix.push(b'|');
    prefix
}

fn make_prefix_end(user_id: &str) -> Vec<u8> {
    let mut end = make_prefix(user_id);
    end.extend_from_slice(&[0xFF; 20]);
    end
}

fn event_index_key(tx_hash: &str, tx_type: TxType) -> String {
    let suffix = match tx_type {
        TxType::Credit => "credit",
        TxType::Debit => "debit",
    };
    format!("{}|{suffix}", tx_hash.to_lowercase())
}

fn address_index_key(token_id: u32, wallet_address: &str) -> String {
    format!("{token_id}|{}", wallet_address.to_lowercase())
}

fn in_flight_key(user_id: &str, token_id: u32) -> String {
    format!("inflight|{}", balance_key(user_id, token_id))
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

// =============================================================================
// Event Recording Types
// =============================================================================

/// Everything needed to append one ledger entry and mutate its balance row.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub user_id: String,
    pub token_id: u32,
    pub tx_type: TxType,
    pub amount: f64,
    /// USD per token unit at write time; valuations are frozen into the
    /// entry rather than recomputed later.
    pub price: f64,
    pub tx_hash: String,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub description: String,
    pub extra: Option<serde_json::Value>,
}

/// Result of an idempotent event write.
#[derive(Debug)]
pub enum EventOutcome {
    /// The entry was appended and the balance adjusted.
    Applied(LedgerTransaction),
    /// An entry for this (tx_hash, tx_type) already exists; nothing changed.
    Duplicate(String),
}

/// One side of an internal transfer.
#[derive(Debug, Clone)]
pub struct TransferLeg {
    pub user_id: String,
    pub token_id: u32,
    pub amount: f64,
    pub description: String,
}

/// A full dual-entry transfer: both legs plus the shared on-chain context.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub debit: TransferLeg,
    pub credit: TransferLeg,
    pub tx_hash: String,
    /// USD per token unit at write time.
    pub price: f64,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
}

// =============================================================================
// LedgerStore
// =============================================================================

/// Embedded ACID ledger store.
pub struct LedgerStore {
    db: Database,
    cache: BalanceCache,
}

impl LedgerStore {
    /// Open (or create) the ledger at the given path.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(USERS)?;
            let _ = write_txn.open_table(TAG_INDEX)?;
            let _ = write_txn.open_table(BALANCES)?;
            let _ = write_txn.open_table(ADDRESS_INDEX)?;
            let _ = write_txn.open_table(TRANSACTIONS)?;
            let _ = write_txn.open_table(TX_EVENT_INDEX)?;
            let _ = write_txn.open_table(USER_TX_INDEX)?;
            let _ = write_txn.open_table(NOTIFICATIONS)?;
            let _ = write_txn.open_table(LISTENER_STATE)?;
            let _ = write_txn.open_table(LOCKS)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            cache: BalanceCache::new(BALANCE_CACHE_CAPACITY, BALANCE_CACHE_TTL),
        })
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Create a user for a new tag. The tag index insert and the user row
    /// land in one transaction, so a tag can never map to two users.
    pub fn create_user(&self, tag: &str) -> LedgerResult<User> {
        let user = User::new(tag);
        let json = serde_json::to_vec(&user)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut tag_table = write_txn.open_table(TAG_INDEX)?;
            if tag_table.get(user.tag.as_str())?.is_some() {
                return Err(LedgerError::DuplicateTag(user.tag));
            }
            tag_table.insert(user.tag.as_str(), user.id.as_str())?;

            let mut user_table = write_txn.open_table(USERS)?;
            user_table.insert(user.id.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(user)
    }

    pub fn get_user(&self, user_id: &str) -> LedgerResult<Option<User>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        match table.get(user_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn find_user_by_tag(&self, tag: &str) -> LedgerResult<Option<User>> {
        let normalized = tag.trim().to_lowercase();
        let read_txn = self.db.begin_read()?;
        let tag_table = read_txn.open_table(TAG_INDEX)?;
        let Some(user_id) = tag_table.get(normalized.as_str())? else {
            return Ok(None);
        };
        let user_table = read_txn.open_table(USERS)?;
        match user_table.get(user_id.value())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Balances
    // =========================================================================

    /// Fetch a balance row, creating a zero row if none exists yet. Also
    /// maintains the address index used by event ingestion.
    pub fn get_or_create_balance(
        &self,
        user_id: &str,
        token_id: u32,
        wallet_address: &str,
    ) -> LedgerResult<Balance> {
        if let Some(existing) = self.get_balance(user_id, token_id)? {
            return Ok(existing);
        }

        let balance = Balance::new(user_id, token_id, wallet_address);
        let json = serde_json::to_vec(&balance)?;
        let key = balance.key();
        let addr_key = address_index_key(token_id, wallet_address);

        let write_txn = self.db.begin_write()?;
        {
            let mut balances = write_txn.open_table(BALANCES)?;
            balances.insert(key.as_str(), json.as_slice())?;

            let mut addr_index = write_txn.open_table(ADDRESS_INDEX)?;
            addr_index.insert(addr_key.as_str(), key.as_str())?;
        }
        write_txn.commit()?;
        Ok(balance)
    }

    pub fn get_balance(&self, user_id: &str, token_id: u32) -> LedgerResult<Option<Balance>> {
        let key = balance_key(user_id, token_id);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(Some(cached));
        }

        // Snapshot before the storage read so a write that lands in between
        // cannot be shadowed by this (now stale) value.
        let generation = self.cache.generation(&key);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BALANCES)?;
        match table.get(key.as_str())? {
            Some(value) => {
                let balance: Balance = serde_json::from_slice(value.value())?;
                self.cache.put_if_current(&key, balance.clone(), generation);
                Ok(Some(balance))
            }
            None => Ok(None),
        }
    }

    /// All balance rows for a user, one per token held.
    pub fn list_balances(&self, user_id: &str) -> LedgerResult<Vec<Balance>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BALANCES)?;

        let prefix = format!("{user_id}|");
        let end = format!("{user_id}|\u{10FFFF}");
        let mut balances = Vec::new();
        for entry in table.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            balances.push(serde_json::from_slice(entry.1.value())?);
        }
        Ok(balances)
    }

    /// Every balance row in the ledger, in key order. Used by the
    /// reconciliation sweep.
    pub fn all_balances(&self) -> LedgerResult<Vec<Balance>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BALANCES)?;
        let mut balances = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            balances.push(serde_json::from_slice(entry.1.value())?);
        }
        Ok(balances)
    }

    /// Resolve a balance row from the custodial wallet address an on-chain
    /// event was observed on.
    pub fn find_balance_by_address(
        &self,
        token_id: u32,
        wallet_address: &str,
    ) -> LedgerResult<Option<Balance>> {
        let addr_key = address_index_key(token_id, wallet_address);
        let read_txn = self.db.begin_read()?;
        let addr_index = read_txn.open_table(ADDRESS_INDEX)?;
        let Some(key) = addr_index.get(addr_key.as_str())? else {
            return Ok(None);
        };
        let balances = read_txn.open_table(BALANCES)?;
        match balances.get(key.value())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Adjust a balance by a signed delta outside of any ledger entry.
    /// Only used by tests and tooling; production paths go through
    /// `record_event` or `record_transfer`.
    pub fn apply_delta(
        &self,
        user_id: &str,
        token_id: u32,
        delta: f64,
        price: f64,
    ) -> LedgerResult<f64> {
        let key = balance_key(user_id, token_id);
        let write_txn = self.db.begin_write()?;
        let new_amount;
        {
            let mut balances = write_txn.open_table(BALANCES)?;
            new_amount = adjust_balance(&mut balances, &key, delta, price)?;
        }
        write_txn.commit()?;
        self.cache.invalidate(&key);
        Ok(new_amount)
    }

    // =========================================================================
    // Event Recording
    // =========================================================================

    /// Append a ledger entry and adjust its balance row in one transaction.
    ///
    /// Idempotent on (tx_hash, tx_type): replaying the same on-chain event
    /// returns `Duplicate` and changes nothing.
    pub fn record_event(&self, record: EventRecord) -> LedgerResult<EventOutcome> {
        let event_key = event_index_key(&record.tx_hash, record.tx_type);
        let key = balance_key(&record.user_id, record.token_id);

        let mut tx = LedgerTransaction::new(
            &record.user_id,
            record.token_id,
            record.tx_type,
            record.amount,
            &record.description,
        )
        .with_hash(&record.tx_hash)
        .with_usd_value(record.amount * record.price)
        .with_addresses(record.from_address, record.to_address);
        if let Some(extra) = record.extra {
            tx = tx.with_extra(extra);
        }
        let json = serde_json::to_vec(&tx)?;
        let index_key = make_tx_index_key(&tx.user_id, tx.created_at.timestamp(), &tx.reference);

        let write_txn = self.db.begin_write()?;
        {
            let mut event_index = write_txn.open_table(TX_EVENT_INDEX)?;
            if let Some(existing) = event_index.get(event_key.as_str())? {
                return Ok(EventOutcome::Duplicate(existing.value().to_string()));
            }
            event_index.insert(event_key.as_str(), tx.reference.as_str())?;

            let mut tx_table = write_txn.open_table(TRANSACTIONS)?;
            tx_table.insert(tx.reference.as_str(), json.as_slice())?;

            let mut user_index = write_txn.open_table(USER_TX_INDEX)?;
            user_index.insert(index_key.as_slice(), tx.reference.as_str())?;

            let delta = match record.tx_type {
                TxType::Credit => record.amount,
                TxType::Debit => -record.amount,
            };
            let mut balances = write_txn.open_table(BALANCES)?;
            adjust_balance(&mut balances, &key, delta, record.price)?;
        }
        write_txn.commit()?;
        self.cache.invalidate(&key);
        Ok(EventOutcome::Applied(tx))
    }

    /// Record an internal transfer as a debit entry plus a credit entry in
    /// one transaction. Either both legs land or neither does.
    ///
    /// Idempotent per leg on (tx_hash, direction): a leg the chain listener
    /// already recorded for this hash is returned as-is instead of being
    /// applied a second time. The debit leg refuses to overdraw; the check
    /// runs inside the write transaction, so concurrent transfers serialize
    /// against it.
    pub fn record_transfer(
        &self,
        record: TransferRecord,
    ) -> LedgerResult<(LedgerTransaction, LedgerTransaction)> {
        let pair_id = uuid::Uuid::new_v4();
        let debit_key = balance_key(&record.debit.user_id, record.debit.token_id);
        let credit_key = balance_key(&record.credit.user_id, record.credit.token_id);
        let debit_event_key = event_index_key(&record.tx_hash, TxType::Debit);
        let credit_event_key = event_index_key(&record.tx_hash, TxType::Credit);

        let write_txn = self.db.begin_write()?;
        let debit_tx;
        let credit_tx;
        {
            let mut balances = write_txn.open_table(BALANCES)?;
            let mut tx_table = write_txn.open_table(TRANSACTIONS)?;
            let mut user_index = write_txn.open_table(USER_TX_INDEX)?;
            let mut event_index = write_txn.open_table(TX_EVENT_INDEX)?;

            debit_tx = match existing_leg(&event_index, &tx_table, &debit_event_key)? {
                Some(tx) => tx,
                None => {
                    let new_amount = adjust_balance(
                        &mut balances,
                        &debit_key,
                        -record.debit.amount,
                        record.price,
                    )?;
                    if new_amount < -BALANCE_EPSILON {
                        return Err(LedgerError::InsufficientFunds {
                            available: new_amount + record.debit.amount,
                            requested: record.debit.amount,
                        });
                    }
                    let tx = LedgerTransaction::new(
                        &record.debit.user_id,
                        record.debit.token_id,
                        TxType::Debit,
                        record.debit.amount,
                        &record.debit.description,
                    )
                    .with_reference(&format!("xfer-{pair_id}-d"))
                    .with_hash(&record.tx_hash)
                    .with_usd_value(record.debit.amount * record.price)
                    .with_addresses(record.from_address.clone(), record.to_address.clone());

                    let json = serde_json::to_vec(&tx)?;
                    tx_table.insert(tx.reference.as_str(), json.as_slice())?;
                    user_index.insert(
                        make_tx_index_key(&tx.user_id, tx.created_at.timestamp(), &tx.reference)
                            .as_slice(),
                        tx.reference.as_str(),
                    )?;
                    event_index.insert(debit_event_key.as_str(), tx.reference.as_str())?;
                    tx
                }
            };

            credit_tx = match existing_leg(&event_index, &tx_table, &credit_event_key)? {
                Some(tx) => tx,
                None => {
                    adjust_balance(
                        &mut balances,
                        &credit_key,
                        record.credit.amount,
                        record.price,
                    )?;
                    let tx = LedgerTransaction::new(
                        &record.credit.user_id,
                        record.credit.token_id,
                        TxType::Credit,
                        record.credit.amount,
                        &record.credit.description,
                    )
                    .with_reference(&format!("xfer-{pair_id}-c"))
                    .with_hash(&record.tx_hash)
                    .with_usd_value(record.credit.amount * record.price)
                    .with_addresses(record.from_address.clone(), record.to_address.clone());

                    let json = serde_json::to_vec(&tx)?;
                    tx_table.insert(tx.reference.as_str(), json.as_slice())?;
                    user_index.insert(
                        make_tx_index_key(&tx.user_id, tx.created_at.timestamp(), &tx.reference)
                            .as_slice(),
                        tx.reference.as_str(),
                    )?;
                    event_index.insert(credit_event_key.as_str(), tx.reference.as_str())?;
                    tx
                }
            };
        }
        write_txn.commit()?;
        self.cache.invalidate(&debit_key);
        self.cache.invalidate(&credit_key);
        Ok((debit_tx, credit_tx))
    }

    /// Reserve funds for a withdrawal before its on-chain submission.
    ///
    /// Writes a `Pending` debit entry and applies the delta in one
    /// transaction, refusing to overdraw. The entry has no hash yet:
    /// [`Self::settle_transaction`] attaches it once the chain accepts the
    /// submission, and [`Self::fail_transaction`] returns the funds if it
    /// does not.
    pub fn record_pending_withdrawal(
        &self,
        debit: TransferLeg,
        price: f64,
        from_address: Option<&str>,
        to_address: Option<&str>,
    ) -> LedgerResult<LedgerTransaction> {
        let key = balance_key(&debit.user_id, debit.token_id);
        let tx = LedgerTransaction::new(
            &debit.user_id,
            debit.token_id,
            TxType::Debit,
            debit.amount,
            &debit.description,
        )
        .with_usd_value(debit.amount * price)
        .with_addresses(
            from_address.map(str::to_string),
            to_address.map(str::to_string),
        )
        .pending();
        let json = serde_json::to_vec(&tx)?;
        let index_key = make_tx_index_key(&tx.user_id, tx.created_at.timestamp(), &tx.reference);

        let write_txn = self.db.begin_write()?;
        {
            let mut balances = write_txn.open_table(BALANCES)?;
            let new_amount = adjust_balance(&mut balances, &key, -debit.amount, price)?;
            if new_amount < -BALANCE_EPSILON {
                return Err(LedgerError::InsufficientFunds {
                    available: new_amount + debit.amount,
                    requested: debit.amount,
                });
            }

            let mut tx_table = write_txn.open_table(TRANSACTIONS)?;
            tx_table.insert(tx.reference.as_str(), json.as_slice())?;

            let mut user_index = write_txn.open_table(USER_TX_INDEX)?;
            user_index.insert(index_key.as_slice(), tx.reference.as_str())?;
        }
        write_txn.commit()?;
        self.cache.invalidate(&key);
        Ok(tx)
    }

    /// Whether a ledger entry already exists for this (tx_hash, tx_type).
    pub fn has_event(&self, tx_hash: &str, tx_type: TxType) -> LedgerResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TX_EVENT_INDEX)?;
        Ok(table.get(event_index_key(tx_hash, tx_type).as_str())?.is_some())
    }

    pub fn get_transaction(&self, reference: &str) -> LedgerResult<Option<LedgerTransaction>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSACTIONS)?;
        match table.get(reference)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Newest-first transaction listing for a user.
    pub fn list_transactions_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> LedgerResult<Vec<LedgerTransaction>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(USER_TX_INDEX)?;
        let tx_table = read_txn.open_table(TRANSACTIONS)?;

        let prefix = make_prefix(user_id);
        let end = make_prefix_end(user_id);

        let mut results = Vec::with_capacity(limit);
        for entry in index.range(prefix.as_slice()..end.as_slice())? {
            let entry = entry?;
            let reference = entry.1.value();
            if let Some(value) = tx_table.get(reference)? {
                results.push(serde_json::from_slice(value.value())?);
            }
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Settle a pending withdrawal whose on-chain submission was accepted.
    ///
    /// Attaches the hash and registers it in the event index so the chain
    /// listener skips the movement. If the listener observed and recorded
    /// the hash before this call, its entry already moved the funds and the
    /// pending reservation is returned in the same transaction.
    pub fn settle_transaction(
        &self,
        reference: &str,
        tx_hash: &str,
    ) -> LedgerResult<LedgerTransaction> {
        let write_txn = self.db.begin_write()?;
        let updated;
        let key;
        {
            let mut tx_table = write_txn.open_table(TRANSACTIONS)?;
            let mut tx = load_pending(&tx_table, reference)?;
            key = balance_key(&tx.user_id, tx.token_id);
            tx.tx_hash = Some(tx_hash.to_string());
            tx.status = TxStatus::Completed;

            let event_key = event_index_key(tx_hash, tx.tx_type);
            let mut event_index = write_txn.open_table(TX_EVENT_INDEX)?;
            let raced = event_index
                .get(event_key.as_str())?
                .map(|v| v.value().to_string());
            match raced {
                None => {
                    event_index.insert(event_key.as_str(), reference)?;
                }
                Some(_) => {
                    // The listener won the race and applied this movement;
                    // undo the reservation so it counts only once.
                    let mut balances = write_txn.open_table(BALANCES)?;
                    adjust_balance(&mut balances, &key, tx.amount, unit_price(&tx))?;
                }
            }

            let json = serde_json::to_vec(&tx)?;
            tx_table.insert(reference, json.as_slice())?;
            updated = tx;
        }
        write_txn.commit()?;
        self.cache.invalidate(&key);
        Ok(updated)
    }

    /// Fail a pending withdrawal whose on-chain submission was rejected,
    /// returning the reserved funds in the same transaction.
    pub fn fail_transaction(&self, reference: &str) -> LedgerResult<LedgerTransaction> {
        let write_txn = self.db.begin_write()?;
        let updated;
        let key;
        {
            let mut tx_table = write_txn.open_table(TRANSACTIONS)?;
            let mut tx = load_pending(&tx_table, reference)?;
            key = balance_key(&tx.user_id, tx.token_id);
            tx.status = TxStatus::Failed;

            let mut balances = write_txn.open_table(BALANCES)?;
            adjust_balance(&mut balances, &key, tx.amount, unit_price(&tx))?;

            let json = serde_json::to_vec(&tx)?;
            tx_table.insert(reference, json.as_slice())?;
            updated = tx;
        }
        write_txn.commit()?;
        self.cache.invalidate(&key);
        Ok(updated)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Best-effort user notification, written outside the ledger transaction
    /// it describes.
    pub fn create_notification(&self, user_id: &str, message: &str) -> LedgerResult<Notification> {
        let notification = Notification::new(user_id, message);
        let json = serde_json::to_vec(&notification)?;
        let key = make_tx_index_key(
            user_id,
            notification.created_at.timestamp(),
            &notification.id,
        );

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(NOTIFICATIONS)?;
            table.insert(key.as_slice(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(notification)
    }

    /// Newest-first notifications for a user.
    pub fn list_notifications(
        &self,
        user_id: &str,
        limit: usize,
    ) -> LedgerResult<Vec<Notification>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(NOTIFICATIONS)?;

        let prefix = make_prefix(user_id);
        let end = make_prefix_end(user_id);

        let mut results = Vec::with_capacity(limit);
        for entry in table.range(prefix.as_slice()..end.as_slice())? {
            let entry = entry?;
            results.push(serde_json::from_slice(entry.1.value())?);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    // =========================================================================
    // Listener Checkpoints
    // =========================================================================

    /// Last fully processed block for a chain. 0 means no checkpoint yet.
    pub fn last_processed_block(&self, chain_key: &str) -> LedgerResult<u64> {
        let key = format!("last_block_{chain_key}");
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LISTENER_STATE)?;
        match table.get(key.as_str())? {
            Some(v) => {
                let bytes = v.value();
                if bytes.len() >= 8 {
                    Ok(u64::from_be_bytes(bytes[..8].try_into().unwrap()))
                } else {
                    Ok(0)
                }
            }
            None => Ok(0),
        }
    }

    pub fn set_last_processed_block(&self, chain_key: &str, block: u64) -> LedgerResult<()> {
        let key = format!("last_block_{chain_key}");
        let bytes = block.to_be_bytes();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LISTENER_STATE)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Locks and In-Flight Markers
    // =========================================================================

    /// Try to take a named TTL lock. Returns false if another holder's lock
    /// has not expired yet. Expired locks are silently reclaimed.
    pub fn try_acquire_lock(&self, name: &str, ttl: Duration) -> LedgerResult<bool> {
        let now = now_millis();
        let expires_at = now + ttl.as_millis() as u64;

        let write_txn = self.db.begin_write()?;
        let acquired;
        {
            let mut table = write_txn.open_table(LOCKS)?;
            let current = table.get(name)?.map(|v| {
                let bytes = v.value();
                if bytes.len() >= 8 {
                    u64::from_be_bytes(bytes[..8].try_into().unwrap())
                } else {
                    0
                }
            });
            acquired = match current {
                Some(expiry) if expiry > now => false,
                _ => {
                    table.insert(name, expires_at.to_be_bytes().as_slice())?;
                    true
                }
            };
        }
        write_txn.commit()?;
        Ok(acquired)
    }

    pub fn release_lock(&self, name: &str) -> LedgerResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LOCKS)?;
            table.remove(name)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Mark a balance as having a transfer in flight. The reconciler skips
    /// marked balances so half-settled transfers are not "corrected" away.
    pub fn mark_in_flight(&self, user_id: &str, token_id: u32, ttl: Duration) -> LedgerResult<()> {
        let key = in_flight_key(user_id, token_id);
        let expires_at = now_millis() + ttl.as_millis() as u64;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LOCKS)?;
            table.insert(key.as_str(), expires_at.to_be_bytes().as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn clear_in_flight(&self, user_id: &str, token_id: u32) -> LedgerResult<()> {
        self.release_lock(&in_flight_key(user_id, token_id))
    }

    pub fn is_in_flight(&self, user_id: &str, token_id: u32) -> LedgerResult<bool> {
        let key = in_flight_key(user_id, token_id);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LOCKS)?;
        match table.get(key.as_str())? {
            Some(v) => {
                let bytes = v.value();
                let expiry = if bytes.len() >= 8 {
                    u64::from_be_bytes(bytes[..8].try_into().unwrap())
                } else {
                    0
                };
                Ok(expiry > now_millis())
            }
            None => Ok(false),
        }
    }
}

/// Read-modify-write a balance row inside an open write transaction.
fn adjust_balance(
    table: &mut redb::Table<&str, &[u8]>,
    key: &str,
    delta: f64,
    price: f64,
) -> LedgerResult<f64> {
    let existing_bytes = {
        let existing = table
            .get(key)?
            .ok_or_else(|| LedgerError::MissingBalance(key.to_string()))?;
        existing.value().to_vec()
    };

    let mut balance: Balance = serde_json::from_slice(&existing_bytes)?;
    balance.amount += delta;
    balance.usd_value = balance.amount * price;
    balance.updated_at = Utc::now();

    let json = serde_json::to_vec(&balance)?;
    table.insert(key, json.as_slice())?;
    Ok(balance.amount)
}

/// Look up the transaction a (tx_hash, direction) index entry points at.
fn existing_leg(
    event_index: &redb::Table<&str, &str>,
    tx_table: &redb::Table<&str, &[u8]>,
    event_key: &str,
) -> LedgerResult<Option<LedgerTransaction>> {
    let Some(reference) = event_index.get(event_key)? else {
        return Ok(None);
    };
    let reference = reference.value().to_string();
    match tx_table.get(reference.as_str())? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

fn load_pending(
    tx_table: &redb::Table<&str, &[u8]>,
    reference: &str,
) -> LedgerResult<LedgerTransaction> {
    let bytes = {
        let existing = tx_table
            .get(reference)?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {reference}")))?;
        existing.value().to_vec()
    };
    let tx: LedgerTransaction = serde_json::from_slice(&bytes)?;
    if tx.status != TxStatus::Pending {
        return Err(LedgerError::NotFound(format!(
            "pending transaction {reference}"
        )));
    }
    Ok(tx)
}

/// Recover the per-unit valuation frozen into an entry at write time.
fn unit_price(tx: &LedgerTransaction) -> f64 {
    if tx.amount > 0.0 {
        tx.usd_value / tx.amount
    } else {
        0.0
    }
}
