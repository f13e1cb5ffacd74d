// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! LRU cache for hot balance lookups.
//!
//! Caches balance rows per (user, token) key to avoid repeated redb reads
//! on the balance endpoints. Every mutating ledger operation invalidates
//! the touched keys after its commit.
//!
//! Invalidation bumps a per-key generation, and a read can only populate
//! the cache with the generation it observed before going to storage. A
//! read that raced a writer carries a stale generation and its value is
//! discarded instead of being served for the rest of the TTL.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use super::models::Balance;

/// Cached entry: balance row + insertion timestamp.
struct CacheEntry {
    balance: Balance,
    inserted_at: Instant,
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    /// Bumped on every invalidation; one slot per balance key ever cached.
    generations: HashMap<String, u64>,
}

/// In-process LRU cache keyed by the composite balance key.
pub struct BalanceCache {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl BalanceCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(
                    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap()),
                ),
                generations: HashMap::new(),
            }),
            ttl,
        }
    }

    /// Returns `None` if not cached or expired.
    pub fn get(&self, key: &str) -> Option<Balance> {
        let mut inner = self.inner.lock().ok()?;
        if let Some(entry) = inner.entries.get(key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.balance.clone());
            }
            inner.entries.pop(key);
        }
        None
    }

    /// Current generation for a key. Snapshot this before reading storage
    /// and hand it back to [`Self::put_if_current`].
    pub fn generation(&self, key: &str) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.generations.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Insert a value read from storage, unless the key was invalidated
    /// since `generation` was snapshotted.
    pub fn put_if_current(&self, key: &str, balance: Balance, generation: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            let current = inner.generations.get(key).copied().unwrap_or(0);
            if current != generation {
                return;
            }
            inner.entries.put(
                key.to_string(),
                CacheEntry {
                    balance,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.pop(key);
            *inner.generations.entry(key.to_string()).or_insert(0) += 1;
        }
    }
}
