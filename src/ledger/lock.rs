// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! RAII guard for the ledger's named TTL locks.

use std::sync::Arc;
use std::time::Duration;

use super::{LedgerResult, LedgerStore};

/// Holds a named ledger lock and releases it on drop.
///
/// Release is best-effort: if the process dies before the drop runs, the
/// lock's TTL bounds how long other workers stay excluded.
pub struct SweepLockGuard {
    store: Arc<LedgerStore>,
    name: String,
}

impl SweepLockGuard {
    /// Try to take the lock. Returns `None` when another holder's TTL has
    /// not expired yet.
    pub fn acquire(
        store: Arc<LedgerStore>,
        name: &str,
        ttl: Duration,
    ) -> LedgerResult<Option<Self>> {
        if store.try_acquire_lock(name, ttl)? {
            Ok(Some(Self {
                store,
                name: name.to_string(),
            }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for SweepLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_lock(&self.name) {
            tracing::warn!(lock = %self.name, error = %e, "failed to release ledger lock");
        }
    }
}
