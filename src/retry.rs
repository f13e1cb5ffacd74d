// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! Bounded retry with linear-multiplied backoff.
//!
//! Chain RPC calls are retried here rather than inside the adapters, so
//! every caller (reconciler, listener, orchestrator, tag registration)
//! shares the same discipline: 3 attempts, base delay multiplied by the
//! attempt number, third consecutive failure surfaced to the caller.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Default number of attempts for chain calls.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default base delay between attempts (multiplied by the attempt number).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Run `op` up to `attempts` times, sleeping `base_delay * attempt` between
/// failures. The final error is returned unchanged.
pub async fn with_backoff<T, E, F, Fut>(
    op_name: &str,
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                warn!(op = op_name, attempt, error = %e, "Retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = base_delay * attempt;
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
