// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Tagpay

//! In-process task queue with at-least-once delivery.
//!
//! Jobs are handed to a single worker task. A failed job is re-enqueued
//! with a linearly growing delay until its attempt budget is spent, then
//! dropped with an error log. Consumers must therefore be idempotent.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::retry::{DEFAULT_ATTEMPTS, DEFAULT_BASE_DELAY};

/// Outcome type handlers report; the queue only cares about success/failure.
pub type JobResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[async_trait]
pub trait JobHandler<T>: Send + Sync {
    async fn handle(&self, job: &T) -> JobResult;
}

struct Envelope<T> {
    job: T,
    attempt: u32,
}

/// Unbounded MPSC queue. The receiver half is claimed by the first (only)
/// call to `run_worker`.
pub struct TaskQueue<T> {
    tx: mpsc::UnboundedSender<Envelope<T>>,
    rx: StdMutex<Option<mpsc::UnboundedReceiver<Envelope<T>>>>,
    max_attempts: u32,
    base_delay: Duration,
}

impl<T: Send + 'static> TaskQueue<T> {
    pub fn new() -> Self {
        Self::with_retry(DEFAULT_ATTEMPTS, DEFAULT_BASE_DELAY)
    }

    pub fn with_retry(max_attempts: u32, base_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: StdMutex::new(Some(rx)),
            max_attempts,
            base_delay,
        }
    }

    /// Enqueue a job for its first attempt. Never blocks.
    pub fn enqueue(&self, job: T) {
        if self.tx.send(Envelope { job, attempt: 1 }).is_err() {
            tracing::error!("task queue closed, dropping job");
        }
    }

    /// Run the consumer loop until cancelled. Panics if the worker has
    /// already been started once.
    pub async fn run_worker(
        self: Arc<Self>,
        handler: Arc<dyn JobHandler<T>>,
        shutdown: CancellationToken,
    ) {
        let mut rx = self
            .rx
            .lock()
            .expect("queue receiver mutex poisoned")
            .take()
            .expect("queue worker already started");

        tracing::info!("Task queue worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Task queue worker shutting down");
                    break;
                }
                received = rx.recv() => {
                    let Some(envelope) = received else { break };
                    self.process(envelope, handler.as_ref()).await;
                }
            }
        }
    }

    async fn process(&self, envelope: Envelope<T>, handler: &dyn JobHandler<T>) {
        let Envelope { job, attempt } = envelope;
        match handler.handle(&job).await {
            Ok(()) => {}
            Err(error) if attempt < self.max_attempts => {
                let delay = self.base_delay * attempt;
                tracing::warn!(
                    attempt,
                    max_attempts = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "job failed, re-enqueueing"
                );
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Envelope {
                        job,
                        attempt: attempt + 1,
                    });
                });
            }
            Err(error) => {
                tracing::error!(
                    attempt,
                    %error,
                    "job failed permanently, dropping"
                );
            }
        }
    }

    /// Pull everything currently queued without running the worker loop.
    #[cfg(test)]
    pub(crate) fn drain_for_test(&self) -> Vec<T> {
        let mut guard = self.rx.lock().expect("queue receiver mutex poisoned");
        let rx = guard.as_mut().expect("queue worker already started");
        let mut jobs = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            jobs.push(envelope.job);
        }
        jobs
    }
}

impl<T: Send + 'static> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
