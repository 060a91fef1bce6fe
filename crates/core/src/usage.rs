//! Background template usage counting.
//!
//! Creating a record from a template bumps the template's usage counter. The bump is
//! best-effort: the create response never waits for it, and a failure is logged and dropped.
//!
//! Work goes through a bounded queue served by a fixed set of worker tasks:
//! - enqueueing never blocks; when the queue is full the increment is dropped with a warning
//! - each increment runs once, under its own timeout, outside any request's cancellation
//! - [`UsageRecorder::shutdown`] closes the queue and waits for queued work to drain

use crate::config::CoreConfig;
use crate::ids::TemplateId;
use crate::store::TemplateStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Result of handing an increment to the recorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    /// Queue full; the increment was discarded.
    Dropped,
    /// The recorder has been shut down.
    Closed,
}

/// Counters describing what the recorder has done so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageStats {
    pub accepted: u64,
    pub dropped: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Bounded worker pool for template usage increments.
pub struct UsageRecorder {
    sender: Mutex<Option<mpsc::Sender<TemplateId>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl UsageRecorder {
    /// Starts the worker pool. Must be called from within a Tokio runtime.
    pub fn spawn(store: Arc<dyn TemplateStore>, cfg: &CoreConfig) -> Self {
        let (tx, rx) = mpsc::channel(cfg.usage_queue_capacity());
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = (0..cfg.usage_workers())
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&rx),
                    Arc::clone(&store),
                    cfg.usage_timeout(),
                    Arc::clone(&counters),
                ))
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            counters,
        }
    }

    /// Queues a usage increment without waiting.
    pub fn record(&self, template_id: TemplateId) -> Enqueue {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(tx) = sender.as_ref() else {
            return Enqueue::Closed;
        };

        match tx.try_send(template_id) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Enqueue::Accepted
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%template_id, "template usage queue full; increment dropped");
                Enqueue::Dropped
            }
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    pub fn stats(&self) -> UsageStats {
        UsageStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting work and waits for already queued increments to finish.
    pub async fn shutdown(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take(),
        );
        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "template usage worker terminated abnormally");
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TemplateId>>>,
    store: Arc<dyn TemplateStore>,
    timeout: Duration,
    counters: Arc<Counters>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(template_id) = next else {
            tracing::debug!(worker, "template usage worker stopping");
            return;
        };

        match tokio::time::timeout(timeout, store.increment_usage(&template_id)).await {
            Ok(Ok(())) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(worker, %template_id, "template usage incremented");
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker, %template_id, error = %e, "template usage increment failed");
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker, %template_id, "template usage increment timed out");
            }
        }
    }
}
