//! Pack processing
//!
//! One polled batch is processed as a unit with a shared deadline. Every
//! message gets a fresh correlation id and is dispatched through the
//! manager's bounded worker pool; per-message callbacks move ids from the
//! pending map to the failed map. The pack resolves when pending drains or
//! the deadline passes. On timeout the outstanding dispatches are aborted
//! and the pack is committed anyway: stragglers are covered by redelivery,
//! not by waiting. Failed messages get up to `retries` further rounds with
//! the same correlation ids before they are handed to the dead-letter sink.
//! Retry rounds share the pack's deadline; none starts after it passed.

use crate::consumer::handler::{
    DeadLetterSink, HandlerError, LoggingDeadLetterSink, MessageHandler,
};
use crate::queue::{Envelope, QueueKey};
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

/// How a pack resolved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackOutcome {
    pub total: usize,
    pub succeeded: usize,
    /// Messages that needed at least one retry round
    pub retried: usize,
    /// Terminal failures, already handed to the dead-letter sink
    pub failed: Vec<Uuid>,
    /// Still in flight when the pack deadline passed
    pub timed_out: Vec<Uuid>,
}

impl PackOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

struct PackProcessingContext {
    pending: DashMap<Uuid, Envelope>,
    failed: DashMap<Uuid, (Envelope, String)>,
    /// Dispatch order
    order: Vec<Uuid>,
    succeeded: AtomicUsize,
    resolved: Notify,
}

impl PackProcessingContext {
    fn new(entries: &[(Uuid, Envelope)]) -> Self {
        Self {
            pending: entries.iter().cloned().collect(),
            failed: DashMap::new(),
            order: entries.iter().map(|(id, _)| *id).collect(),
            succeeded: AtomicUsize::new(0),
            resolved: Notify::new(),
        }
    }

    fn on_success(&self, id: Uuid) {
        if self.pending.remove(&id).is_some() {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
            self.notify_if_resolved();
        }
    }

    fn on_failure(&self, id: Uuid, error: HandlerError) {
        // Record before removing: a waiter seeing an empty pending map must
        // also see the failure
        let Some(envelope) = self.pending.get(&id).map(|e| e.clone()) else {
            return;
        };
        self.failed.insert(id, (envelope, error.message));
        self.pending.remove(&id);
        self.notify_if_resolved();
    }

    fn notify_if_resolved(&self) {
        if self.pending.is_empty() {
            self.resolved.notify_one();
        }
    }

    async fn wait_resolved(&self) {
        while !self.pending.is_empty() {
            self.resolved.notified().await;
        }
    }

    fn still_pending(&self) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| self.pending.contains_key(*id))
            .copied()
            .collect()
    }

    fn take_failed(&self) -> Vec<(Uuid, Envelope, String)> {
        self.order
            .iter()
            .filter_map(|id| self.failed.remove(id))
            .map(|(id, (envelope, reason))| (id, envelope, reason))
            .collect()
    }
}

struct RoundResult {
    succeeded: usize,
    failed: Vec<(Uuid, Envelope, String)>,
    timed_out: Vec<Uuid>,
}

/// Processes packs of one queue
#[derive(Clone)]
pub struct PackProcessor {
    queue_key: QueueKey,
    handler: Arc<dyn MessageHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    retries: u32,
}

impl PackProcessor {
    /// `permits` bounds concurrent dispatches and may be shared between
    /// processors of the same queue
    pub fn new(
        queue_key: QueueKey,
        handler: Arc<dyn MessageHandler>,
        permits: Arc<Semaphore>,
        timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            queue_key,
            handler,
            dead_letters: Arc::new(LoggingDeadLetterSink),
            permits,
            timeout,
            retries,
        }
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    pub fn queue_key(&self) -> &QueueKey {
        &self.queue_key
    }

    /// Process `batch` until every message succeeded, failed terminally or
    /// timed out
    ///
    /// The caller commits after this returns, whatever the outcome.
    pub async fn process(&self, batch: Vec<Envelope>) -> PackOutcome {
        let mut outcome = PackOutcome {
            total: batch.len(),
            ..PackOutcome::default()
        };
        if batch.is_empty() {
            return outcome;
        }

        let deadline = Instant::now() + self.timeout;
        let entries: Vec<(Uuid, Envelope)> =
            batch.into_iter().map(|e| (Uuid::new_v4(), e)).collect();
        let mut round = self.run_round(entries, deadline).await;
        outcome.succeeded += round.succeeded;
        outcome.timed_out.append(&mut round.timed_out);
        outcome.retried = round.failed.len();

        let mut attempt = 0;
        while !round.failed.is_empty() && attempt < self.retries {
            if Instant::now() >= deadline {
                log::debug!(
                    "[{}] Pack deadline passed, {} failed messages not retried",
                    self.queue_key,
                    round.failed.len()
                );
                break;
            }
            attempt += 1;
            log::debug!(
                "[{}] Retrying {} failed messages ({}/{})",
                self.queue_key,
                round.failed.len(),
                attempt,
                self.retries
            );
            let entries = std::mem::take(&mut round.failed)
                .into_iter()
                .map(|(id, envelope, _)| (id, envelope))
                .collect();
            round = self.run_round(entries, deadline).await;
            outcome.succeeded += round.succeeded;
            outcome.timed_out.append(&mut round.timed_out);
        }

        for (id, envelope, reason) in round.failed {
            self.dead_letters
                .dead_letter(&self.queue_key, &envelope, &reason)
                .await;
            outcome.failed.push(id);
        }

        if !outcome.is_clean() {
            log::debug!("[{}] Pack resolved: {:?}", self.queue_key, outcome);
        }
        outcome
    }

    async fn run_round(&self, entries: Vec<(Uuid, Envelope)>, deadline: Instant) -> RoundResult {
        let context = Arc::new(PackProcessingContext::new(&entries));
        let mut tasks = JoinSet::new();

        for (id, envelope) in entries {
            let context = context.clone();
            let handler = self.handler.clone();
            let permits = self.permits.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    context.on_failure(id, HandlerError::new("worker pool closed"));
                    return;
                };
                match AssertUnwindSafe(handler.handle(&envelope))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => context.on_success(id),
                    Ok(Err(e)) => context.on_failure(id, e),
                    Err(_) => context.on_failure(id, HandlerError::new("handler panicked")),
                }
            });
        }

        let resolved = tokio::time::timeout_at(deadline, context.wait_resolved())
            .await
            .is_ok();
        // Aborts whatever is still running and waits for it
        tasks.shutdown().await;

        let timed_out = if resolved {
            Vec::new()
        } else {
            let stragglers = context.still_pending();
            if let Some(last) = stragglers.last().and_then(|id| context.pending.get(id)) {
                log::info!(
                    "[{}] Timeout to process pack: {} messages still in flight, last {} [{}]",
                    self.queue_key,
                    stragglers.len(),
                    last.correlation_id,
                    last.tenant_id()
                );
            }
            stragglers
        };

        RoundResult {
            succeeded: context.succeeded.load(Ordering::Relaxed),
            failed: context.take_failed(),
            timed_out,
        }
    }
}
