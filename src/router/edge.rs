//! Edge notification pusher
//!
//! Pack handler of the edge queue: decodes each [`EdgeNotification`] and
//! pushes it to the [`EdgeProcessor`] through a [`RetryingDelivery`].
//! Optional [`EdgeStats`] count the outcomes for periodic logging.

use crate::consumer::{HandlerError, MessageHandler};
use crate::core::shutdown::ShutdownCoordinator;
use crate::queue::{Envelope, TenantId};
use crate::router::delivery::RetryingDelivery;
use crate::router::error::{RouterError, RouterResult};
use crate::router::event::{EdgeEventType, EdgeNotification};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Downstream that applies notifications to connected edges
#[async_trait]
pub trait EdgeProcessor: Send + Sync {
    async fn process(
        &self,
        tenant_id: TenantId,
        notification: &EdgeNotification,
    ) -> Result<(), HandlerError>;
}

/// Push counters since the last report
#[derive(Debug, Default)]
pub struct EdgeStats {
    pushed: DashMap<EdgeEventType, usize>,
    failed: AtomicUsize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeStatsSnapshot {
    pub pushed: BTreeMap<EdgeEventType, usize>,
    pub failed: usize,
}

impl EdgeStatsSnapshot {
    pub fn total_pushed(&self) -> usize {
        self.pushed.values().sum()
    }
}

impl EdgeStats {
    pub fn record_pushed(&self, event_type: EdgeEventType) {
        *self.pushed.entry(event_type).or_insert(0) += 1;
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EdgeStatsSnapshot {
        EdgeStatsSnapshot {
            pushed: self.pushed.iter().map(|e| (*e.key(), *e.value())).collect(),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Log the counters accumulated since the previous call and start over
    pub fn report_and_reset(&self) -> EdgeStatsSnapshot {
        let snapshot = EdgeStatsSnapshot {
            pushed: self
                .pushed
                .iter()
                .map(|e| *e.key())
                .collect::<Vec<_>>()
                .into_iter()
                .filter_map(|key| self.pushed.remove(&key))
                .collect(),
            failed: self.failed.swap(0, Ordering::Relaxed),
        };
        if snapshot.total_pushed() > 0 || snapshot.failed > 0 {
            let by_type: Vec<String> = snapshot
                .pushed
                .iter()
                .map(|(event_type, count)| format!("{}={}", event_type, count))
                .collect();
            log::info!(
                "Edge stats: pushed {} [{}], failed {}",
                snapshot.total_pushed(),
                by_type.join(", "),
                snapshot.failed
            );
        }
        snapshot
    }
}

/// Report `stats` every `interval` until shutdown
pub async fn run_edge_stats_reporter(
    stats: Arc<EdgeStats>,
    interval: Duration,
    shutdown: ShutdownCoordinator,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                stats.report_and_reset();
            }
            _ = shutdown.wait() => break,
        }
    }
    stats.report_and_reset();
}

pub struct EdgeNotificationPusher {
    processor: Arc<dyn EdgeProcessor>,
    delivery: RetryingDelivery,
    stats: Option<Arc<EdgeStats>>,
}

impl EdgeNotificationPusher {
    pub fn new(processor: Arc<dyn EdgeProcessor>, delivery: RetryingDelivery) -> Self {
        Self {
            processor,
            delivery,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<EdgeStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub async fn push(&self, tenant_id: TenantId, notification: &EdgeNotification) -> RouterResult<()> {
        log::debug!(
            "[{}] Pushing {} {} notification to edge",
            tenant_id,
            notification.event_type,
            notification.action
        );
        let description = format!("edge notification {}", notification.event_type);
        let result = self
            .delivery
            .deliver(tenant_id, &description, |_| async move {
                self.processor
                    .process(tenant_id, notification)
                    .await
                    .map_err(|e| RouterError::Rejected { message: e.message })
            })
            .await;
        if let Some(stats) = &self.stats {
            match &result {
                Ok(()) => stats.record_pushed(notification.event_type),
                Err(_) => stats.record_failed(),
            }
        }
        result
    }
}

#[async_trait]
impl MessageHandler for EdgeNotificationPusher {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let notification = EdgeNotification::from_envelope(envelope)
            .map_err(|e| HandlerError::new(e.to_string()))?;
        self.push(envelope.tenant_id(), &notification)
            .await
            .map_err(|e| HandlerError::new(e.to_string()))
    }
}
