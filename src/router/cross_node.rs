//! Cross-node router
//!
//! Delivers a notification to the node owning its entity: in process when
//! that is this node, otherwise through the owner's private notification
//! topic. The receiving node re-checks ownership in
//! [`accept_remote`](CrossNodeRouter::accept_remote), since the entity may
//! have moved while the message was in flight.
//!
//! With a [`SubscriptionRegistry`] attached, subscription bodies are kept by
//! the owner instead of reaching the local handler, and updates can be fanned
//! out to every subscribed service.

use crate::consumer::{HandlerError, MessageHandler};
use crate::partition::PartitionService;
use crate::queue::{EntityId, Envelope, QueueProducer, ServiceType, TenantId};
use crate::router::delivery::RetryingDelivery;
use crate::router::error::{RouterError, RouterResult};
use crate::router::event::{
    ClusterNotification, NotificationBody, RouteOutcome, RouteReport, RouteState,
    SubscriptionKind, SubscriptionUpdate,
};
use crate::router::subscriptions::SubscriptionRegistry;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Marks notifications addressed to a service rather than an entity owner
pub const DIRECT_HEADER: &str = "direct";

/// In-process consumer of routed notifications
///
/// Must be idempotent: the same notification can arrive more than once.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn on_notification(&self, notification: &ClusterNotification)
        -> Result<(), HandlerError>;
}

pub struct CrossNodeRouter {
    service_type: ServiceType,
    partitions: Arc<PartitionService>,
    producer: Arc<dyn QueueProducer>,
    local: Arc<dyn NotificationHandler>,
    delivery: RetryingDelivery,
    subscriptions: Option<Arc<SubscriptionRegistry>>,
}

impl CrossNodeRouter {
    /// Router for entities of the core service
    pub fn new(
        partitions: Arc<PartitionService>,
        producer: Arc<dyn QueueProducer>,
        local: Arc<dyn NotificationHandler>,
        delivery: RetryingDelivery,
    ) -> Self {
        Self {
            service_type: ServiceType::Core,
            partitions,
            producer,
            local,
            delivery,
            subscriptions: None,
        }
    }

    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    pub fn with_subscriptions(mut self, registry: Arc<SubscriptionRegistry>) -> Self {
        self.subscriptions = Some(registry);
        self
    }

    pub fn subscriptions(&self) -> Option<&Arc<SubscriptionRegistry>> {
        self.subscriptions.as_ref()
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /// Deliver `body` to the owner of `entity_id`
    pub async fn route(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        body: NotificationBody,
    ) -> RouterResult<RouteOutcome> {
        self.route_notification(ClusterNotification::new(tenant_id, entity_id, body))
            .await
            .result
    }

    /// Like [`route`](Self::route), reporting every state the event went through
    pub async fn route_notification(&self, notification: ClusterNotification) -> RouteReport {
        let mut states = vec![RouteState::Created, RouteState::Routing];
        let tenant_id = notification.tenant_id;
        let entity_id = notification.entity_id;

        let tpi = self
            .partitions
            .resolve_main(self.service_type, tenant_id, entity_id);
        let result = if tpi.my_partition {
            self.deliver_local(&notification, &mut states).await
        } else {
            match self
                .partitions
                .resolve_owner(self.service_type, tenant_id, entity_id)
            {
                Some(target) if target == self.partitions.current_service_id() => {
                    self.deliver_local(&notification, &mut states).await
                }
                Some(target) => {
                    self.deliver_remote(&notification, &target, false, &mut states)
                        .await
                }
                None => {
                    log::warn!(
                        "[{}][{}] No live {} service owns {}",
                        tenant_id,
                        entity_id,
                        self.service_type,
                        tpi
                    );
                    states.push(RouteState::FailedTerminal);
                    Err(RouterError::OwnerUnknown {
                        tenant_id,
                        entity_id,
                    })
                }
            }
        };

        RouteReport {
            event_id: notification.event_id,
            states,
            result,
        }
    }

    /// Ask the owner of `entity_id` to send this service `kinds` updates
    ///
    /// An empty `kinds` set cancels the subscription. The owner answers with
    /// a [`NotificationBody::SubscriptionCallback`] carrying `seq_number`.
    pub async fn subscribe(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        kinds: BTreeSet<SubscriptionKind>,
        seq_number: u32,
    ) -> RouterResult<RouteOutcome> {
        let update = SubscriptionUpdate {
            service_id: self.partitions.current_service_id(),
            kinds,
            seq_number,
        };
        self.route(tenant_id, entity_id, NotificationBody::Subscription(update))
            .await
    }

    pub async fn unsubscribe(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> RouterResult<RouteOutcome> {
        self.subscribe(tenant_id, entity_id, BTreeSet::new(), 0).await
    }

    /// Send `body` to every service subscribed to its kind of update
    ///
    /// Returns one result per subscriber; bodies no subscription covers go
    /// nowhere.
    pub async fn notify_subscribers(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        body: NotificationBody,
    ) -> Vec<(String, RouterResult<RouteOutcome>)> {
        let (Some(registry), Some(kind)) = (&self.subscriptions, SubscriptionKind::of(&body)) else {
            return Vec::new();
        };
        let targets = registry.subscribers(entity_id, kind);
        if targets.is_empty() {
            log::trace!("[{}] No {} subscriptions for entity", entity_id, kind);
        }
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let notification = ClusterNotification::new(tenant_id, entity_id, body.clone());
            let result = self.send_to_service(&target, notification).await;
            results.push((target, result));
        }
        results
    }

    /// Deliver to a specific service regardless of entity ownership
    pub async fn send_to_service(
        &self,
        target_service_id: &str,
        notification: ClusterNotification,
    ) -> RouterResult<RouteOutcome> {
        let mut states = vec![RouteState::Created, RouteState::Routing];
        if target_service_id == self.partitions.current_service_id() {
            self.deliver_local(&notification, &mut states).await
        } else {
            self.deliver_remote(&notification, target_service_id, true, &mut states)
                .await
        }
    }

    async fn deliver_local(
        &self,
        notification: &ClusterNotification,
        states: &mut Vec<RouteState>,
    ) -> RouterResult<RouteOutcome> {
        let result = self
            .delivery
            .deliver(notification.tenant_id, "local notification", |attempt| {
                if attempt > 0 {
                    states.push(RouteState::Retrying);
                }
                states.push(RouteState::DeliveredLocal);
                self.apply(notification)
            })
            .await;
        finish(states, result.map(|_| RouteOutcome::DeliveredLocal))
    }

    async fn deliver_remote(
        &self,
        notification: &ClusterNotification,
        target: &str,
        direct: bool,
        states: &mut Vec<RouteState>,
    ) -> RouterResult<RouteOutcome> {
        let mut envelope = match notification.to_envelope(target) {
            Ok(envelope) => envelope,
            Err(e) => return finish(states, Err(e)),
        };
        if direct {
            envelope = envelope.with_header(DIRECT_HEADER, "true");
        }
        let tpi = self.partitions.topics().notifications_topic(target);
        log::trace!(
            "[{}] Forwarding to remote service [{}]: {}",
            notification.entity_id,
            target,
            notification.event_id
        );

        let producer = &self.producer;
        let tpi = &tpi;
        let envelope = &envelope;
        let description = format!("notification for service '{}'", target);
        let result = self
            .delivery
            .deliver(notification.tenant_id, &description, |attempt| {
                if attempt > 0 {
                    states.push(RouteState::Retrying);
                }
                states.push(RouteState::SentRemote);
                async move {
                    producer
                        .send(tpi, envelope.clone())
                        .await
                        .map_err(|source| RouterError::Send {
                            target: tpi.full_topic_name(),
                            source,
                        })
                }
            })
            .await;
        finish(
            states,
            result.map(|_| RouteOutcome::SentRemote {
                target_service_id: target.to_string(),
            }),
        )
    }

    /// Apply a notification received from another node
    ///
    /// Routed notifications are rejected with
    /// [`RouterError::NotMyPartition`] when this node no longer owns the
    /// entity; notifications sent directly to this service are always applied.
    pub async fn accept_remote(&self, envelope: &Envelope) -> RouterResult<ClusterNotification> {
        let notification = ClusterNotification::from_envelope(envelope)?;
        let tenant_id = notification.tenant_id;
        let entity_id = notification.entity_id;

        if envelope.header(DIRECT_HEADER).is_none() {
            let tpi = self
                .partitions
                .resolve_main(self.service_type, tenant_id, entity_id);
            if !tpi.my_partition {
                log::warn!(
                    "[{}][{}] Event belongs to external partition. Probably re-balancing is in progress. Topic: {}",
                    tenant_id,
                    entity_id,
                    tpi
                );
                return Err(RouterError::NotMyPartition {
                    tenant_id,
                    entity_id,
                    topic: tpi.full_topic_name(),
                });
            }
        }

        self.apply(&notification).await?;
        Ok(notification)
    }

    /// Hand a notification this node is responsible for to its consumer
    async fn apply(&self, notification: &ClusterNotification) -> RouterResult<()> {
        if let (NotificationBody::Subscription(update), Some(registry)) =
            (&notification.body, &self.subscriptions)
        {
            registry.update(notification.tenant_id, notification.entity_id, update)?;
            if !update.kinds.is_empty() {
                self.acknowledge_subscription(notification, update).await;
            }
            return Ok(());
        }
        self.local
            .on_notification(notification)
            .await
            .map_err(|e| RouterError::Rejected { message: e.message })
    }

    async fn acknowledge_subscription(
        &self,
        notification: &ClusterNotification,
        update: &SubscriptionUpdate,
    ) {
        let callback = ClusterNotification::new(
            notification.tenant_id,
            notification.entity_id,
            NotificationBody::SubscriptionCallback {
                seq_number: update.seq_number,
            },
        );
        let result = if update.service_id == self.partitions.current_service_id() {
            self.local
                .on_notification(&callback)
                .await
                .map_err(|e| RouterError::Rejected { message: e.message })
        } else {
            self.deliver_remote(&callback, &update.service_id, true, &mut Vec::new())
                .await
                .map(|_| ())
        };
        if let Err(e) = result {
            log::warn!(
                "[{}] Subscription callback {} to '{}' failed: {}",
                notification.entity_id,
                update.seq_number,
                update.service_id,
                e
            );
        }
    }
}

fn finish(
    states: &mut Vec<RouteState>,
    result: RouterResult<RouteOutcome>,
) -> RouterResult<RouteOutcome> {
    states.push(if result.is_ok() {
        RouteState::Acked
    } else {
        RouteState::FailedTerminal
    });
    result
}

/// Lets the router serve as the handler of the node's notification consumer
#[async_trait]
impl MessageHandler for CrossNodeRouter {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match self.accept_remote(envelope).await {
            Ok(_) => Ok(()),
            // the sender saw an older table; redelivery to the new owner is expected
            Err(e) if e.is_ownership_conflict() => {
                log::debug!("{}; dropping notification", e);
                Ok(())
            }
            Err(e) => Err(HandlerError::new(e.to_string())),
        }
    }
}
