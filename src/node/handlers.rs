//! Business handlers plugged into a node

use crate::consumer::{DeadLetterSink, HandlerError, LoggingDeadLetterSink, MessageHandler};
use crate::queue::{Envelope, ServiceType, TenantId};
use crate::router::{ClusterNotification, EdgeNotification, EdgeProcessor, NotificationHandler};
use async_trait::async_trait;
use std::sync::Arc;

/// Acknowledges everything, logging at debug level
///
/// Payloads are opaque to the cluster core; a bare node runs with this
/// handler until the embedding application supplies real ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        log::debug!(
            "[{}] Consumed {} ({} bytes)",
            envelope.tenant_id(),
            envelope.correlation_id,
            envelope.payload.len()
        );
        Ok(())
    }
}

#[async_trait]
impl NotificationHandler for LoggingHandler {
    async fn on_notification(
        &self,
        notification: &ClusterNotification,
    ) -> Result<(), HandlerError> {
        log::debug!(
            "[{}][{}] Notification {}",
            notification.tenant_id,
            notification.entity_id,
            notification.event_id
        );
        Ok(())
    }
}

#[async_trait]
impl EdgeProcessor for LoggingHandler {
    async fn process(
        &self,
        tenant_id: TenantId,
        notification: &EdgeNotification,
    ) -> Result<(), HandlerError> {
        log::debug!(
            "[{}] Edge {} {}",
            tenant_id,
            notification.event_type,
            notification.action
        );
        Ok(())
    }
}

/// Handlers for every queue a node may consume
#[derive(Clone)]
pub struct NodeHandlers {
    pub core: Arc<dyn MessageHandler>,
    pub rule_engine: Arc<dyn MessageHandler>,
    pub transport: Arc<dyn MessageHandler>,
    pub edge: Arc<dyn EdgeProcessor>,
    /// Receives notifications routed to entities owned by this node
    pub local: Arc<dyn NotificationHandler>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

impl Default for NodeHandlers {
    fn default() -> Self {
        Self {
            core: Arc::new(LoggingHandler),
            rule_engine: Arc::new(LoggingHandler),
            transport: Arc::new(LoggingHandler),
            edge: Arc::new(LoggingHandler),
            local: Arc::new(LoggingHandler),
            dead_letters: Arc::new(LoggingDeadLetterSink),
        }
    }
}

impl NodeHandlers {
    pub fn with_core(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.core = handler;
        self
    }

    pub fn with_rule_engine(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.rule_engine = handler;
        self
    }

    pub fn with_transport(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.transport = handler;
        self
    }

    pub fn with_edge(mut self, processor: Arc<dyn EdgeProcessor>) -> Self {
        self.edge = processor;
        self
    }

    pub fn with_local(mut self, handler: Arc<dyn NotificationHandler>) -> Self {
        self.local = handler;
        self
    }

    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    /// Handler of the main-style queues of `service_type`
    pub fn for_service(&self, service_type: ServiceType) -> Arc<dyn MessageHandler> {
        match service_type {
            ServiceType::Core => self.core.clone(),
            ServiceType::RuleEngine => self.rule_engine.clone(),
            ServiceType::Transport => self.transport.clone(),
        }
    }
}
