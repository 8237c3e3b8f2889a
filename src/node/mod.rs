//! Cluster Node
//!
//! Explicit owner of everything one process runs: the partition service, the
//! queue factory, one group of consumer managers per service type, the
//! cross-node router and the node's notification consumer.
//!
//! # Lifecycle
//!
//! 1. [`ClusterNode::init`] creates topics, builds consumer managers and
//!    subscribes them to partition changes, then starts the notification
//!    consumer. Core nodes also start pruning remote subscriptions on
//!    membership changes. Nothing is owned yet.
//! 2. [`ClusterNode::spawn_discovery`] feeds topology snapshots into the
//!    partition service; the first snapshot assigns partitions and the
//!    managers start their tasks.
//! 3. [`ClusterNode::destroy`] stops listeners, consumers and managers within
//!    the configured stop timeout.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use clusterq::core::config::ClusterConfig;
//! use clusterq::core::shutdown::ShutdownCoordinator;
//! use clusterq::node::{ClusterNode, NodeHandlers};
//! use clusterq::partition::{InMemoryTenantRoutingInfoService, StaticDiscovery};
//! use clusterq::queue::create_factory;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClusterConfig::default();
//! let shutdown = ShutdownCoordinator::new();
//! let node = ClusterNode::init(
//!     config.clone(),
//!     create_factory(&config.queue)?,
//!     Arc::new(InMemoryTenantRoutingInfoService::new()),
//!     NodeHandlers::default(),
//!     shutdown.clone(),
//! )
//! .await?;
//! let discovery = node.spawn_discovery(Arc::new(StaticDiscovery::from_config(&config)));
//!
//! shutdown.wait().await;
//! node.destroy().await;
//! let _ = discovery.await;
//! # Ok(())
//! # }
//! ```

mod error;
mod handlers;

pub use error::{NodeError, NodeResult};
pub use handlers::{LoggingHandler, NodeHandlers};

use crate::consumer::{
    launch_partition_listener, ConsumerConfig, ConsumerManager, ConsumerManagers,
    MessageHandler, NotificationConsumer,
};
use crate::core::config::{ClusterConfig, QueueSettings};
use crate::core::shutdown::ShutdownCoordinator;
use crate::notifications::api::{
    publish_logged, AsyncNotificationManager, Event, SharedNotificationManager, SystemEvent,
    SystemEventType,
};
use crate::partition::{
    run_discovery_loop, DiscoveryService, PartitionService, QueueUpdate,
    TenantRoutingInfoService, EDGE_QUEUE_NAME,
};
use crate::queue::{QueueFactory, QueueKey, ServiceType, TopicProperties};
use crate::router::{
    launch_subscription_cleanup, run_edge_stats_reporter, CrossNodeRouter, EdgeNotificationPusher,
    EdgeStats, RetryingDelivery, SubscriptionRegistry,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct ClusterNode {
    config: ClusterConfig,
    factory: Arc<dyn QueueFactory>,
    notifications: SharedNotificationManager,
    partitions: Arc<PartitionService>,
    router: Arc<CrossNodeRouter>,
    managers: BTreeMap<ServiceType, Arc<ConsumerManagers>>,
    notification_consumer: NotificationConsumer,
    edge_stats: Option<Arc<EdgeStats>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    shutdown: ShutdownCoordinator,
    destroyed: AtomicBool,
}

impl ClusterNode {
    pub async fn init(
        config: ClusterConfig,
        factory: Arc<dyn QueueFactory>,
        routing: Arc<dyn TenantRoutingInfoService>,
        handlers: NodeHandlers,
        shutdown: ShutdownCoordinator,
    ) -> NodeResult<Self> {
        config.validate()?;
        let service_id = config.node.service_id.clone();
        let service_types: BTreeSet<ServiceType> =
            config.node.service_types.iter().copied().collect();
        log::info!(
            "Initializing node '{}' {:?} on {} queues (build {} {})",
            service_id,
            service_types,
            factory.queue_type(),
            crate::core::version::git_hash(),
            crate::core::version::build_time()
        );

        let notifications = AsyncNotificationManager::new_shared();
        let partitions = Arc::new(PartitionService::new(
            &config,
            routing,
            notifications.clone(),
        )?);
        create_topics(factory.as_ref(), &partitions, &service_types, &service_id).await?;

        let delivery = RetryingDelivery::from_settings(&config.router);
        let mut router = CrossNodeRouter::new(
            partitions.clone(),
            factory.create_notifications_producer(),
            handlers.local.clone(),
            delivery.clone(),
        );
        // only core nodes own entities, so only they hold subscriptions
        let subscriptions = service_types
            .contains(&ServiceType::Core)
            .then(|| Arc::new(SubscriptionRegistry::new(partitions.clone())));
        if let Some(registry) = &subscriptions {
            router = router.with_subscriptions(registry.clone());
        }
        let router = Arc::new(router);

        let edge_stats = config
            .router
            .edge_stats_enabled
            .then(|| Arc::new(EdgeStats::default()));
        let builder = Arc::new(ManagerFactory {
            settings: config.queue.clone(),
            factory: factory.clone(),
            partitions: partitions.clone(),
            handlers,
            delivery,
            notifications: notifications.clone(),
            edge_stats: edge_stats.clone(),
        });

        let mut managers = BTreeMap::new();
        let mut listeners = Vec::new();
        if let Some(registry) = subscriptions {
            listeners.push(
                launch_subscription_cleanup(registry, notifications.clone(), shutdown.clone()).await,
            );
        }
        if let Some(stats) = &edge_stats {
            listeners.push(tokio::spawn(run_edge_stats_reporter(
                stats.clone(),
                config.router.edge_stats_interval(),
                shutdown.clone(),
            )));
        }
        for service_type in service_types {
            let build = builder.clone();
            let group = ConsumerManagers::new(service_type)
                .with_builder(Box::new(move |queue_key: &QueueKey| build.build(queue_key)));
            for queue_key in partitions.queue_keys(service_type) {
                if let Some(manager) = builder.build(&queue_key) {
                    group.insert(manager);
                }
            }
            let group = Arc::new(group);
            listeners.push(
                launch_partition_listener(group.clone(), notifications.clone(), shutdown.clone())
                    .await,
            );
            managers.insert(service_type, group);
        }

        let notification_consumer = NotificationConsumer::new(
            service_id.clone(),
            factory.clone(),
            &ConsumerConfig::from_settings(&config.queue),
            router.clone(),
            notifications.clone(),
        );
        notification_consumer.start().await?;

        publish_logged(
            &notifications,
            Event::System(SystemEvent::with_message(
                SystemEventType::Startup,
                format!("node '{}' initialized", service_id),
            )),
        )
        .await;

        Ok(Self {
            config,
            factory,
            notifications,
            partitions,
            router,
            managers,
            notification_consumer,
            edge_stats,
            listeners: Mutex::new(listeners),
            shutdown,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn service_id(&self) -> &str {
        &self.config.node.service_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn factory(&self) -> &Arc<dyn QueueFactory> {
        &self.factory
    }

    pub fn notifications(&self) -> &SharedNotificationManager {
        &self.notifications
    }

    pub fn partitions(&self) -> &Arc<PartitionService> {
        &self.partitions
    }

    pub fn router(&self) -> &Arc<CrossNodeRouter> {
        &self.router
    }

    /// Consumer managers of one service type, if this node runs it
    pub fn managers(&self, service_type: ServiceType) -> Option<Arc<ConsumerManagers>> {
        self.managers.get(&service_type).cloned()
    }

    pub fn notification_consumer(&self) -> &NotificationConsumer {
        &self.notification_consumer
    }

    /// Edge push counters, when enabled in the router settings
    pub fn edge_stats(&self) -> Option<&Arc<EdgeStats>> {
        self.edge_stats.as_ref()
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Run the discovery loop until shutdown
    pub fn spawn_discovery(&self, discovery: Arc<dyn DiscoveryService>) -> JoinHandle<()> {
        tokio::spawn(run_discovery_loop(
            discovery,
            self.partitions.clone(),
            self.config.discovery.tick_interval(),
            self.shutdown.clone(),
        ))
    }

    /// Stop every consumer of the node
    ///
    /// Returns `false` when some task had to be aborted after the stop
    /// timeout. Calling it again is a no-op.
    pub async fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return true;
        }
        log::info!("Stopping node '{}'", self.service_id());
        self.shutdown.trigger_shutdown();

        let listeners = std::mem::take(&mut *self.listeners.lock().await);
        for listener in listeners {
            if let Err(e) = listener.await {
                log::warn!("Background listener ended abnormally: {}", e);
            }
        }

        let timeout = self.config.queue.stop_timeout();
        let mut clean = self.notification_consumer.stop(timeout).await;
        for group in self.managers.values() {
            clean &= group.stop_all(timeout).await;
        }
        self.factory.create_admin().destroy().await;

        let event_type = if clean {
            SystemEventType::Shutdown
        } else {
            SystemEventType::ShutdownTimeout
        };
        publish_logged(&self.notifications, Event::System(SystemEvent::new(event_type))).await;
        log::info!("Node '{}' stopped", self.service_id());
        clean
    }
}

/// Builds the consumer manager of a queue key, including isolated queues
/// that appear after startup
struct ManagerFactory {
    settings: QueueSettings,
    factory: Arc<dyn QueueFactory>,
    partitions: Arc<PartitionService>,
    handlers: NodeHandlers,
    delivery: RetryingDelivery,
    notifications: SharedNotificationManager,
    edge_stats: Option<Arc<EdgeStats>>,
}

impl ManagerFactory {
    fn build(&self, queue_key: &QueueKey) -> Option<Arc<ConsumerManager>> {
        let info = self.partitions.queue_routing_info(queue_key)?;
        let manager = ConsumerManager::new(
            queue_key.clone(),
            info.topic,
            self.factory.clone(),
            self.consumer_config(queue_key),
            self.handler(queue_key),
            self.notifications.clone(),
        )
        .with_dead_letter_sink(self.handlers.dead_letters.clone());
        Some(Arc::new(manager))
    }

    fn handler(&self, queue_key: &QueueKey) -> Arc<dyn MessageHandler> {
        if queue_key.service_type == ServiceType::Core && queue_key.queue_name == EDGE_QUEUE_NAME {
            let pusher = EdgeNotificationPusher::new(self.handlers.edge.clone(), self.delivery.clone());
            match &self.edge_stats {
                Some(stats) => Arc::new(pusher.with_stats(stats.clone())),
                None => Arc::new(pusher),
            }
        } else {
            self.handlers.for_service(queue_key.service_type)
        }
    }

    // Isolated queues inherit the tuning of the shared queue with the same name
    fn consumer_config(&self, queue_key: &QueueKey) -> ConsumerConfig {
        if queue_key.service_type != ServiceType::RuleEngine {
            return ConsumerConfig::from_settings(&self.settings);
        }
        let queues = self.settings.effective_queues();
        queues
            .iter()
            .find(|q| QueueUpdate::from(*q).queue_key() == *queue_key)
            .or_else(|| {
                queues
                    .iter()
                    .find(|q| q.tenant_id.is_none() && q.name == queue_key.queue_name)
            })
            .map(|q| ConsumerConfig::for_queue(&self.settings, q))
            .unwrap_or_else(|| ConsumerConfig::from_settings(&self.settings))
    }
}

async fn create_topics(
    factory: &dyn QueueFactory,
    partitions: &PartitionService,
    service_types: &BTreeSet<ServiceType>,
    service_id: &str,
) -> NodeResult<()> {
    let admin = factory.create_admin();
    for service_type in service_types {
        for queue_key in partitions.queue_keys(*service_type) {
            if let Some(info) = partitions.queue_routing_info(&queue_key) {
                let properties =
                    TopicProperties::from([("partitions".to_string(), info.partitions.to_string())]);
                admin
                    .create_topic_if_not_exists(&info.topic, &properties)
                    .await?;
            }
        }
    }
    let own = partitions.topics().notifications_topic(service_id);
    admin
        .create_topic_if_not_exists(&own.full_topic_name(), &TopicProperties::new())
        .await?;
    Ok(())
}
