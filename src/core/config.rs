//! Node configuration
//!
//! Loaded from a TOML file (default `<config_dir>/Clusterq/clusterq.toml`),
//! then overridden field by field from the command line. Every field has a
//! default so an empty file yields a working single-node setup on the
//! in-memory backend.

use crate::core::error_handling::ContextualError;
use crate::queue::{QueueType, ServiceType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read configuration file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    Parse { message: String },

    #[error("{message}")]
    Validation { message: String },
}

impl ContextualError for ConfigError {
    fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            ConfigError::Parse { .. } | ConfigError::Validation { .. }
        )
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            ConfigError::Parse { message } | ConfigError::Validation { message } => Some(message),
            ConfigError::Io { .. } => None,
        }
    }
}

/// Top-level configuration of one cluster node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub node: NodeSettings,
    pub queue: QueueSettings,
    pub partitions: PartitionSettings,
    pub discovery: DiscoverySettings,
    pub router: RouterSettings,
    pub logging: LoggingConfig,
}

/// Identity of the local service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeSettings {
    pub service_id: String,
    pub service_types: Vec<ServiceType>,
    /// Tenant profiles this node is dedicated to (isolated rule-engine nodes)
    pub assigned_tenant_profiles: Vec<Uuid>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            service_id: std::env::var("HOSTNAME").unwrap_or_else(|_| "clusterq-node".to_string()),
            service_types: vec![ServiceType::Core, ServiceType::RuleEngine],
            assigned_tenant_profiles: Vec::new(),
        }
    }
}

/// Broker selection and consumer tuning shared by all queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    #[serde(rename = "type")]
    pub queue_type: QueueType,
    /// Prepended to every topic name
    pub topic_prefix: String,
    /// Base name of per-node notification topics (`<name>.<service_id>`)
    pub notifications_topic: String,
    pub poll_interval_ms: u64,
    pub pack_processing_timeout_ms: u64,
    pub pack_processing_retries: u32,
    pub max_poll_messages: usize,
    pub consumer_pool_size: usize,
    pub consumer_per_partition: bool,
    /// Hard deadline for consumer tasks to stop before they are aborted
    pub stop_timeout_ms: u64,
    /// Rule-engine queues; `Main` is used when the list is empty
    pub queues: Vec<QueueDefinition>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            queue_type: QueueType::InMemory,
            topic_prefix: String::new(),
            notifications_topic: "notifications".to_string(),
            poll_interval_ms: 25,
            pack_processing_timeout_ms: 2000,
            pack_processing_retries: 3,
            max_poll_messages: 100,
            consumer_pool_size: 8,
            consumer_per_partition: true,
            stop_timeout_ms: 5000,
            queues: Vec::new(),
        }
    }
}

impl QueueSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pack_processing_timeout(&self) -> Duration {
        Duration::from_millis(self.pack_processing_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Configured rule-engine queues, falling back to the main queue
    pub fn effective_queues(&self) -> Vec<QueueDefinition> {
        if self.queues.is_empty() {
            vec![QueueDefinition::default()]
        } else {
            self.queues.clone()
        }
    }
}

/// One `[[queue.queues]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueDefinition {
    pub name: String,
    pub topic: String,
    pub partitions: u32,
    /// Set for a tenant's isolated queue
    pub tenant_id: Option<Uuid>,
    pub poll_interval_ms: Option<u64>,
    pub pack_processing_timeout_ms: Option<u64>,
    pub pack_processing_retries: Option<u32>,
    pub consumer_per_partition: Option<bool>,
}

impl Default for QueueDefinition {
    fn default() -> Self {
        Self {
            name: crate::queue::MAIN_QUEUE_NAME.to_string(),
            topic: "tb_rule_engine.main".to_string(),
            partitions: 10,
            tenant_id: None,
            poll_interval_ms: None,
            pack_processing_timeout_ms: None,
            pack_processing_retries: None,
            consumer_per_partition: None,
        }
    }
}

/// Fixed topics of the core and edge services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartitionSettings {
    pub core_topic: String,
    pub core_partitions: u32,
    pub edge_topic: String,
    pub edge_partitions: u32,
    pub transport_topic: String,
    pub transport_partitions: u32,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            core_topic: "tb_core".to_string(),
            core_partitions: 10,
            edge_topic: "tb_edge".to_string(),
            edge_partitions: 10,
            transport_topic: "tb_transport".to_string(),
            transport_partitions: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverySettings {
    pub tick_interval_ms: u64,
    /// Other services known up front (static discovery)
    pub peers: Vec<PeerSettings>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            peers: Vec::new(),
        }
    }
}

impl DiscoverySettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerSettings {
    pub service_id: String,
    pub service_types: Vec<ServiceType>,
    #[serde(default)]
    pub assigned_tenant_profiles: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterSettings {
    pub retry_limit: u32,
    pub retry_delay_ms: u64,
    /// Count edge pushes and log the totals every `edge_stats_interval_ms`
    pub edge_stats_enabled: bool,
    pub edge_stats_interval_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_delay_ms: 100,
            edge_stats_enabled: false,
            edge_stats_interval_ms: 60_000,
        }
    }
}

impl RouterSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn edge_stats_interval(&self) -> Duration {
        Duration::from_millis(self.edge_stats_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

impl ClusterConfig {
    /// `<config_dir>/Clusterq/clusterq.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("Clusterq").join("clusterq.toml"))
    }

    /// Load and validate configuration
    ///
    /// An explicit path must exist. Without one the default location is
    /// tried and built-in defaults are used when it is absent.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (Some(p.to_path_buf()), true),
            None => (Self::default_path(), false),
        };

        let config = match path {
            Some(path) => match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    log::debug!("Loading configuration from {}", path.display());
                    Self::from_toml_str(&content).map_err(|e| match e {
                        ConfigError::Parse { message } => ConfigError::Parse {
                            message: format!("{}: {}", path.display(), message),
                        },
                        other => other,
                    })?
                }
                Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                    log::debug!(
                        "No configuration at {}, using defaults",
                        path.display()
                    );
                    Self::default()
                }
                Err(source) => return Err(ConfigError::Io { path, source }),
            },
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            message: format!("Invalid configuration: {}", e),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Validation { message });

        if self.node.service_id.trim().is_empty() {
            return invalid("node.service_id must not be empty".to_string());
        }
        if self.node.service_types.is_empty() {
            return invalid("node.service_types must name at least one service type".to_string());
        }
        if self.queue.consumer_pool_size == 0 {
            return invalid("queue.consumer_pool_size must be > 0".to_string());
        }
        if self.queue.max_poll_messages == 0 {
            return invalid("queue.max_poll_messages must be > 0".to_string());
        }
        for (name, count) in [
            ("partitions.core_partitions", self.partitions.core_partitions),
            ("partitions.edge_partitions", self.partitions.edge_partitions),
            (
                "partitions.transport_partitions",
                self.partitions.transport_partitions,
            ),
        ] {
            if count == 0 {
                return invalid(format!("{} must be > 0", name));
            }
        }

        if self.router.edge_stats_enabled && self.router.edge_stats_interval_ms == 0 {
            return invalid("router.edge_stats_interval_ms must be > 0".to_string());
        }

        let mut seen = std::collections::BTreeSet::new();
        for queue in &self.queue.queues {
            if queue.name.trim().is_empty() {
                return invalid("queue.queues entries need a name".to_string());
            }
            if queue.partitions == 0 {
                return invalid(format!("queue '{}': partitions must be > 0", queue.name));
            }
            if !seen.insert((queue.name.as_str(), queue.tenant_id)) {
                return invalid(format!("queue '{}' is defined twice", queue.name));
            }
        }

        for peer in &self.discovery.peers {
            if peer.service_id == self.node.service_id {
                return invalid(format!(
                    "discovery.peers contains the local service id '{}'",
                    peer.service_id
                ));
            }
        }

        Ok(())
    }
}
