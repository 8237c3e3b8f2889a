//! Command-line arguments and their overrides of the configuration file

use clap::Parser;
use clusterq::core::config::{ClusterConfig, LoggingConfig};
use clusterq::queue::{QueueType, ServiceType};
use std::io::IsTerminal;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "clusterq")]
#[command(about = "Cluster coordination node")]
#[command(version)]
#[command(after_help = " * can be specified multiple times or as a comma-separated list")]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config-file", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Unique id of this node in the cluster
    #[arg(short = 'i', long = "service-id", value_name = "ID")]
    pub service_id: Option<String>,

    /// Service types run by this node*
    #[arg(
        short = 't',
        long = "service-type",
        value_name = "TYPES",
        value_delimiter = ','
    )]
    pub service_types: Vec<ServiceType>,

    /// Queue backend
    #[arg(short = 'q', long = "queue-type", value_name = "TYPE")]
    pub queue_type: Option<QueueType>,

    /// Disable coloured log output
    #[arg(long = "no-color")]
    pub no_color: bool,

    /// Log level
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", value_parser = ["trace", "debug", "info", "warn", "error", "off"])]
    pub log_level: Option<String>,

    /// Log file path (use 'none' to disable file logging)
    #[arg(short = 'f', long = "log-file", value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(short = 'o', long = "log-format", value_name = "FORMAT", value_parser = ["text", "ext", "json"])]
    pub log_format: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long = "check-config")]
    pub check_config: bool,
}

impl Args {
    /// Logging settings with command-line values taking precedence
    pub fn logging(&self, base: &LoggingConfig) -> LoggingConfig {
        let mut logging = base.clone();
        if let Some(level) = &self.log_level {
            logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            logging.format = format.clone();
        }
        if let Some(file) = &self.log_file {
            logging.file = if file.as_os_str() == "none" {
                None
            } else {
                Some(file.to_string_lossy().to_string())
            };
        }
        logging
    }

    /// Override file configuration with whatever was given on the command line
    pub fn apply_to(&self, config: &mut ClusterConfig) {
        if let Some(service_id) = &self.service_id {
            config.node.service_id = service_id.clone();
        }
        if !self.service_types.is_empty() {
            config.node.service_types = self.service_types.clone();
        }
        if let Some(queue_type) = self.queue_type {
            config.queue.queue_type = queue_type;
        }
        config.logging = self.logging(&config.logging);
    }

    pub fn use_color(&self) -> bool {
        !self.no_color && std::io::stderr().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let args = Args::try_parse_from([
            "clusterq",
            "--service-id",
            "node-7",
            "-t",
            "core,TB_RULE_ENGINE",
            "--queue-type",
            "in-memory",
            "-l",
            "debug",
        ])
        .unwrap();

        let mut config = ClusterConfig::default();
        args.apply_to(&mut config);
        assert_eq!(config.node.service_id, "node-7");
        assert_eq!(
            config.node.service_types,
            vec![ServiceType::Core, ServiceType::RuleEngine]
        );
        assert_eq!(config.queue.queue_type, QueueType::InMemory);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_no_arguments_leave_config_untouched() {
        let args = Args::try_parse_from(["clusterq"]).unwrap();
        let mut config = ClusterConfig::default();
        config.node.service_id = "from-file".to_string();
        args.apply_to(&mut config);
        assert_eq!(config.node.service_id, "from-file");
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_log_file_none_disables_file_logging() {
        let args = Args::try_parse_from(["clusterq", "--log-file", "none"]).unwrap();
        let base = LoggingConfig {
            file: Some("/var/log/clusterq.log".to_string()),
            ..LoggingConfig::default()
        };
        assert_eq!(args.logging(&base).file, None);
    }

    #[test]
    fn test_rejects_unknown_log_format() {
        assert!(Args::try_parse_from(["clusterq", "-o", "xml"]).is_err());
        assert!(Args::try_parse_from(["clusterq", "-t", "web"]).is_err());
    }
}
