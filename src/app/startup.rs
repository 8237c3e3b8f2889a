//! Process startup and shutdown

use super::cli::Args;
use clap::Parser;
use clusterq::core::config::ClusterConfig;
use clusterq::core::error_handling::log_error_with_context;
use clusterq::core::logging::init_logging;
use clusterq::core::shutdown::ShutdownCoordinator;
use clusterq::node::{ClusterNode, NodeHandlers};
use clusterq::partition::{InMemoryTenantRoutingInfoService, StaticDiscovery};
use clusterq::queue::create_factory;
use std::process::ExitCode;
use std::sync::Arc;

/// Run a node until SIGINT/SIGTERM
pub async fn run() -> ExitCode {
    let args = Args::parse();

    // Logging settings may come from the file, so load it before logging starts
    let loaded = ClusterConfig::load(args.config_file.as_deref()).await;
    let base_logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    if let Err(e) = init_logging(&args.logging(&base_logging), args.use_color()) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            log_error_with_context(&e, "Loading configuration");
            return ExitCode::FAILURE;
        }
    };
    args.apply_to(&mut config);
    if let Err(e) = config.validate() {
        log_error_with_context(&e, "Validating configuration");
        return ExitCode::FAILURE;
    }

    if args.check_config {
        return match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                println!("{}", rendered);
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!("FATAL: cannot render configuration: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    log::info!(
        "clusterq {} starting as '{}'",
        env!("CARGO_PKG_VERSION"),
        config.node.service_id
    );

    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handlers();

    let factory = match create_factory(&config.queue) {
        Ok(factory) => factory,
        Err(e) => {
            log_error_with_context(&e, "Creating queue backend");
            return ExitCode::FAILURE;
        }
    };

    let node = match ClusterNode::init(
        config.clone(),
        factory,
        Arc::new(InMemoryTenantRoutingInfoService::new()),
        NodeHandlers::default(),
        shutdown.clone(),
    )
    .await
    {
        Ok(node) => node,
        Err(e) => {
            log_error_with_context(&e, "Starting cluster node");
            return ExitCode::FAILURE;
        }
    };

    let discovery = node.spawn_discovery(Arc::new(StaticDiscovery::from_config(&config)));
    shutdown.wait().await;
    log::info!("Shutdown requested");

    let clean = node.destroy().await;
    if let Err(e) = discovery.await {
        log::warn!("Discovery loop ended abnormally: {}", e);
    }
    if !clean {
        log::warn!("Some consumers were aborted after the stop timeout");
    }
    ExitCode::SUCCESS
}
