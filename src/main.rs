//! VibeMQ cluster node
//!
//! Usage:
//!   vibemq-cluster [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: vibemq-cluster.toml)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use vibemq_cluster::broker::LocalBroker;
use vibemq_cluster::cluster::{Agent, ClusterHooks, GossipLauncher};
use vibemq_cluster::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn parse(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// VibeMQ cluster node
#[derive(Parser, Debug)]
#[command(name = "vibemq-cluster")]
#[command(author = "VibeMQ Contributors")]
#[command(version)]
#[command(about = "Gossip-clustered MQTT broker node")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, default_value = "vibemq-cluster.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => error!("Cannot install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot wait for Ctrl+C: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };

    // CLI overrides config
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::parse(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loaded configuration from {}", args.config.display());
    info!(
        "  Node: {} (gossip {}:{})",
        config.cluster.node_name, config.cluster.bind_addr, config.cluster.bind_port
    );
    if config.cluster.members.is_empty() {
        info!("  Members: none, starting a new cluster");
    } else {
        info!("  Members: {:?}", config.cluster.members);
    }

    let broker = Arc::new(LocalBroker::new(config.cluster.queue_depth));
    let agent = match Agent::bootstrap(config.cluster, broker.clone(), &GossipLauncher).await {
        Ok(agent) => agent,
        Err(e) => {
            error!("Cluster bootstrap failed: {}", e);
            std::process::exit(1);
        }
    };

    match ClusterHooks::init(Some(agent.clone())) {
        Ok(hooks) => broker.add_hook(hooks).await,
        Err(e) => {
            error!("Cluster hook setup failed: {}", e);
            std::process::exit(1);
        }
    }

    wait_for_signal().await;
    info!("Shutdown signal received");
    agent.shutdown().await;

    Ok(())
}
