//! ISP Cluster node daemon
//!
//! Runs the cluster API, the heartbeat loop and background tasks for one
//! server of the cluster.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ispcluster::api::HttpServer;
use ispcluster::cluster::ClusterService;
use ispcluster::config::{default_config_toml, AppConfig, LoggingConfig};
use ispcluster::engine::Engines;
use ispcluster::error::Result;
use ispcluster::identity::NodeIdentity;
use ispcluster::state::ClusterStore;

/// ISP Cluster - HA control plane for ISP core servers
#[derive(Parser)]
#[command(name = "ispcluster")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ispcluster/config.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the cluster node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "ispcluster.toml")]
        output: PathBuf,

        /// Server name (defaults to the hostname)
        #[arg(long)]
        server_name: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Show this node's identity
    Identity,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = AppConfig::from_file(&cli.config)?;
            init_logging(&config.logging, cli.log_level.as_deref());
            run_start(config).await
        }
        Commands::Init { output, server_name } => run_init(output, server_name),
        Commands::Validate => run_validate(cli.config),
        Commands::Identity => run_identity(cli.config),
    }
}

fn init_logging(logging: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(&logging.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the node
async fn run_start(config: AppConfig) -> Result<()> {
    tracing::info!("Starting ISP cluster node...");

    if let Err(e) = std::fs::create_dir_all(&config.node.data_dir) {
        tracing::error!("Failed to create data directory {:?}: {}", config.node.data_dir, e);
        return Err(e.into());
    }

    let identity = NodeIdentity::resolve(&config)?;
    tracing::info!(
        "Node {} ({}) hardware id {}",
        identity.server_name,
        identity.server_ip,
        identity.hardware_id
    );

    let store = Arc::new(ClusterStore::open(&config.state_db_path())?);
    let engines = Engines::from_config(&config);
    let service = ClusterService::new(&config, identity, store, engines)?;

    match service.config().get().await? {
        Some(cluster) if cluster.in_cluster() => tracing::info!(
            "Member of cluster {} as {}, main is {}",
            cluster.cluster_id,
            cluster.server_role,
            cluster.main_server_ip
        ),
        _ => tracing::info!("Running standalone"),
    }
    service.check_interrupted_promotion().await?;

    let heartbeat = service.spawn_heartbeat_loop();
    let http_server = HttpServer::new(config.api.clone(), Arc::clone(&service));

    tokio::select! {
        result = http_server.start() => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    heartbeat.abort();
    tracing::info!("ISP cluster node stopped");
    Ok(())
}

/// Write a default configuration file
fn run_init(output: PathBuf, server_name: Option<String>) -> Result<()> {
    let server_name = server_name.unwrap_or_else(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "core-1".into())
    });

    if output.exists() {
        eprintln!("Refusing to overwrite existing {}", output.display());
        return Err(ispcluster::Error::Config(format!("{} already exists", output.display())));
    }

    std::fs::write(&output, default_config_toml(&server_name))?;
    println!("Configuration written to: {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit {} with your database and cache settings", output.display());
    println!("  2. Start the node: ispcluster --config {} start", output.display());
    println!("  3. Create a cluster: clusterctl setup-main");

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match AppConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  API: {} (peer port {})", config.api.bind_address, config.api.peer_port);
            println!(
                "  Database: {}@{}:{}/{}",
                config.database.user, config.database.host, config.database.port, config.database.name
            );
            println!("  Cache: {}:{}", config.cache.host, config.cache.port);
            println!(
                "  Heartbeat: every {}s, stale after {}s",
                config.cluster.heartbeat_interval_secs, config.cluster.stale_after_secs
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node identity
fn run_identity(config_path: PathBuf) -> Result<()> {
    let config = AppConfig::from_file(&config_path)?;
    let identity = NodeIdentity::resolve(&config)?;

    println!("ISP Cluster Node Identity");
    println!("=========================");
    println!();
    println!("Server Name:  {}", identity.server_name);
    println!("Server IP:    {}", identity.server_ip);
    println!("Hardware ID:  {}", identity.hardware_id);
    let version = identity.version();
    println!("Version:      {}", if version.is_empty() { "(unknown)" } else { version.as_str() });
    println!("State DB:     {}", config.state_db_path().display());

    Ok(())
}
