//! clusterctl - Command line tool for managing ISP clusters
//!
//! Usage:
//!   clusterctl status                   - Show cluster status
//!   clusterctl nodes                    - List cluster nodes
//!   clusterctl setup-main               - Create a cluster on this node
//!   clusterctl setup-secondary <ip>     - Join the cluster of a main
//!   clusterctl failover <node-id>       - Hand the main role to a node

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;

use ispcluster::api::{ErrorResponse, HealthResponse, TestConnectionResponse};
use ispcluster::cluster::{
    ClusterStatus, PromotionReport, ReplicationStatus, SetupMainResponse, SetupSecondaryResponse,
};
use ispcluster::config::AppConfig;
use ispcluster::model::{Ack, ClusterNode, PromoteRequest, ServerRole};
use ispcluster::network::PeerClient;

type CtlResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// ISP Cluster Control Tool
#[derive(Parser)]
#[command(name = "clusterctl")]
#[command(about = "Control and monitor ISP clusters", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/ispcluster/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Operator token for a non-local endpoint (overrides config)
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cluster status of the local node
    Status,
    /// List cluster nodes and their health
    Nodes,
    /// Show local replication state and background task outcomes
    Replication,
    /// Create a new cluster with this node as main
    SetupMain {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        ip: Option<String>,
    },
    /// Join an existing cluster
    SetupSecondary {
        /// Address of the main
        main_ip: String,
        /// Cluster secret shown by `clusterctl status` on the main
        #[arg(long)]
        secret: String,
        /// Preferred role (secondary, server3, server4, server5)
        #[arg(long)]
        role: Option<ServerRole>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        ip: Option<String>,
    },
    /// Check that a candidate main is reachable
    TestConnection {
        main_ip: String,
    },
    /// Record a failover on the main and promote the target node
    Failover {
        /// Registry id of the node to promote
        node_id: i64,
    },
    /// Promote this node to main
    PromoteToMain,
    /// Remove a node from the cluster (main only)
    Remove {
        node_id: i64,
    },
    /// Leave the cluster and return to standalone
    Leave {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = AppConfig::from_file(&cli.config).ok();
    let endpoint = match &cli.endpoint {
        Some(e) => e.trim_end_matches('/').to_string(),
        None => local_endpoint(config.as_ref()),
    };
    let token = cli
        .token
        .clone()
        .or_else(|| config.as_ref().and_then(|c| c.api.operator_token.clone()));
    let peer_port = config.as_ref().map(|c| c.api.peer_port).unwrap_or(8090);
    let api = Api::new(endpoint, token);

    let result = match cli.command {
        Commands::Status => show_status(&api).await,
        Commands::Nodes => list_nodes(&api).await,
        Commands::Replication => show_replication(&api).await,
        Commands::SetupMain { name, ip } => setup_main(&api, name, ip).await,
        Commands::SetupSecondary { main_ip, secret, role, name, ip } => {
            setup_secondary(&api, main_ip, secret, role, name, ip).await
        }
        Commands::TestConnection { main_ip } => test_connection(&api, &main_ip).await,
        Commands::Failover { node_id } => failover(&api, node_id, peer_port).await,
        Commands::PromoteToMain => promote_to_main(&api).await,
        Commands::Remove { node_id } => remove_node(&api, node_id).await,
        Commands::Leave { force } => leave(&api, force).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Local API address derived from the node config
fn local_endpoint(config: Option<&AppConfig>) -> String {
    let Some(config) = config else {
        return "http://127.0.0.1:8090".to_string();
    };
    let addr = &config.api.bind_address;
    if addr.starts_with("0.0.0.0") {
        format!("http://127.0.0.1:{}", addr.rsplit(':').next().unwrap_or("8090"))
    } else {
        format!("http://{}", addr)
    }
}

// ============ HTTP helpers ============

/// Client for the local daemon API
struct Api {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl Api {
    fn new(endpoint: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.endpoint, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> CtlResult<T> {
        let response = self.request(reqwest::Method::GET, path).send().await?;
        decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> CtlResult<T> {
        let response = self.request(reqwest::Method::POST, path).json(body).send().await?;
        decode(response).await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> CtlResult<T> {
        let response = self.request(reqwest::Method::DELETE, path).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> CtlResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    match response.json::<ErrorResponse>().await {
        Ok(body) => Err(format!("{} ({})", body.message, status).into()),
        Err(_) => Err(format!("API error: {}", status).into()),
    }
}

fn colored_status(status: &str) -> String {
    // Pad before adding color codes
    let padded = format!("{:<10}", status);
    match status {
        "online" => format!("\x1b[32m{}\x1b[0m", padded),
        "syncing" => format!("\x1b[33m{}\x1b[0m", padded),
        "offline" | "error" => format!("\x1b[31m{}\x1b[0m", padded),
        _ => padded,
    }
}

fn colored_role(role: ServerRole) -> String {
    let padded = format!("{:<11}", role.as_str());
    match role {
        ServerRole::Main => format!("\x1b[1;34m{}\x1b[0m", padded),
        _ => padded,
    }
}

// ============ Commands ============

async fn show_status(api: &Api) -> CtlResult<()> {
    let status: ClusterStatus = api.get("/cluster/status").await?;

    println!();
    println!("ISP Cluster Status (clusterctl v{})", env!("CARGO_PKG_VERSION"));
    println!("=================================");
    println!();
    println!("Server:       {} ({})", status.server_name, status.server_ip);
    println!("Role:         {}", status.server_role);
    if status.server_role == ServerRole::Standalone {
        println!();
        println!("Not part of a cluster. Run `clusterctl setup-main` or `clusterctl setup-secondary`.");
        return Ok(());
    }
    println!("Cluster:      {}", status.cluster_id);
    println!("Main:         {}", status.main_server_ip);
    println!("Secret:       {}", status.cluster_secret);
    println!(
        "Nodes:        {} total | {} online | {} offline",
        status.total_nodes, status.online_nodes, status.offline_nodes
    );
    println!(
        "Replication:  database {} | cache {}",
        if status.db_replication_ok { "ok" } else { "DEGRADED" },
        if status.redis_replication_ok { "ok" } else { "DEGRADED" }
    );
    if status.promotion.phase.is_in_progress() {
        println!("Promotion:    interrupted in {}; run `clusterctl promote-to-main`", status.promotion.phase);
    }
    println!();

    if !status.events.is_empty() {
        println!("Recent events:");
        for event in status.events.iter().take(10) {
            println!(
                "  {} [{}] {}",
                event.created_at.format("%Y-%m-%d %H:%M:%S"),
                event.severity,
                event.description
            );
        }
        println!();
    }

    Ok(())
}

async fn list_nodes(api: &Api) -> CtlResult<()> {
    let status: ClusterStatus = api.get("/cluster/status").await?;
    let now = Utc::now();

    println!();
    println!(
        "{:<5} {:<18} {:<16} {:<11} {:<10} {:<10} {:<10} {:>8} {:>10}",
        "ID", "NAME", "ADDRESS", "ROLE", "STATUS", "DB", "CACHE", "LAG", "SEEN"
    );
    println!("{}", "-".repeat(104));

    for node in &status.nodes {
        print_node(node, now);
    }
    println!();

    Ok(())
}

fn print_node(node: &ClusterNode, now: chrono::DateTime<Utc>) {
    let seen = node
        .last_heartbeat
        .map(|t| format!("{}s ago", (now - t).num_seconds().max(0)))
        .unwrap_or_else(|| "never".into());

    println!(
        "{:<5} {:<18} {:<16} {} {} {} {} {:>7.1}s {:>10}",
        node.id,
        node.server_name,
        node.server_ip,
        colored_role(node.server_role),
        colored_status(node.status.as_str()),
        colored_status(node.db_sync_status.as_str()),
        colored_status(node.redis_sync_status.as_str()),
        node.db_replication_lag,
        seen
    );
}

async fn show_replication(api: &Api) -> CtlResult<()> {
    let status: ReplicationStatus = api.get("/cluster/replication-status").await?;

    println!();
    println!("Role:         {}", status.server_role);
    match (&status.database.error, status.database.in_recovery) {
        (Some(e), _) => println!("Database:     unavailable ({})", e),
        (None, Some(true)) => println!(
            "Database:     standby, lag {:.1}s",
            status.database.lag_seconds.unwrap_or_default()
        ),
        (None, _) => println!("Database:     primary"),
    }
    match (&status.redis.error, status.redis.status) {
        (Some(e), _) => println!("Cache:        unavailable ({})", e),
        (None, Some(s)) => println!("Cache:        {}", s),
        (None, None) => println!("Cache:        unknown"),
    }
    println!("Promotion:    {}", status.promotion.phase);
    if let Some(error) = &status.promotion.error {
        println!("              {}", error);
    }

    if !status.tasks.is_empty() {
        println!();
        println!("Background tasks:");
        for task in &status.tasks {
            println!(
                "  {:<22} {:<10} {}",
                task.kind.as_str(),
                task.status.as_str(),
                task.message
            );
        }
    }
    println!();

    Ok(())
}

async fn setup_main(api: &Api, name: Option<String>, ip: Option<String>) -> CtlResult<()> {
    let body = serde_json::json!({ "server_name": name, "server_ip": ip });
    let response: SetupMainResponse = api.post("/cluster/setup-main", &body).await?;

    println!("Cluster created");
    println!("  Cluster ID: {}", response.cluster_id);
    println!("  Main:       {}", response.server_ip);
    println!("  Secret:     {}", response.cluster_secret);
    println!();
    println!("Join other servers with:");
    println!("  clusterctl setup-secondary {} --secret {}", response.server_ip, response.cluster_secret);

    Ok(())
}

async fn setup_secondary(
    api: &Api,
    main_ip: String,
    secret: String,
    role: Option<ServerRole>,
    name: Option<String>,
    ip: Option<String>,
) -> CtlResult<()> {
    let body = serde_json::json!({
        "main_server_ip": main_ip,
        "cluster_secret": secret,
        "server_role": role,
        "server_name": name,
        "server_ip": ip,
    });
    let response: SetupSecondaryResponse = api.post("/cluster/setup-secondary", &body).await?;

    println!("Joined cluster {} as {}", response.cluster_id, response.assigned_role);
    println!("  Main: {}", response.main_server);
    println!("  {}", response.message);
    println!();
    println!("Follow progress with `clusterctl replication`.");

    Ok(())
}

async fn test_connection(api: &Api, main_ip: &str) -> CtlResult<()> {
    let body = serde_json::json!({ "main_server_ip": main_ip });
    let response: TestConnectionResponse = api.post("/cluster/test-connection", &body).await?;

    let mark = |ok: bool| if ok { "\x1b[32mreachable\x1b[0m" } else { "\x1b[31munreachable\x1b[0m" };
    println!("{}", response.message);
    println!("  API:      {}", mark(response.report.api_ok));
    println!("  Database: {}", mark(response.report.db_ok));
    println!("  Cache:    {}", mark(response.report.redis_ok));

    Ok(())
}

async fn failover(api: &Api, node_id: i64, peer_port: u16) -> CtlResult<()> {
    let status: ClusterStatus = api.get("/cluster/status").await?;
    if status.server_role != ServerRole::Main {
        return Err("failover must be started from the main".into());
    }
    let target = status
        .nodes
        .iter()
        .find(|n| n.id == node_id)
        .ok_or_else(|| format!("node {} is not in the cluster", node_id))?;

    let ack: Ack = api.post("/cluster/failover", &serde_json::json!({ "target_node_id": node_id })).await?;
    println!("{}", ack.message);

    let peers = PeerClient::new(peer_port, Duration::from_secs(10))?;
    let request = PromoteRequest {
        cluster_secret: status.cluster_secret.clone(),
        current_main: status.server_ip.clone(),
        cluster_id: status.cluster_id.clone(),
        event: "manual_failover".into(),
    };
    let ack = peers.promote(&target.server_ip, &request).await?;

    println!("{} ({}): {}", target.server_name, target.server_ip, ack.message);
    println!(
        "Follow progress with `clusterctl --endpoint http://{}:{} --token <operator token> replication`.",
        target.server_ip, peer_port
    );

    Ok(())
}

async fn promote_to_main(api: &Api) -> CtlResult<()> {
    let report: PromotionReport = api.post("/cluster/promote-to-main", &serde_json::json!({})).await?;

    println!("{}", report.message);
    println!("  Database: {}", if report.database { "primary" } else { "FAILED" });
    println!("  Cache:    {}", if report.redis { "detached" } else { "FAILED" });
    if report.resumed {
        println!("  Resumed an interrupted promotion");
    }

    Ok(())
}

async fn remove_node(api: &Api, node_id: i64) -> CtlResult<()> {
    let ack: Ack = api.delete(&format!("/cluster/nodes/{}", node_id)).await?;
    println!("{}", ack.message);
    Ok(())
}

async fn leave(api: &Api, force: bool) -> CtlResult<()> {
    if !force {
        println!("This node will leave its cluster and return to standalone.");
        print!("Continue? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted");
            return Ok(());
        }
    }

    let ack: Ack = api.post("/cluster/leave", &serde_json::json!({})).await?;
    println!("{}", ack.message);

    let health: HealthResponse = api.get("/health").await?;
    println!("Node is now {}", health.server_role);
    Ok(())
}
