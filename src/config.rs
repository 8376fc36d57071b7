//! Node Configuration
//!
//! Static configuration for a cluster node, loaded once from TOML and
//! overlaid with environment variables. The dynamic cluster state
//! (role, secret, peers) lives in the state store, not here.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Database connection configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Cache (Redis) connection configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Cluster timing configuration
    #[serde(default)]
    pub cluster: ClusterTimingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory for the cluster state database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Human readable server name (defaults to the hostname)
    #[serde(default)]
    pub server_name: Option<String>,

    /// Address other nodes use to reach this node (auto-detected if unset)
    #[serde(default)]
    pub advertise_ip: Option<String>,

    /// File holding the running software version
    #[serde(default = "default_version_file")]
    pub version_file: PathBuf,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Port peers use to reach each other's API
    #[serde(default = "default_api_port")]
    pub peer_port: u16,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,

    /// Bearer token for operator endpoints called from another host.
    /// Without one, operator endpoints only answer loopback callers.
    #[serde(default)]
    pub operator_token: Option<String>,
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    #[serde(default = "default_db_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_db_name")]
    pub name: String,

    /// Role used by standbys for streaming replication
    #[serde(default = "default_replication_user")]
    pub replication_user: String,

    #[serde(default)]
    pub replication_password: String,

    /// Command that (re)builds this node as a standby of a primary
    #[serde(default = "default_standby_command")]
    pub standby_command: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Cache connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_host")]
    pub host: String,

    #[serde(default = "default_cache_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    /// Path to the redis-cli binary
    #[serde(default = "default_cache_cli")]
    pub cli: String,
}

/// Cluster timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTimingConfig {
    /// Interval between heartbeats in seconds
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// A node is marked offline after this many seconds without a heartbeat
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Settling delay between the promote call and its verification
    #[serde(default = "default_promote_settle_secs")]
    pub promote_settle_secs: u64,

    /// Timeout for connectivity probes
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Timeout for outbound peer API calls
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/ispcluster")
}

fn default_version_file() -> PathBuf {
    PathBuf::from("/opt/ispcluster/VERSION")
}

fn default_api_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_api_port() -> u16 {
    8090
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_db_name() -> String {
    "isp".to_string()
}

fn default_replication_user() -> String {
    "replicator".to_string()
}

fn default_standby_command() -> String {
    "/opt/ispcluster/scripts/setup-standby.sh".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_cache_host() -> String {
    "localhost".to_string()
}

fn default_cache_port() -> u16 {
    6379
}

fn default_cache_cli() -> String {
    "redis-cli".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_stale_after_secs() -> u64 {
    60
}

fn default_promote_settle_secs() -> u64 {
    3
}

fn default_probe_timeout_secs() -> u64 {
    3
}

fn default_peer_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server_name: None,
            advertise_ip: None,
            version_file: default_version_file(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_address(),
            peer_port: default_api_port(),
            cors_enabled: false,
            operator_token: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            password: String::new(),
            name: default_db_name(),
            replication_user: default_replication_user(),
            replication_password: String::new(),
            standby_command: default_standby_command(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: default_cache_host(),
            port: default_cache_port(),
            password: None,
            cli: default_cache_cli(),
        }
    }
}

impl Default for ClusterTimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            promote_settle_secs: default_promote_settle_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            cluster: ClusterTimingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file and apply environment overrides
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay the process environment onto the connection settings
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DB_HOST") {
            self.database.host = v;
        }
        if let Some(port) = lookup("DB_PORT").and_then(|v| v.parse().ok()) {
            self.database.port = port;
        }
        if let Some(v) = lookup("DB_USER") {
            self.database.user = v;
        }
        if let Some(v) = lookup("DB_PASSWORD") {
            self.database.password = v;
        }
        if let Some(v) = lookup("DB_NAME") {
            self.database.name = v;
        }
        if let Some(v) = lookup("REDIS_HOST") {
            self.cache.host = v;
        }
        if let Some(port) = lookup("REDIS_PORT").and_then(|v| v.parse().ok()) {
            self.cache.port = port;
        }
        if let Some(v) = lookup("REDIS_PASSWORD") {
            self.cache.password = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = lookup("OPERATOR_TOKEN") {
            self.api.operator_token = if v.is_empty() { None } else { Some(v) };
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("node.data_dir cannot be empty".into()));
        }

        if self.cluster.heartbeat_interval_secs == 0 {
            return Err(crate::Error::Config(
                "cluster.heartbeat_interval_secs must be greater than 0".into(),
            ));
        }

        if self.cluster.stale_after_secs <= self.cluster.heartbeat_interval_secs {
            return Err(crate::Error::Config(
                "cluster.stale_after_secs must be greater than heartbeat_interval_secs".into(),
            ));
        }

        if self.cluster.probe_timeout_secs == 0 || self.cluster.peer_timeout_secs == 0 {
            return Err(crate::Error::Config("cluster timeouts must be greater than 0".into()));
        }

        Ok(())
    }

    /// Path of the embedded cluster state database
    pub fn state_db_path(&self) -> PathBuf {
        self.node.data_dir.join("cluster.db")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.cluster.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.cluster.stale_after_secs)
    }

    pub fn promote_settle_delay(&self) -> Duration {
        Duration::from_secs(self.cluster.promote_settle_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.probe_timeout_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.peer_timeout_secs)
    }

    /// Resolve the connection parameters handed to joining nodes
    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            db_host: self.database.host.clone(),
            db_port: self.database.port,
            db_user: self.database.replication_user.clone(),
            db_password: self.database.replication_password.clone(),
            db_name: self.database.name.clone(),
            redis_host: self.cache.host.clone(),
            redis_port: self.cache.port,
            redis_password: self.cache.password.clone().unwrap_or_default(),
        }
    }
}

/// Connection parameters resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: String,
}

/// Default configuration file written by `ispcluster init`
pub fn default_config_toml(server_name: &str) -> String {
    format!(
        r#"# ISP Cluster node configuration

[node]
data_dir = "/var/lib/ispcluster"
server_name = "{server_name}"
# advertise_ip = "203.0.113.10"
version_file = "/opt/ispcluster/VERSION"

[api]
bind_address = "0.0.0.0:8090"
peer_port = 8090
# Required to call operator endpoints (status, setup, failover, ...) from
# another host; local callers are always accepted
# operator_token = "changeme"

[database]
host = "localhost"
port = 5432
user = "postgres"
password = "changeme"
name = "isp"
replication_user = "replicator"
replication_password = "changeme"
standby_command = "/opt/ispcluster/scripts/setup-standby.sh"

[cache]
host = "localhost"
port = 6379
# password = "changeme"

[cluster]
heartbeat_interval_secs = 15
stale_after_secs = 60
promote_settle_secs = 3
probe_timeout_secs = 3
peer_timeout_secs = 10

[logging]
level = "info"
format = "pretty"
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
data_dir = "/tmp/ispcluster"
server_name = "core-1"

[database]
host = "db.internal"
password = "secret"

[cluster]
heartbeat_interval_secs = 5
stale_after_secs = 20
"#;

        let config = AppConfig::from_str(toml).unwrap();
        assert_eq!(config.node.server_name.as_deref(), Some("core-1"));
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.cache.port, 6379);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.state_db_path(), PathBuf::from("/tmp/ispcluster/cluster.db"));
    }

    #[test]
    fn test_default_template_parses() {
        let config = AppConfig::from_str(&default_config_toml("node-a")).unwrap();
        assert_eq!(config.node.server_name.as_deref(), Some("node-a"));
        assert_eq!(config.api.peer_port, 8090);
    }

    #[test]
    fn test_rejects_stale_window_below_heartbeat() {
        let toml = r#"
[cluster]
heartbeat_interval_secs = 30
stale_after_secs = 30
"#;
        assert!(AppConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DB_HOST", "10.0.0.5"),
            ("DB_PORT", "6432"),
            ("REDIS_PASSWORD", ""),
            ("REDIS_PORT", "not-a-port"),
            ("OPERATOR_TOKEN", "op-token"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.cache.password = Some("old".into());
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.database.host, "10.0.0.5");
        assert_eq!(config.database.port, 6432);
        assert_eq!(config.cache.port, 6379);
        assert!(config.cache.password.is_none());
        assert_eq!(config.api.operator_token.as_deref(), Some("op-token"));

        let params = config.connection_params();
        assert_eq!(params.db_host, "10.0.0.5");
        assert_eq!(params.db_user, "replicator");
        assert_eq!(params.redis_password, "");
    }
}
