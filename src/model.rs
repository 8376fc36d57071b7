//! Cluster Data Model
//!
//! Records persisted in the state store and the wire types exchanged
//! between nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::Error;

/// Implements `as_str`, `Display` and `FromStr` for a snake_case enum
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Store(format!(
                        "invalid {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Role of a server in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Standalone,
    Main,
    Secondary,
    Server3,
    Server4,
    Server5,
}

string_enum!(ServerRole {
    Standalone => "standalone",
    Main => "main",
    Secondary => "secondary",
    Server3 => "server3",
    Server4 => "server4",
    Server5 => "server5",
});

impl ServerRole {
    /// Roles a joining node may hold, in assignment order
    pub const MEMBER_ROLES: [ServerRole; 4] = [
        ServerRole::Secondary,
        ServerRole::Server3,
        ServerRole::Server4,
        ServerRole::Server5,
    ];

    /// Any non-primary cluster member role
    pub fn is_member(&self) -> bool {
        Self::MEMBER_ROLES.contains(self)
    }
}

/// Liveness of a cluster node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Error,
}

string_enum!(NodeStatus {
    Online => "online",
    Offline => "offline",
    Error => "error",
});

/// Replication health of the database or cache layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Online,
    Syncing,
    Error,
}

string_enum!(SyncStatus {
    Online => "online",
    Syncing => "syncing",
    Error => "error",
});

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

string_enum!(Severity {
    Info => "info",
    Warning => "warning",
    Critical => "critical",
});

/// Kind of cluster lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ClusterCreated,
    ClusterJoined,
    NodeJoined,
    NodeRejoined,
    NodeRemoved,
    NodeLeft,
    NodeOffline,
    ManualFailover,
    PromotionReceived,
    PromotionFailed,
    FailoverComplete,
    NewMainAcknowledged,
    ReplicationFailed,
}

string_enum!(EventType {
    ClusterCreated => "cluster_created",
    ClusterJoined => "cluster_joined",
    NodeJoined => "node_joined",
    NodeRejoined => "node_rejoined",
    NodeRemoved => "node_removed",
    NodeLeft => "node_left",
    NodeOffline => "node_offline",
    ManualFailover => "manual_failover",
    PromotionReceived => "promotion_received",
    PromotionFailed => "promotion_failed",
    FailoverComplete => "failover_complete",
    NewMainAcknowledged => "new_main_acknowledged",
    ReplicationFailed => "replication_failed",
});

/// Local cluster configuration (one row per node)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_id: String,
    pub cluster_secret: String,
    pub server_role: ServerRole,
    pub server_name: String,
    pub server_ip: String,
    pub main_server_ip: String,
    pub hardware_id: String,
    pub database_id: String,
    pub is_active: bool,
    pub db_replication_enabled: bool,
    pub db_replication_status: Option<SyncStatus>,
    pub redis_replication_enabled: bool,
    pub redis_replication_status: Option<SyncStatus>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl ClusterConfig {
    /// Whether this node currently belongs to a cluster
    pub fn in_cluster(&self) -> bool {
        self.server_role != ServerRole::Standalone && !self.cluster_id.is_empty()
    }

    /// The secret as shown to non-primary callers
    pub fn masked_secret(&self) -> String {
        let prefix: String = self.cluster_secret.chars().take(4).collect();
        format!("{}****", prefix)
    }
}

/// A known cluster member (including self)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: i64,
    pub cluster_id: String,
    pub hardware_id: String,
    pub server_name: String,
    pub server_ip: String,
    pub server_role: ServerRole,
    pub status: NodeStatus,
    pub db_sync_status: SyncStatus,
    pub redis_sync_status: SyncStatus,
    pub cpu_cores: u32,
    pub ram_mb: u64,
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub disk_usage: f64,
    pub db_replication_lag: f64,
    pub version: String,
    pub joined_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Fields needed to insert a node row
#[derive(Debug, Clone)]
pub struct NewClusterNode {
    pub cluster_id: String,
    pub hardware_id: String,
    pub server_name: String,
    pub server_ip: String,
    pub server_role: ServerRole,
    pub version: String,
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub id: i64,
    pub cluster_id: String,
    pub event_type: EventType,
    pub node_id: Option<i64>,
    pub node_ip: String,
    pub node_role: Option<ServerRole>,
    pub description: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

/// Builder-style input for appending an event
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub cluster_id: String,
    pub event_type: EventType,
    pub node_id: Option<i64>,
    pub node_ip: String,
    pub node_role: Option<ServerRole>,
    pub description: String,
    pub severity: Severity,
}

impl NewEvent {
    pub fn new(cluster_id: &str, event_type: EventType, description: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            event_type,
            node_id: None,
            node_ip: String::new(),
            node_role: None,
            description: description.into(),
            severity: Severity::Info,
        }
    }

    /// Attribute the event to a registry node
    pub fn node(mut self, node: &ClusterNode) -> Self {
        self.node_id = Some(node.id);
        self.node_ip = node.server_ip.clone();
        self.node_role = Some(node.server_role);
        self
    }

    /// Attribute the event to an address without a registry row
    pub fn ip(mut self, ip: &str, role: ServerRole) -> Self {
        self.node_ip = ip.to_string();
        self.node_role = Some(role);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Persisted marker for the multi-step promotion sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionPhase {
    Idle,
    Started,
    DatabasePromoted,
    MetadataUpdated,
    Completed,
    Failed,
}

string_enum!(PromotionPhase {
    Idle => "idle",
    Started => "started",
    DatabasePromoted => "database_promoted",
    MetadataUpdated => "metadata_updated",
    Completed => "completed",
    Failed => "failed",
});

impl PromotionPhase {
    /// Phases where the database is already primary but metadata may be stale
    pub fn is_resumable(&self) -> bool {
        matches!(self, PromotionPhase::DatabasePromoted | PromotionPhase::MetadataUpdated)
    }

    /// Phases that indicate an interrupted sequence
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            PromotionPhase::Started | PromotionPhase::DatabasePromoted | PromotionPhase::MetadataUpdated
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionState {
    pub phase: PromotionPhase,
    pub previous_main_ip: String,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for PromotionState {
    fn default() -> Self {
        Self {
            phase: PromotionPhase::Idle,
            previous_main_ip: String::new(),
            started_at: None,
            updated_at: None,
            error: None,
        }
    }
}

// ============ Wire Types ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub cluster_secret: String,
    pub hardware_id: String,
    pub server_name: String,
    pub server_ip: String,
    #[serde(default)]
    pub requested_role: Option<ServerRole>,
    #[serde(default)]
    pub database_id: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub success: bool,
    pub cluster_id: String,
    pub assigned_role: ServerRole,
    pub main_server_ip: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: String,
    pub replication_slot: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub cluster_secret: String,
    pub hardware_id: String,
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub ram_mb: u64,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub mem_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
    #[serde(default)]
    pub db_replication_lag: f64,
    #[serde(default)]
    pub redis_sync_status: Option<SyncStatus>,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub main_version: String,
    pub update_available: bool,
    /// The main's registry, mirrored by members
    #[serde(default)]
    pub members: Vec<ClusterNode>,
}

/// Remote promotion request pushed to a secondary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoteRequest {
    pub cluster_secret: String,
    #[serde(default)]
    pub current_main: String,
    pub cluster_id: String,
    #[serde(default)]
    pub event: String,
}

/// Events carried by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    NewMain,
    ConfigUpdate,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub event: NotifyEvent,
    #[serde(default)]
    pub new_main_ip: String,
    pub cluster_id: String,
    pub cluster_secret: String,
    pub timestamp: DateTime<Utc>,
}

/// Generic acknowledgement returned by peer endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl Ack {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Leave notification sent by a departing secondary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeLeftRequest {
    pub cluster_secret: String,
    pub hardware_id: String,
}
