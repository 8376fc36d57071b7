//! Cluster Control Plane
//!
//! `ClusterService` owns every cluster operation a node can perform:
//! setup, the join handshake, heartbeats, promotion, notifications and
//! leaving. HTTP handlers are thin wrappers around these methods.

mod failover;
mod heartbeat;
mod join;
mod lifecycle;
mod notify;
mod setup;

pub use failover::PromotionReport;
pub use heartbeat::{classify_lag, update_available};
pub use join::replication_slot_name;
pub use setup::{SetupMainRequest, SetupMainResponse, SetupSecondaryRequest, SetupSecondaryResponse};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{AppConfig, ConnectionParams};
use crate::engine::{DatabaseEngine, CacheEngine, Engines};
use crate::error::{Error, Result};
use crate::identity::NodeIdentity;
use crate::model::{
    ClusterConfig, ClusterEvent, ClusterNode, PromotionState, ServerRole, SyncStatus,
};
use crate::network::{test_connection, ConnectionReport, PeerClient, ProbePorts};
use crate::state::{ClusterStore, ClusterSummary, ConfigService};
use crate::tasks::{TaskRecord, TaskSupervisor};

/// Events returned with the status view
const STATUS_EVENT_LIMIT: usize = 50;

/// Timing knobs resolved from the node configuration
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub promote_settle: Duration,
    pub probe_timeout: Duration,
}

impl Timing {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            stale_after: config.stale_after(),
            promote_settle: config.promote_settle_delay(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

/// Cluster operations of the local node
pub struct ClusterService {
    config: ConfigService,
    store: Arc<ClusterStore>,
    identity: NodeIdentity,
    params: ConnectionParams,
    timing: Timing,
    database: Arc<dyn DatabaseEngine>,
    cache: Arc<dyn CacheEngine>,
    peers: PeerClient,
    tasks: TaskSupervisor,
    /// Serializes role changes: joins, promotion, new-main handling and
    /// roster mirroring
    roles_lock: Mutex<()>,
}

impl ClusterService {
    /// Build the service; must be called inside a tokio runtime
    pub fn new(
        app: &AppConfig,
        identity: NodeIdentity,
        store: Arc<ClusterStore>,
        engines: Engines,
    ) -> Result<Arc<Self>> {
        let peers = PeerClient::new(app.api.peer_port, app.peer_timeout())?;
        let tasks = TaskSupervisor::start(Arc::clone(&store));

        Ok(Arc::new(Self {
            config: ConfigService::new(Arc::clone(&store)),
            store,
            identity,
            params: app.connection_params(),
            timing: Timing::from_config(app),
            database: engines.database,
            cache: engines.cache,
            peers,
            tasks,
            roles_lock: Mutex::new(()),
        }))
    }

    pub fn config(&self) -> &ConfigService {
        &self.config
    }

    pub fn store(&self) -> &Arc<ClusterStore> {
        &self.store
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn tasks(&self) -> &TaskSupervisor {
        &self.tasks
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Reject a request whose secret does not match the local config
    fn check_secret(&self, config: &ClusterConfig, presented: &str) -> Result<()> {
        if config.cluster_secret.is_empty() || presented != config.cluster_secret {
            tracing::warn!("Rejected request with invalid cluster secret");
            return Err(Error::Unauthorized);
        }
        Ok(())
    }

    /// Local view of the cluster
    pub async fn status(&self) -> Result<ClusterStatus> {
        let promotion = self.store.promotion_state().await?;
        let config = match self.config.get().await? {
            Some(config) if config.in_cluster() => config,
            other => return Ok(ClusterStatus::standalone(other.as_ref(), &self.identity, promotion)),
        };

        let nodes = self.store.list_nodes(&config.cluster_id).await?;
        let summary = ClusterSummary::from_nodes(&nodes);
        let events = self
            .store
            .recent_events(&config.cluster_id, STATUS_EVENT_LIMIT)
            .await?;

        let cluster_secret = if config.server_role == ServerRole::Main {
            config.cluster_secret.clone()
        } else {
            config.masked_secret()
        };

        Ok(ClusterStatus {
            success: true,
            cluster_id: config.cluster_id.clone(),
            is_active: config.is_active,
            server_role: config.server_role,
            server_name: config.server_name.clone(),
            server_ip: config.server_ip.clone(),
            main_server_ip: config.main_server_ip.clone(),
            cluster_secret,
            hardware_id: config.hardware_id.clone(),
            version: self.identity.version(),
            total_nodes: summary.total_nodes,
            online_nodes: summary.online_nodes,
            offline_nodes: summary.offline_nodes,
            db_replication_ok: summary.db_replication_ok,
            redis_replication_ok: summary.redis_replication_ok,
            db_replication_status: config.db_replication_status,
            redis_replication_status: config.redis_replication_status,
            last_heartbeat: config.last_heartbeat,
            nodes,
            events,
            promotion,
        })
    }

    /// Local engines' replication view plus background task outcomes
    pub async fn replication_status(&self) -> Result<ReplicationStatus> {
        let server_role = self
            .config
            .get()
            .await?
            .map(|c| c.server_role)
            .unwrap_or(ServerRole::Standalone);

        let database = match self.database.is_in_recovery().await {
            Ok(in_recovery) => {
                let lag = self.database.replication_lag_secs().await.ok();
                DatabaseReplication {
                    in_recovery: Some(in_recovery),
                    lag_seconds: lag,
                    sync_status: lag.filter(|_| in_recovery).map(classify_lag),
                    error: None,
                }
            }
            Err(e) => DatabaseReplication {
                error: Some(e.to_string()),
                ..Default::default()
            },
        };

        let redis = match self.cache.link_status().await {
            Ok(status) => CacheReplication {
                status: Some(status),
                error: None,
            },
            Err(e) => CacheReplication {
                status: None,
                error: Some(e.to_string()),
            },
        };

        Ok(ReplicationStatus {
            success: true,
            server_role,
            database,
            redis,
            promotion: self.store.promotion_state().await?,
            tasks: self.tasks.outcomes().await?,
        })
    }

    /// Pre-flight reachability check against a candidate main
    pub async fn test_connection(&self, request: &TestConnectionRequest) -> Result<ConnectionReport> {
        if request.main_server_ip.trim().is_empty() {
            return Err(Error::Conflict("main_server_ip is required".into()));
        }
        let ports = ProbePorts {
            api: self.peers.port(),
            db: self.params.db_port,
            redis: self.params.redis_port,
        };
        Ok(test_connection(request.main_server_ip.trim(), ports, self.timing.probe_timeout).await)
    }
}

/// `GET /cluster/status` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub success: bool,
    pub cluster_id: String,
    pub is_active: bool,
    pub server_role: ServerRole,
    pub server_name: String,
    pub server_ip: String,
    pub main_server_ip: String,
    /// Full secret on the main, masked elsewhere
    pub cluster_secret: String,
    pub hardware_id: String,
    pub version: String,
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub offline_nodes: usize,
    pub db_replication_ok: bool,
    pub redis_replication_ok: bool,
    pub db_replication_status: Option<SyncStatus>,
    pub redis_replication_status: Option<SyncStatus>,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    pub nodes: Vec<ClusterNode>,
    pub events: Vec<ClusterEvent>,
    pub promotion: PromotionState,
}

impl ClusterStatus {
    fn standalone(config: Option<&ClusterConfig>, identity: &NodeIdentity, promotion: PromotionState) -> Self {
        Self {
            success: true,
            cluster_id: String::new(),
            is_active: false,
            server_role: ServerRole::Standalone,
            server_name: config
                .map(|c| c.server_name.clone())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| identity.server_name.clone()),
            server_ip: identity.server_ip.clone(),
            main_server_ip: String::new(),
            cluster_secret: String::new(),
            hardware_id: identity.hardware_id.clone(),
            version: identity.version(),
            total_nodes: 0,
            online_nodes: 0,
            offline_nodes: 0,
            db_replication_ok: false,
            redis_replication_ok: false,
            db_replication_status: None,
            redis_replication_status: None,
            last_heartbeat: None,
            nodes: Vec::new(),
            events: Vec::new(),
            promotion,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseReplication {
    pub in_recovery: Option<bool>,
    pub lag_seconds: Option<f64>,
    pub sync_status: Option<SyncStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheReplication {
    pub status: Option<SyncStatus>,
    pub error: Option<String>,
}

/// `GET /cluster/replication-status` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub success: bool,
    pub server_role: ServerRole,
    pub database: DatabaseReplication,
    pub redis: CacheReplication,
    pub promotion: PromotionState,
    pub tasks: Vec<TaskRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConnectionRequest {
    pub main_server_ip: String,
    /// Accepted for symmetry with setup; the probe does not authenticate
    #[serde(default)]
    pub cluster_secret: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{main_config, Harness};

    #[tokio::test]
    async fn test_status_of_standalone_node() {
        let h = Harness::new(crate::testing::MockDatabase::primary()).await;
        let status = h.service.status().await.unwrap();
        assert_eq!(status.server_role, ServerRole::Standalone);
        assert!(status.nodes.is_empty());
        assert_eq!(status.hardware_id, h.service.identity().hardware_id);
    }

    #[tokio::test]
    async fn test_secret_visible_only_on_main() {
        let h = Harness::main().await;
        let status = h.service.status().await.unwrap();
        assert_eq!(status.cluster_secret, main_config().cluster_secret);
        assert_eq!(status.total_nodes, 1);

        h.service
            .config()
            .update(|c| c.server_role = ServerRole::Secondary)
            .await
            .unwrap();
        let status = h.service.status().await.unwrap();
        assert_eq!(status.cluster_secret, "s3cr****");
    }

    #[tokio::test]
    async fn test_replication_status_reports_engines() {
        let h = Harness::secondary().await;
        h.database.set_lag(12.0);

        let report = h.service.replication_status().await.unwrap();
        assert_eq!(report.server_role, ServerRole::Secondary);
        assert_eq!(report.database.in_recovery, Some(true));
        assert_eq!(report.database.sync_status, Some(SyncStatus::Syncing));
        assert_eq!(report.redis.status, Some(SyncStatus::Online));
    }

    #[tokio::test]
    async fn test_connection_probe_requires_address() {
        let h = Harness::main().await;
        let err = h
            .service
            .test_connection(&TestConnectionRequest {
                main_server_ip: " ".into(),
                cluster_secret: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
