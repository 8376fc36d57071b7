//! Shared test fixtures: sample configs, mock engines and a service harness.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tempfile::TempDir;

use crate::cluster::ClusterService;
use crate::config::AppConfig;
use crate::engine::{CacheEngine, CacheSource, DatabaseEngine, Engines, StandbyPlan};
use crate::error::{Error, Result};
use crate::identity::NodeIdentity;
use crate::model::{ClusterConfig, ClusterNode, NewClusterNode, ServerRole, SyncStatus};
use crate::state::ClusterStore;

pub const CLUSTER_ID: &str = "cluster-1";
pub const SECRET: &str = "s3cret-value";
pub const MAIN_HW: &str = "hw-main";
pub const MAIN_IP: &str = "10.0.0.1";
pub const SECONDARY_HW: &str = "hw-second";
pub const SECONDARY_IP: &str = "10.0.0.2";

pub fn main_config() -> ClusterConfig {
    ClusterConfig {
        cluster_id: CLUSTER_ID.into(),
        cluster_secret: SECRET.into(),
        server_role: ServerRole::Main,
        server_name: "core-1".into(),
        server_ip: MAIN_IP.into(),
        main_server_ip: MAIN_IP.into(),
        hardware_id: MAIN_HW.into(),
        database_id: "7301".into(),
        is_active: true,
        db_replication_enabled: true,
        db_replication_status: Some(SyncStatus::Online),
        redis_replication_enabled: true,
        redis_replication_status: Some(SyncStatus::Online),
        last_heartbeat: Some(Utc::now()),
        last_sync_time: None,
    }
}

pub fn secondary_config() -> ClusterConfig {
    ClusterConfig {
        server_role: ServerRole::Secondary,
        server_name: "core-2".into(),
        server_ip: SECONDARY_IP.into(),
        hardware_id: SECONDARY_HW.into(),
        db_replication_status: Some(SyncStatus::Syncing),
        redis_replication_status: Some(SyncStatus::Syncing),
        ..main_config()
    }
}

/// Database engine double
#[derive(Default)]
pub struct MockDatabase {
    pub in_recovery: AtomicBool,
    /// Promote succeeds but the database stays a standby
    pub ignore_promote: AtomicBool,
    pub fail_promote: AtomicBool,
    pub fail_standby: AtomicBool,
    /// Every query fails as if the server were down
    pub unreachable: AtomicBool,
    pub promote_calls: AtomicUsize,
    lag_bits: AtomicU64,
    pub standby_plans: Mutex<Vec<StandbyPlan>>,
}

impl MockDatabase {
    pub fn primary() -> Self {
        Self::default()
    }

    pub fn standby() -> Self {
        let db = Self::default();
        db.in_recovery.store(true, Ordering::SeqCst);
        db
    }

    pub fn set_lag(&self, lag: f64) {
        self.lag_bits.store(lag.to_bits(), Ordering::SeqCst);
    }

    pub fn plans(&self) -> Vec<StandbyPlan> {
        self.standby_plans.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl DatabaseEngine for MockDatabase {
    async fn is_in_recovery(&self) -> Result<bool> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::ExternalOperation("database connection refused".into()));
        }
        Ok(self.in_recovery.load(Ordering::SeqCst))
    }

    async fn promote(&self) -> Result<()> {
        self.promote_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_promote.load(Ordering::SeqCst) {
            return Err(Error::ExternalOperation("pg_promote refused".into()));
        }
        if !self.ignore_promote.load(Ordering::SeqCst) {
            self.in_recovery.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn system_identifier(&self) -> Result<String> {
        Ok("7301".into())
    }

    async fn replication_lag_secs(&self) -> Result<f64> {
        Ok(f64::from_bits(self.lag_bits.load(Ordering::SeqCst)))
    }

    async fn configure_standby(&self, plan: &StandbyPlan) -> Result<String> {
        if self.fail_standby.load(Ordering::SeqCst) {
            return Err(Error::ExternalOperation("standby setup failed (exit status: 1)".into()));
        }
        self.standby_plans.lock().unwrap().push(plan.clone());
        self.in_recovery.store(true, Ordering::SeqCst);
        Ok("standby ready".into())
    }
}

/// Cache engine double
#[derive(Default)]
pub struct MockCache {
    pub sources: Mutex<Vec<CacheSource>>,
    pub stop_calls: AtomicUsize,
    pub fail_stop: AtomicBool,
}

impl MockCache {
    pub fn sources(&self) -> Vec<CacheSource> {
        self.sources.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CacheEngine for MockCache {
    async fn replicate_from(&self, source: &CacheSource) -> Result<()> {
        self.sources.lock().unwrap().push(source.clone());
        Ok(())
    }

    async fn stop_replication(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(Error::ExternalOperation("redis-cli REPLICAOF: connection refused".into()));
        }
        Ok(())
    }

    async fn link_status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus::Online)
    }
}

/// A port with no listener, so peer calls fail fast
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A cluster service wired to mock engines and an in-memory store
pub struct Harness {
    pub service: Arc<ClusterService>,
    pub store: Arc<ClusterStore>,
    pub database: Arc<MockDatabase>,
    pub cache: Arc<MockCache>,
    pub dir: TempDir,
}

impl Harness {
    /// Standalone node with the main's identity
    pub async fn new(database: MockDatabase) -> Self {
        Self::build(MAIN_HW, MAIN_IP, "core-1", database, closed_port()).await
    }

    pub async fn build(
        hardware_id: &str,
        server_ip: &str,
        server_name: &str,
        database: MockDatabase,
        peer_port: u16,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut app = AppConfig::default();
        app.node.data_dir = dir.path().to_path_buf();
        app.api.peer_port = peer_port;
        app.cluster.promote_settle_secs = 0;
        app.cluster.probe_timeout_secs = 1;
        app.cluster.peer_timeout_secs = 2;

        let identity = NodeIdentity {
            hardware_id: hardware_id.into(),
            server_ip: server_ip.into(),
            server_name: server_name.into(),
            version_file: dir.path().join("VERSION"),
        };

        let store = Arc::new(ClusterStore::in_memory().unwrap());
        let database = Arc::new(database);
        let cache = Arc::new(MockCache::default());
        let engines = Engines {
            database: database.clone(),
            cache: cache.clone(),
        };
        let service = ClusterService::new(&app, identity, Arc::clone(&store), engines).unwrap();

        Self {
            service,
            store,
            database,
            cache,
            dir,
        }
    }

    /// Main node with only itself registered
    pub async fn main() -> Self {
        let h = Self::new(MockDatabase::primary()).await;
        h.service.config().save(&main_config()).await.unwrap();
        h.register(MAIN_HW, MAIN_IP, ServerRole::Main).await;
        h
    }

    /// Secondary whose registry mirrors a two-node cluster
    pub async fn secondary() -> Self {
        let h = Self::build(
            SECONDARY_HW,
            SECONDARY_IP,
            "core-2",
            MockDatabase::standby(),
            closed_port(),
        )
        .await;
        h.service.config().save(&secondary_config()).await.unwrap();
        h.register(MAIN_HW, MAIN_IP, ServerRole::Main).await;
        h.register(SECONDARY_HW, SECONDARY_IP, ServerRole::Secondary).await;
        h
    }

    /// Insert a registry row with healthy replication
    pub async fn register(&self, hardware_id: &str, server_ip: &str, role: ServerRole) -> ClusterNode {
        let mut node = self
            .store
            .insert_node(NewClusterNode {
                cluster_id: CLUSTER_ID.into(),
                hardware_id: hardware_id.into(),
                server_name: format!("node-{}", hardware_id),
                server_ip: server_ip.into(),
                server_role: role,
                version: String::new(),
            })
            .await
            .unwrap();
        node.db_sync_status = SyncStatus::Online;
        node.redis_sync_status = SyncStatus::Online;
        self.store.update_node(&node).await.unwrap();
        node
    }

    pub fn set_version(&self, version: &str) {
        std::fs::write(self.dir.path().join("VERSION"), version).unwrap();
    }

    pub async fn event_types(&self) -> Vec<String> {
        self.store
            .recent_events(CLUSTER_ID, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type.as_str().to_string())
            .collect()
    }
}
