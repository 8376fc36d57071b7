//! Cluster creation and joining from the local side

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::ClusterService;
use crate::engine::{CacheSource, StandbyPlan};
use crate::error::{Error, Result};
use crate::model::{
    ClusterConfig, EventType, JoinRequest, JoinResponse, NewClusterNode, NewEvent, ServerRole,
    Severity, SyncStatus,
};
use crate::tasks::TaskKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupMainRequest {
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub server_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupMainResponse {
    pub success: bool,
    pub cluster_id: String,
    pub cluster_secret: String,
    pub server_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupSecondaryRequest {
    pub main_server_ip: String,
    pub cluster_secret: String,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub server_ip: Option<String>,
    #[serde(default)]
    pub server_role: Option<ServerRole>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupSecondaryResponse {
    pub success: bool,
    pub cluster_id: String,
    pub assigned_role: ServerRole,
    pub main_server: String,
    pub message: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl ClusterService {
    async fn ensure_standalone(&self) -> Result<()> {
        if let Some(config) = self.config.get().await? {
            if config.in_cluster() {
                return Err(Error::Conflict(format!(
                    "this node is already {} of cluster {}; leave it first",
                    config.server_role, config.cluster_id
                )));
            }
        }
        Ok(())
    }

    async fn database_id(&self) -> String {
        match self.database.system_identifier().await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Could not read database system identifier: {}", e);
                String::new()
            }
        }
    }

    /// Create a new cluster with this node as main
    pub async fn setup_main(&self, request: SetupMainRequest) -> Result<SetupMainResponse> {
        self.ensure_standalone().await?;

        let cluster_id = uuid::Uuid::new_v4().to_string();
        let secret: [u8; 32] = rand::random();
        let cluster_secret = hex::encode(secret);
        let server_name = non_empty(request.server_name).unwrap_or_else(|| self.identity.server_name.clone());
        let server_ip = non_empty(request.server_ip).unwrap_or_else(|| self.identity.server_ip.clone());

        let config = ClusterConfig {
            cluster_id: cluster_id.clone(),
            cluster_secret: cluster_secret.clone(),
            server_role: ServerRole::Main,
            server_name: server_name.clone(),
            server_ip: server_ip.clone(),
            main_server_ip: server_ip.clone(),
            hardware_id: self.identity.hardware_id.clone(),
            database_id: self.database_id().await,
            is_active: true,
            db_replication_enabled: true,
            db_replication_status: Some(SyncStatus::Online),
            redis_replication_enabled: true,
            redis_replication_status: Some(SyncStatus::Online),
            last_heartbeat: Some(Utc::now()),
            last_sync_time: None,
        };
        self.config.save(&config).await?;
        self.store.set_promotion_state(&Default::default()).await?;

        let mut node = self
            .store
            .insert_node(NewClusterNode {
                cluster_id: cluster_id.clone(),
                hardware_id: self.identity.hardware_id.clone(),
                server_name: server_name.clone(),
                server_ip: server_ip.clone(),
                server_role: ServerRole::Main,
                version: self.identity.version(),
            })
            .await?;
        node.db_sync_status = SyncStatus::Online;
        node.redis_sync_status = SyncStatus::Online;
        self.store.update_node(&node).await?;

        self.store
            .append_event(
                NewEvent::new(&cluster_id, EventType::ClusterCreated, format!("Cluster created by {}", server_name))
                    .node(&node),
            )
            .await?;

        tracing::info!("Created cluster {} with {} ({}) as main", cluster_id, server_name, server_ip);

        Ok(SetupMainResponse {
            success: true,
            cluster_id,
            cluster_secret,
            server_ip,
        })
    }

    /// Join an existing cluster through its main
    ///
    /// Returns once the main has accepted the node; replication is set up
    /// by a background task.
    pub async fn setup_secondary(self: &Arc<Self>, request: SetupSecondaryRequest) -> Result<SetupSecondaryResponse> {
        self.ensure_standalone().await?;

        let main_ip = request.main_server_ip.trim().to_string();
        if main_ip.is_empty() {
            return Err(Error::Conflict("main_server_ip is required".into()));
        }
        let server_name = non_empty(request.server_name).unwrap_or_else(|| self.identity.server_name.clone());
        let server_ip = non_empty(request.server_ip).unwrap_or_else(|| self.identity.server_ip.clone());
        let database_id = self.database_id().await;

        let join = JoinRequest {
            cluster_secret: request.cluster_secret.clone(),
            hardware_id: self.identity.hardware_id.clone(),
            server_name: server_name.clone(),
            server_ip: server_ip.clone(),
            requested_role: request.server_role,
            database_id: database_id.clone(),
            version: self.identity.version(),
        };
        let response = self.peers.join(&main_ip, &join).await?;

        self.config
            .save(&ClusterConfig {
                cluster_id: response.cluster_id.clone(),
                cluster_secret: request.cluster_secret,
                server_role: response.assigned_role,
                server_name: server_name.clone(),
                server_ip: server_ip.clone(),
                main_server_ip: response.main_server_ip.clone(),
                hardware_id: self.identity.hardware_id.clone(),
                database_id,
                is_active: true,
                db_replication_enabled: true,
                db_replication_status: Some(SyncStatus::Syncing),
                redis_replication_enabled: true,
                redis_replication_status: Some(SyncStatus::Syncing),
                last_heartbeat: None,
                last_sync_time: None,
            })
            .await?;
        self.store.set_promotion_state(&Default::default()).await?;

        let node = match self
            .store
            .find_node_by_hardware(&response.cluster_id, &self.identity.hardware_id)
            .await?
        {
            Some(mut node) => {
                node.server_role = response.assigned_role;
                node.server_ip = server_ip.clone();
                self.store.update_node(&node).await?;
                node
            }
            None => {
                self.store
                    .insert_node(NewClusterNode {
                        cluster_id: response.cluster_id.clone(),
                        hardware_id: self.identity.hardware_id.clone(),
                        server_name: server_name.clone(),
                        server_ip: server_ip.clone(),
                        server_role: response.assigned_role,
                        version: self.identity.version(),
                    })
                    .await?
            }
        };

        self.store
            .append_event(
                NewEvent::new(
                    &response.cluster_id,
                    EventType::ClusterJoined,
                    format!("Joined cluster as {} via main {}", response.assigned_role, response.main_server_ip),
                )
                .node(&node),
            )
            .await?;

        tracing::info!(
            "Joined cluster {} as {}, main is {}",
            response.cluster_id,
            response.assigned_role,
            response.main_server_ip
        );

        let this = Arc::clone(self);
        let bootstrap = response.clone();
        self.tasks
            .submit(TaskKind::ReplicationBootstrap, async move {
                this.bootstrap_replication(&bootstrap).await
            })
            .await?;

        Ok(SetupSecondaryResponse {
            success: true,
            cluster_id: response.cluster_id,
            assigned_role: response.assigned_role,
            main_server: response.main_server_ip,
            message: "Joined cluster, replication setup initiated".into(),
        })
    }

    /// Point the local database and cache at the main from a join response
    pub(crate) async fn bootstrap_replication(&self, response: &JoinResponse) -> Result<String> {
        let plan = StandbyPlan {
            primary_host: response.db_host.clone(),
            primary_port: response.db_port,
            replication_user: response.db_user.clone(),
            replication_password: response.db_password.clone(),
            slot_name: response.replication_slot.clone(),
            database: response.db_name.clone(),
        };
        let source = CacheSource {
            host: response.redis_host.clone(),
            port: response.redis_port,
            password: Some(response.redis_password.clone()).filter(|p| !p.is_empty()),
        };
        self.apply_replication(&plan, &source).await
    }

    /// Run both replication legs, record their status and report failures
    pub(crate) async fn apply_replication(&self, plan: &StandbyPlan, source: &CacheSource) -> Result<String> {
        let db_result = self.database.configure_standby(plan).await;
        let cache_result = self.cache.replicate_from(source).await;

        let status = |ok: bool| if ok { SyncStatus::Syncing } else { SyncStatus::Error };
        let db_ok = db_result.is_ok();
        let cache_ok = cache_result.is_ok();
        let config = self
            .config
            .update(|c| {
                c.db_replication_status = Some(status(db_ok));
                c.redis_replication_status = Some(status(cache_ok));
                c.last_sync_time = Some(Utc::now());
            })
            .await?;

        let mut failures = Vec::new();
        if let Err(e) = db_result {
            failures.push(format!("database: {}", e));
        }
        if let Err(e) = cache_result {
            failures.push(format!("cache: {}", e));
        }

        if failures.is_empty() {
            return Ok(format!(
                "database standby of {} (slot {}) and cache replica of {}:{} configured",
                plan.primary_host, plan.slot_name, source.host, source.port
            ));
        }

        let message = failures.join("; ");
        self.store
            .append_event(
                NewEvent::new(
                    &config.cluster_id,
                    EventType::ReplicationFailed,
                    format!("Replication setup against {} failed: {}", plan.primary_host, message),
                )
                .ip(&config.server_ip, config.server_role)
                .severity(Severity::Critical),
            )
            .await?;
        Err(Error::ExternalOperation(message))
    }
}
