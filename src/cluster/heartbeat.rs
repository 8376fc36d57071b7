//! Heartbeat Monitor
//!
//! The main receives health reports and classifies replication health;
//! members send them on a fixed interval. The main also marks members
//! that stop reporting as offline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::ClusterService;
use crate::error::{Error, Result};
use crate::metrics::{self, NodeMetrics};
use crate::model::{
    ClusterConfig, ClusterNode, EventType, HeartbeatRequest, HeartbeatResponse, NewEvent,
    NodeStatus, ServerRole, Severity, SyncStatus,
};

/// Lag upper bound (exclusive) for a healthy replica
const ONLINE_LAG_SECS: f64 = 5.0;
/// Lag upper bound (exclusive) for a replica that is catching up
const SYNCING_LAG_SECS: f64 = 30.0;
/// Reported when the local database cannot be queried
const UNKNOWN_LAG_SECS: f64 = 3600.0;

/// Classify database replication health from its lag in seconds
pub fn classify_lag(lag_secs: f64) -> SyncStatus {
    if lag_secs < ONLINE_LAG_SECS {
        SyncStatus::Online
    } else if lag_secs < SYNCING_LAG_SECS {
        SyncStatus::Syncing
    } else {
        SyncStatus::Error
    }
}

/// A member should update when both versions are known and differ
pub fn update_available(main_version: &str, node_version: &str) -> bool {
    !main_version.is_empty() && !node_version.is_empty() && main_version != node_version
}

impl ClusterService {
    /// Record a member's health report
    pub async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let config = self.config.require_role(ServerRole::Main).await?;
        self.check_secret(&config, &request.cluster_secret)?;

        let mut node = self
            .store
            .find_node_by_hardware(&config.cluster_id, &request.hardware_id)
            .await?
            .ok_or_else(|| {
                tracing::warn!("Heartbeat from unregistered node {}", request.hardware_id);
                Error::NotFound(format!("node {} has not joined this cluster", request.hardware_id))
            })?;

        if node.status != NodeStatus::Online {
            tracing::info!("Node {} ({}) is back online", node.server_name, node.server_ip);
        }

        node.status = NodeStatus::Online;
        node.cpu_cores = request.cpu_cores;
        node.ram_mb = request.ram_mb;
        node.cpu_usage = request.cpu_usage;
        node.mem_usage = request.mem_usage;
        node.disk_usage = request.disk_usage;
        node.db_replication_lag = request.db_replication_lag;
        node.db_sync_status = classify_lag(request.db_replication_lag);
        if let Some(status) = request.redis_sync_status {
            node.redis_sync_status = status;
        }
        if !request.version.is_empty() {
            node.version = request.version.clone();
        }
        node.last_heartbeat = Some(Utc::now());
        self.store.update_node(&node).await?;

        tracing::debug!(
            "Heartbeat from {}: lag={:.1}s db={} redis={}",
            node.server_ip,
            node.db_replication_lag,
            node.db_sync_status,
            node.redis_sync_status
        );

        let main_version = self.identity.version();
        Ok(HeartbeatResponse {
            success: true,
            update_available: update_available(&main_version, &request.version),
            main_version,
            members: self.store.list_nodes(&config.cluster_id).await?,
        })
    }

    /// Report local health to the main and mirror its roster
    pub(crate) async fn send_heartbeat(
        &self,
        config: &ClusterConfig,
        metrics: NodeMetrics,
    ) -> Result<HeartbeatResponse> {
        let lag = match self.database.replication_lag_secs().await {
            Ok(lag) => lag,
            Err(e) => {
                tracing::warn!("Could not read replication lag: {}", e);
                UNKNOWN_LAG_SECS
            }
        };
        let redis_sync_status = match self.cache.link_status().await {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::debug!("Could not read cache link status: {}", e);
                None
            }
        };

        let version = self.identity.version();
        let request = HeartbeatRequest {
            cluster_secret: config.cluster_secret.clone(),
            hardware_id: config.hardware_id.clone(),
            cpu_cores: metrics.cpu_cores,
            ram_mb: metrics.ram_mb,
            cpu_usage: metrics.cpu_usage,
            mem_usage: metrics.mem_usage,
            disk_usage: metrics.disk_usage,
            db_replication_lag: lag,
            redis_sync_status,
            version: version.clone(),
        };
        let response = self.peers.heartbeat(&config.main_server_ip, &request).await?;

        if response.update_available {
            tracing::info!(
                "Update available: main runs {}, this node runs {}",
                response.main_version,
                version
            );
        }
        self.apply_heartbeat_response(config, &response, lag, redis_sync_status)
            .await?;
        Ok(response)
    }

    /// Mirror the main's roster and record local replication health
    ///
    /// Skipped when this node stopped following the main the heartbeat was
    /// sent to, so a late response cannot undo a promotion or a repoint.
    pub(crate) async fn apply_heartbeat_response(
        &self,
        sent_with: &ClusterConfig,
        response: &HeartbeatResponse,
        lag: f64,
        redis_sync_status: Option<SyncStatus>,
    ) -> Result<bool> {
        let _guard = self.roles_lock.lock().await;
        let current = self.config.require().await?;
        if !current.server_role.is_member()
            || current.cluster_id != sent_with.cluster_id
            || current.main_server_ip != sent_with.main_server_ip
        {
            tracing::info!(
                "Now {} following {}, ignoring heartbeat response from {}",
                current.server_role,
                current.main_server_ip,
                sent_with.main_server_ip
            );
            return Ok(false);
        }

        if !response.members.is_empty() {
            self.store.mirror_roster(&current.cluster_id, &response.members).await?;
        }

        let now = Utc::now();
        self.config
            .update(|c| {
                c.last_heartbeat = Some(now);
                c.last_sync_time = Some(now);
                c.db_replication_status = Some(classify_lag(lag));
                if let Some(status) = redis_sync_status {
                    c.redis_replication_status = Some(status);
                }
            })
            .await?;
        Ok(true)
    }

    /// Refresh the main's own registry row
    pub(crate) async fn refresh_self(&self, config: &ClusterConfig, metrics: NodeMetrics) -> Result<()> {
        let Some(mut node) = self
            .store
            .find_node_by_hardware(&config.cluster_id, &config.hardware_id)
            .await?
        else {
            tracing::warn!("Main has no registry row of its own");
            return Ok(());
        };

        node.status = NodeStatus::Online;
        node.cpu_cores = metrics.cpu_cores;
        node.ram_mb = metrics.ram_mb;
        node.cpu_usage = metrics.cpu_usage;
        node.mem_usage = metrics.mem_usage;
        node.disk_usage = metrics.disk_usage;
        node.db_replication_lag = 0.0;
        node.db_sync_status = SyncStatus::Online;
        node.version = self.identity.version();
        node.last_heartbeat = Some(Utc::now());
        self.store.update_node(&node).await?;

        self.config.update(|c| c.last_heartbeat = node.last_heartbeat).await?;
        Ok(())
    }

    /// Mark members without a recent heartbeat as offline
    ///
    /// Returns the nodes that changed state; a node already offline is not
    /// reported again.
    pub async fn mark_stale_nodes(&self, now: DateTime<Utc>) -> Result<Vec<ClusterNode>> {
        let config = self.config.require_role(ServerRole::Main).await?;
        let stale_after = chrono::Duration::from_std(self.timing.stale_after)
            .map_err(|e| Error::Internal(format!("invalid stale window: {}", e)))?;
        let cutoff = now - stale_after;

        let mut marked = Vec::new();
        for mut node in self.store.list_nodes(&config.cluster_id).await? {
            if node.hardware_id == config.hardware_id || node.status == NodeStatus::Offline {
                continue;
            }
            let last_seen = node.last_heartbeat.unwrap_or(node.joined_at);
            if last_seen >= cutoff {
                continue;
            }

            node.status = NodeStatus::Offline;
            self.store.update_node(&node).await?;

            let silent_for = (now - last_seen).num_seconds();
            tracing::warn!(
                "Node {} ({}) missed heartbeats for {}s, marking offline",
                node.server_name,
                node.server_ip,
                silent_for
            );
            self.store
                .append_event(
                    NewEvent::new(
                        &config.cluster_id,
                        EventType::NodeOffline,
                        format!("{} ({}) has not reported for {}s", node.server_name, node.server_ip, silent_for),
                    )
                    .node(&node)
                    .severity(Severity::Warning),
                )
                .await?;
            marked.push(node);
        }

        Ok(marked)
    }

    /// One heartbeat round for the local role
    pub async fn heartbeat_tick(&self) -> Result<()> {
        let config = match self.config.get().await? {
            Some(config) if config.in_cluster() => config,
            _ => return Ok(()),
        };

        let metrics = tokio::task::spawn_blocking(metrics::collect)
            .await
            .map_err(|e| Error::Internal(format!("metrics collection failed: {}", e)))?;

        if config.server_role == ServerRole::Main {
            self.refresh_self(&config, metrics).await?;
            self.mark_stale_nodes(Utc::now()).await?;
        } else {
            self.send_heartbeat(&config, metrics).await?;
        }
        Ok(())
    }

    /// Run heartbeat rounds forever on the configured interval
    pub fn spawn_heartbeat_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.timing.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = this.heartbeat_tick().await {
                    tracing::warn!("Heartbeat round failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, CLUSTER_ID, MAIN_HW, SECONDARY_HW, SECRET};

    fn report(hardware_id: &str, lag: f64) -> HeartbeatRequest {
        HeartbeatRequest {
            cluster_secret: SECRET.into(),
            hardware_id: hardware_id.into(),
            cpu_cores: 8,
            ram_mb: 32768,
            cpu_usage: 12.5,
            db_replication_lag: lag,
            redis_sync_status: Some(SyncStatus::Online),
            version: "1.2.0".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_lag_boundaries() {
        assert_eq!(classify_lag(0.0), SyncStatus::Online);
        assert_eq!(classify_lag(2.0), SyncStatus::Online);
        assert_eq!(classify_lag(4.999), SyncStatus::Online);
        assert_eq!(classify_lag(5.0), SyncStatus::Syncing);
        assert_eq!(classify_lag(10.0), SyncStatus::Syncing);
        assert_eq!(classify_lag(30.0), SyncStatus::Error);
        assert_eq!(classify_lag(60.0), SyncStatus::Error);
    }

    #[test]
    fn test_classify_lag_is_monotonic() {
        let rank = |s: SyncStatus| match s {
            SyncStatus::Online => 0,
            SyncStatus::Syncing => 1,
            SyncStatus::Error => 2,
        };
        let mut previous = 0;
        for tenth in 0..1000 {
            let current = rank(classify_lag(tenth as f64 / 10.0));
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn test_update_available() {
        assert!(update_available("1.3.0", "1.2.0"));
        assert!(!update_available("1.2.0", "1.2.0"));
        assert!(!update_available("", "1.2.0"));
        assert!(!update_available("1.3.0", ""));
        assert!(!update_available("", ""));
    }

    #[tokio::test]
    async fn test_heartbeat_updates_node() {
        let h = Harness::main().await;
        h.register("hw-x", "10.0.0.7", ServerRole::Secondary).await;
        h.set_version("1.3.0");

        let response = h.service.heartbeat(report("hw-x", 10.0)).await.unwrap();
        assert!(response.update_available);
        assert_eq!(response.main_version, "1.3.0");
        assert_eq!(response.members.len(), 2);

        let node = h.store.find_node_by_hardware(CLUSTER_ID, "hw-x").await.unwrap().unwrap();
        assert_eq!(node.db_sync_status, SyncStatus::Syncing);
        assert_eq!(node.cpu_cores, 8);
        assert_eq!(node.version, "1.2.0");
    }

    #[tokio::test]
    async fn test_heartbeat_rejections() {
        let h = Harness::main().await;

        let mut bad = report("hw-x", 0.0);
        bad.cluster_secret = "nope".into();
        assert!(matches!(h.service.heartbeat(bad).await, Err(Error::Unauthorized)));
        assert!(matches!(
            h.service.heartbeat(report("hw-unknown", 0.0)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_nodes_marked_offline_once() {
        let h = Harness::main().await;
        let mut node = h.register("hw-x", "10.0.0.7", ServerRole::Secondary).await;
        node.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(120));
        h.store.update_node(&node).await.unwrap();
        h.register("hw-y", "10.0.0.8", ServerRole::Server3).await;

        let marked = h.service.mark_stale_nodes(Utc::now()).await.unwrap();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].hardware_id, "hw-x");

        assert!(h.service.mark_stale_nodes(Utc::now()).await.unwrap().is_empty());
        let offline_events = h
            .event_types()
            .await
            .into_iter()
            .filter(|e| e == "node_offline")
            .count();
        assert_eq!(offline_events, 1);

        // A fresh heartbeat brings it back
        h.service.heartbeat(report("hw-x", 1.0)).await.unwrap();
        let node = h.store.find_node_by_hardware(CLUSTER_ID, "hw-x").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_main_refreshes_own_row() {
        let h = Harness::main().await;
        let config = h.service.config().require().await.unwrap();
        h.service
            .refresh_self(
                &config,
                NodeMetrics {
                    cpu_cores: 4,
                    ram_mb: 8192,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let me = h.store.find_main_node(CLUSTER_ID).await.unwrap().unwrap();
        assert_eq!(me.cpu_cores, 4);
        assert_eq!(me.status, NodeStatus::Online);
    }

    fn roster_response(members: Vec<ClusterNode>) -> HeartbeatResponse {
        HeartbeatResponse {
            success: true,
            main_version: String::new(),
            update_available: false,
            members,
        }
    }

    #[tokio::test]
    async fn test_response_mirrors_roster_while_following() {
        let h = Harness::secondary().await;
        let sent_with = h.service.config().require().await.unwrap();
        let mut roster = h.store.list_nodes(CLUSTER_ID).await.unwrap();
        for node in roster.iter_mut().filter(|n| n.hardware_id == MAIN_HW) {
            node.cpu_cores = 32;
        }

        let applied = h
            .service
            .apply_heartbeat_response(&sent_with, &roster_response(roster), 12.0, None)
            .await
            .unwrap();
        assert!(applied);

        let main = h.store.find_node_by_hardware(CLUSTER_ID, MAIN_HW).await.unwrap().unwrap();
        assert_eq!(main.cpu_cores, 32);
        let config = h.service.config().require().await.unwrap();
        assert_eq!(config.db_replication_status, Some(SyncStatus::Syncing));
        assert!(config.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_late_response_does_not_undo_promotion() {
        let h = Harness::secondary().await;
        let sent_with = h.service.config().require().await.unwrap();
        let old_roster = h.store.list_nodes(CLUSTER_ID).await.unwrap();

        h.service.promote_to_main().await.unwrap();

        let applied = h
            .service
            .apply_heartbeat_response(&sent_with, &roster_response(old_roster), 0.0, None)
            .await
            .unwrap();
        assert!(!applied);

        let me = h.store.find_node_by_hardware(CLUSTER_ID, SECONDARY_HW).await.unwrap().unwrap();
        assert_eq!(me.server_role, ServerRole::Main);
        let old_main = h.store.find_node_by_hardware(CLUSTER_ID, MAIN_HW).await.unwrap().unwrap();
        assert_eq!(old_main.server_role, ServerRole::Secondary);
        assert_eq!(old_main.status, NodeStatus::Offline);
        assert_eq!(
            h.service.config().require().await.unwrap().db_replication_status,
            Some(SyncStatus::Online)
        );
    }

    #[tokio::test]
    async fn test_late_response_ignored_after_repoint() {
        let h = Harness::secondary().await;
        let sent_with = h.service.config().require().await.unwrap();
        h.service.config().update(|c| c.main_server_ip = "10.0.0.3".into()).await.unwrap();

        let roster = h.store.list_nodes(CLUSTER_ID).await.unwrap();
        let applied = h
            .service
            .apply_heartbeat_response(&sent_with, &roster_response(roster), 0.0, None)
            .await
            .unwrap();
        assert!(!applied);
    }
}
