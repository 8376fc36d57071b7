//! Failover / Promotion Controller
//!
//! Three entry points lead to the same end state. `manual_failover` only
//! records intent on the main, `handle_promote` accepts a pushed request
//! and promotes in the background, `promote_to_main` promotes in the
//! foreground.
//!
//! Promotion advances a persisted marker after every step:
//!
//! ```text
//! idle -> started -> database_promoted -> metadata_updated -> completed
//!            \______________\___________________\-> failed
//! ```
//!
//! A crash after `database_promoted` leaves the marker behind, and the
//! next `promote_to_main` resumes from the metadata step.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::ClusterService;
use crate::error::{Error, Result};
use crate::model::{
    Ack, ClusterConfig, EventType, NewClusterNode, NewEvent, NodeStatus, PromoteRequest,
    PromotionPhase, PromotionState, ServerRole, Severity, SyncStatus,
};
use crate::tasks::TaskKind;

/// Result of a promotion, with the outcome of each leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionReport {
    pub success: bool,
    pub new_role: ServerRole,
    /// Database is primary and cluster metadata points at this node
    pub database: bool,
    /// Cache detached from the old primary
    pub redis: bool,
    pub resumed: bool,
    pub message: String,
}

impl ClusterService {
    /// Record the intent to fail over to `target_node_id`
    ///
    /// No role changes here; the target must then be promoted.
    pub async fn manual_failover(&self, target_node_id: i64) -> Result<Ack> {
        let config = self.config.require_role(ServerRole::Main).await?;
        let target = self
            .store
            .get_node(target_node_id)
            .await?
            .filter(|n| n.cluster_id == config.cluster_id)
            .ok_or_else(|| Error::NotFound(format!("cluster node {}", target_node_id)))?;

        if target.server_role == ServerRole::Main {
            return Err(Error::Conflict(format!("node {} is already the main", target_node_id)));
        }

        self.store
            .append_event(
                NewEvent::new(
                    &config.cluster_id,
                    EventType::ManualFailover,
                    format!(
                        "Manual failover from {} to {} ({}) requested",
                        config.server_ip, target.server_name, target.server_ip
                    ),
                )
                .node(&target)
                .severity(Severity::Warning),
            )
            .await?;

        tracing::warn!("Manual failover to {} ({}) recorded", target.server_name, target.server_ip);
        Ok(Ack::ok(format!(
            "Failover to {} recorded; promote that node to complete it",
            target.server_ip
        )))
    }

    /// Accept a promotion pushed by the current or former main
    pub async fn handle_promote(self: &Arc<Self>, request: PromoteRequest) -> Result<Ack> {
        let config = self.config.require().await?;
        self.check_secret(&config, &request.cluster_secret)?;
        if request.cluster_id != config.cluster_id {
            return Err(Error::NotFound(format!("cluster {}", request.cluster_id)));
        }
        if !config.server_role.is_member() {
            return Err(Error::role_mismatch(ServerRole::Secondary, config.server_role));
        }

        self.store
            .append_event(
                NewEvent::new(
                    &config.cluster_id,
                    EventType::PromotionReceived,
                    format!(
                        "Promotion requested by {} ({})",
                        if request.current_main.is_empty() { "unknown" } else { request.current_main.as_str() },
                        if request.event.is_empty() { "promote" } else { request.event.as_str() }
                    ),
                )
                .ip(&config.server_ip, config.server_role)
                .severity(Severity::Warning),
            )
            .await?;
        tracing::warn!("Promotion requested by {}", request.current_main);

        let this = Arc::clone(self);
        self.tasks
            .submit(TaskKind::Promotion, async move {
                match this.promote_to_main().await {
                    Ok(report) => Ok(report.message),
                    Err(e) => {
                        // PromotionFailed was recorded where it arose
                        if !matches!(e, Error::PromotionFailed(_)) {
                            this.record_promotion_failure(&config, &e.to_string()).await;
                        }
                        Err(e)
                    }
                }
            })
            .await?;

        Ok(Ack::ok("Promotion initiated"))
    }

    /// Promote this node to main
    pub async fn promote_to_main(self: &Arc<Self>) -> Result<PromotionReport> {
        let config = self.config.require().await?;
        let marker = self.store.promotion_state().await?;

        if !self.database.is_in_recovery().await? {
            if marker.phase.is_resumable() {
                tracing::warn!("Resuming promotion interrupted in phase {}", marker.phase);
                return self.finish_promotion(config, marker.previous_main_ip, true).await;
            }
            return Err(Error::Conflict("database is already primary".into()));
        }

        if !config.server_role.is_member() {
            return Err(Error::role_mismatch(ServerRole::Secondary, config.server_role));
        }

        let previous_main_ip = config.main_server_ip.clone();
        let now = Utc::now();
        self.store
            .set_promotion_state(&PromotionState {
                phase: PromotionPhase::Started,
                previous_main_ip: previous_main_ip.clone(),
                started_at: Some(now),
                updated_at: Some(now),
                error: None,
            })
            .await?;
        tracing::warn!("Promoting {} to main (previous main {})", config.server_ip, previous_main_ip);

        if let Err(e) = self.database.promote().await {
            return Err(self.fail_promotion(&config, format!("promote call failed: {}", e)).await);
        }

        tokio::time::sleep(self.timing.promote_settle).await;

        match self.database.is_in_recovery().await {
            Ok(false) => {}
            Ok(true) => {
                return Err(self
                    .fail_promotion(&config, "database still in standby mode after promote".into())
                    .await)
            }
            Err(e) => {
                return Err(self
                    .fail_promotion(&config, format!("could not verify promotion: {}", e))
                    .await)
            }
        }

        self.store
            .advance_promotion(PromotionPhase::DatabasePromoted, None)
            .await?;
        self.finish_promotion(config, previous_main_ip, false).await
    }

    /// Metadata, registry and cache steps, run once the database is primary
    async fn finish_promotion(
        self: &Arc<Self>,
        config: ClusterConfig,
        previous_main_ip: String,
        resumed: bool,
    ) -> Result<PromotionReport> {
        if let Err(e) = self.update_promotion_metadata(&config).await {
            let marker = self.store.promotion_state().await?;
            self.store
                .advance_promotion(marker.phase, Some(e.to_string()))
                .await?;
            self.record_promotion_failure(&config, &format!("metadata update failed: {}", e))
                .await;
            return Err(Error::PromotionFailed(format!(
                "database is primary but cluster metadata update failed: {}; run promote-to-main again to resume",
                e
            )));
        }
        self.store
            .advance_promotion(PromotionPhase::MetadataUpdated, None)
            .await?;

        let redis = match self.cache.stop_replication().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Cache could not be detached from the old primary: {}", e);
                self.config
                    .update(|c| c.redis_replication_status = Some(SyncStatus::Error))
                    .await?;
                false
            }
        };

        self.store
            .advance_promotion(PromotionPhase::Completed, None)
            .await?;

        let previous = if previous_main_ip.is_empty() { "unknown" } else { previous_main_ip.as_str() };
        self.store
            .append_event(
                NewEvent::new(
                    &config.cluster_id,
                    EventType::FailoverComplete,
                    format!(
                        "{} ({}) promoted to main; previous main was {}",
                        config.server_name, config.server_ip, previous
                    ),
                )
                .ip(&config.server_ip, ServerRole::Main)
                .severity(Severity::Warning),
            )
            .await?;
        tracing::warn!("Promotion complete, {} is now main (previous {})", config.server_ip, previous);

        let this = Arc::clone(self);
        let new_main_ip = config.server_ip.clone();
        self.tasks
            .submit(TaskKind::NotifyPeers, async move {
                this.notify_peers(&new_main_ip).await
            })
            .await?;

        let message = if redis {
            "Promoted to main".to_string()
        } else {
            "Promoted to main; cache is still replicating from the old primary".to_string()
        };
        Ok(PromotionReport {
            success: true,
            new_role: ServerRole::Main,
            database: true,
            redis,
            resumed,
            message,
        })
    }

    /// Local config becomes main; registry rows swap roles
    async fn update_promotion_metadata(&self, config: &ClusterConfig) -> Result<()> {
        let _guard = self.roles_lock.lock().await;
        let own_row = self
            .store
            .find_node_by_hardware(&config.cluster_id, &config.hardware_id)
            .await?;
        let vacated_role = if config.server_role.is_member() {
            config.server_role
        } else {
            own_row
                .as_ref()
                .map(|n| n.server_role)
                .filter(|r| r.is_member())
                .unwrap_or(ServerRole::Secondary)
        };

        self.config
            .update(|c| {
                c.server_role = ServerRole::Main;
                c.main_server_ip = c.server_ip.clone();
                c.is_active = true;
                c.db_replication_status = Some(SyncStatus::Online);
            })
            .await?;

        for mut node in self.store.list_nodes(&config.cluster_id).await? {
            if node.server_role == ServerRole::Main && node.hardware_id != config.hardware_id {
                node.server_role = vacated_role;
                node.status = NodeStatus::Offline;
                self.store.update_node(&node).await?;
                tracing::info!("Old main {} marked offline as {}", node.server_ip, vacated_role);
            }
        }

        let mut own = match own_row {
            Some(node) => node,
            None => {
                self.store
                    .insert_node(NewClusterNode {
                        cluster_id: config.cluster_id.clone(),
                        hardware_id: config.hardware_id.clone(),
                        server_name: config.server_name.clone(),
                        server_ip: config.server_ip.clone(),
                        server_role: ServerRole::Main,
                        version: self.identity.version(),
                    })
                    .await?
            }
        };
        own.server_role = ServerRole::Main;
        own.status = NodeStatus::Online;
        own.db_sync_status = SyncStatus::Online;
        own.redis_sync_status = SyncStatus::Online;
        own.db_replication_lag = 0.0;
        own.last_heartbeat = Some(Utc::now());
        self.store.update_node(&own).await
    }

    /// Mark the promotion failed before the database changed role
    async fn fail_promotion(&self, config: &ClusterConfig, reason: String) -> Error {
        tracing::error!("Promotion failed: {}", reason);
        if let Err(e) = self
            .store
            .advance_promotion(PromotionPhase::Failed, Some(reason.clone()))
            .await
        {
            tracing::error!("Could not record failed promotion: {}", e);
        }
        self.record_promotion_failure(config, &reason).await;
        Error::PromotionFailed(reason)
    }

    async fn record_promotion_failure(&self, config: &ClusterConfig, reason: &str) {
        let event = NewEvent::new(
            &config.cluster_id,
            EventType::PromotionFailed,
            format!("Promotion of {} failed: {}", config.server_ip, reason),
        )
        .ip(&config.server_ip, config.server_role)
        .severity(Severity::Critical);

        if let Err(e) = self.store.append_event(event).await {
            tracing::error!("Could not record promotion failure event: {}", e);
        }
    }

    /// Warn about a promotion left unfinished by a previous run
    pub async fn check_interrupted_promotion(&self) -> Result<Option<PromotionState>> {
        let marker = self.store.promotion_state().await?;
        if !marker.phase.is_in_progress() {
            return Ok(None);
        }

        tracing::warn!(
            "Promotion interrupted in phase {} (previous main {}); run promote-to-main to resume",
            marker.phase,
            marker.previous_main_ip
        );
        Ok(Some(marker))
    }
}
