//! Peer notifications: announcing and accepting a new main

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;

use super::{replication_slot_name, ClusterService};
use crate::engine::{CacheSource, StandbyPlan};
use crate::error::{Error, Result};
use crate::model::{
    Ack, ClusterConfig, EventType, NewEvent, NotifyEvent, NotifyRequest, ServerRole, Severity,
    SyncStatus,
};
use crate::tasks::TaskKind;

impl ClusterService {
    /// Tell every other registered node that `new_main_ip` is the main
    ///
    /// Unreachable peers are logged and counted, never retried.
    pub async fn notify_peers(&self, new_main_ip: &str) -> Result<String> {
        let config = self.config.require().await?;
        let peers: Vec<_> = self
            .store
            .list_nodes(&config.cluster_id)
            .await?
            .into_iter()
            .filter(|n| n.hardware_id != config.hardware_id && n.server_ip != new_main_ip)
            .collect();

        if peers.is_empty() {
            return Ok("no peers to notify".into());
        }

        let request = NotifyRequest {
            event: NotifyEvent::NewMain,
            new_main_ip: new_main_ip.to_string(),
            cluster_id: config.cluster_id.clone(),
            cluster_secret: config.cluster_secret.clone(),
            timestamp: Utc::now(),
        };

        let calls = peers.iter().map(|peer| {
            let request = &request;
            async move { (peer, self.peers.notify(&peer.server_ip, request).await) }
        });

        let mut notified = 0;
        for (peer, result) in join_all(calls).await {
            match result {
                Ok(_) => {
                    notified += 1;
                    tracing::info!("Notified {} ({}) of new main {}", peer.server_name, peer.server_ip, new_main_ip);
                }
                Err(e) => {
                    tracing::warn!("Failed to notify {} ({}): {}", peer.server_name, peer.server_ip, e);
                }
            }
        }

        Ok(format!("notified {} of {} peers", notified, peers.len()))
    }

    /// Accept a notification from a peer
    pub async fn handle_notify(self: &Arc<Self>, request: NotifyRequest) -> Result<Ack> {
        let config = self.config.require().await?;
        self.check_secret(&config, &request.cluster_secret)?;
        if request.cluster_id != config.cluster_id {
            return Err(Error::NotFound(format!("cluster {}", request.cluster_id)));
        }

        match request.event {
            NotifyEvent::NewMain => self.accept_new_main(config, request.new_main_ip).await,
            NotifyEvent::ConfigUpdate => {
                self.config.invalidate().await;
                tracing::info!("Cluster configuration update received, cache invalidated");
                Ok(Ack::ok("Configuration reloaded"))
            }
            NotifyEvent::Unknown => {
                tracing::warn!("Ignoring unknown notification event");
                Ok(Ack::ok("Event ignored"))
            }
        }
    }

    async fn accept_new_main(self: &Arc<Self>, config: ClusterConfig, new_main_ip: String) -> Result<Ack> {
        let new_main_ip = new_main_ip.trim().to_string();
        if new_main_ip.is_empty() {
            return Err(Error::Conflict("new_main_ip is required".into()));
        }
        if new_main_ip == config.server_ip {
            return Ok(Ack::ok("This node is already the main"));
        }

        let guard = self.roles_lock.lock().await;
        let demoted = config.server_role == ServerRole::Main;
        let updated = self
            .config
            .update(|c| {
                c.main_server_ip = new_main_ip.clone();
                if demoted {
                    c.server_role = ServerRole::Secondary;
                }
                c.db_replication_status = Some(SyncStatus::Syncing);
                c.redis_replication_status = Some(SyncStatus::Syncing);
            })
            .await?;

        for mut node in self.store.list_nodes(&config.cluster_id).await? {
            let role = if node.server_ip == new_main_ip {
                ServerRole::Main
            } else if node.hardware_id == config.hardware_id && demoted {
                ServerRole::Secondary
            } else {
                continue;
            };
            if node.server_role != role {
                node.server_role = role;
                self.store.update_node(&node).await?;
            }
        }
        drop(guard);

        if demoted {
            tracing::warn!("Demoted from main, {} is the new main", new_main_ip);
        }
        self.store
            .append_event(
                NewEvent::new(
                    &config.cluster_id,
                    EventType::NewMainAcknowledged,
                    format!("{} acknowledged {} as the new main", config.server_ip, new_main_ip),
                )
                .ip(&config.server_ip, updated.server_role)
                .severity(if demoted { Severity::Warning } else { Severity::Info }),
            )
            .await?;

        let this = Arc::clone(self);
        let main_ip = new_main_ip.clone();
        self.tasks
            .submit(TaskKind::ReplicationRepoint, async move {
                this.repoint_replication(&main_ip).await
            })
            .await?;

        Ok(Ack::ok(format!("Now following {}", new_main_ip)))
    }

    /// Re-point both replication legs at a new main
    ///
    /// Credentials are the local ones; every node in a cluster shares them.
    async fn repoint_replication(&self, main_ip: &str) -> Result<String> {
        let config = self.config.require().await?;
        let plan = StandbyPlan {
            primary_host: main_ip.to_string(),
            primary_port: self.params.db_port,
            replication_user: self.params.db_user.clone(),
            replication_password: self.params.db_password.clone(),
            slot_name: replication_slot_name(&config.hardware_id),
            database: self.params.db_name.clone(),
        };
        let source = CacheSource {
            host: main_ip.to_string(),
            port: self.params.redis_port,
            password: Some(self.params.redis_password.clone()).filter(|p| !p.is_empty()),
        };
        self.apply_replication(&plan, &source).await
    }
}
