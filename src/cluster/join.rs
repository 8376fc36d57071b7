//! Join/auth handshake, served by the main

use chrono::Utc;
use sha2::{Digest, Sha256};

use super::ClusterService;
use crate::error::{Error, Result};
use crate::identity::is_local_only_host;
use crate::model::{
    ClusterConfig, ClusterNode, EventType, JoinRequest, JoinResponse, NewClusterNode, NewEvent,
    NodeStatus, ServerRole,
};

const SLOT_PREFIX: &str = "ispc_slot_";
const SLOT_HASH_LEN: usize = 16;

/// Replication slot name for a node, stable across rejoins
pub fn replication_slot_name(hardware_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(hardware_id.as_bytes()));
    format!("{}{}", SLOT_PREFIX, &digest[..SLOT_HASH_LEN])
}

impl ClusterService {
    /// Admit a node into the cluster
    pub async fn join(&self, request: JoinRequest) -> Result<JoinResponse> {
        let config = self.config.require_role(ServerRole::Main).await?;
        self.check_secret(&config, &request.cluster_secret)?;

        if request.hardware_id.trim().is_empty() {
            return Err(Error::Conflict("hardware_id is required".into()));
        }
        if request.hardware_id == config.hardware_id {
            return Err(Error::Conflict("the main cannot join its own cluster".into()));
        }

        let _guard = self.roles_lock.lock().await;
        let existing = self
            .store
            .find_node_by_hardware(&config.cluster_id, &request.hardware_id)
            .await?;
        let role = self.assign_role(&config, existing.as_ref(), request.requested_role).await?;

        let node = match existing {
            Some(mut node) => {
                node.server_name = request.server_name.clone();
                node.server_ip = request.server_ip.clone();
                node.server_role = role;
                node.status = NodeStatus::Online;
                node.last_heartbeat = Some(Utc::now());
                if !request.version.is_empty() {
                    node.version = request.version.clone();
                }
                self.store.update_node(&node).await?;
                self.store
                    .append_event(
                        NewEvent::new(
                            &config.cluster_id,
                            EventType::NodeRejoined,
                            format!("{} ({}) rejoined as {}", node.server_name, node.server_ip, role),
                        )
                        .node(&node),
                    )
                    .await?;
                tracing::info!("Node {} ({}) rejoined as {}", node.server_name, node.server_ip, role);
                node
            }
            None => {
                let node = self
                    .store
                    .insert_node(NewClusterNode {
                        cluster_id: config.cluster_id.clone(),
                        hardware_id: request.hardware_id.clone(),
                        server_name: request.server_name.clone(),
                        server_ip: request.server_ip.clone(),
                        server_role: role,
                        version: request.version.clone(),
                    })
                    .await?;
                self.store
                    .append_event(
                        NewEvent::new(
                            &config.cluster_id,
                            EventType::NodeJoined,
                            format!("{} ({}) joined as {}", node.server_name, node.server_ip, role),
                        )
                        .node(&node),
                    )
                    .await?;
                tracing::info!("Node {} ({}) joined as {}", node.server_name, node.server_ip, role);
                node
            }
        };

        if !request.database_id.is_empty()
            && !config.database_id.is_empty()
            && request.database_id != config.database_id
        {
            tracing::debug!(
                "Node {} has database id {}, main has {}; its standby will be rebuilt",
                node.hardware_id,
                request.database_id,
                config.database_id
            );
        }

        Ok(self.bootstrap_response(&config, &node))
    }

    /// Pick the role for a joining node
    async fn assign_role(
        &self,
        config: &ClusterConfig,
        existing: Option<&ClusterNode>,
        requested: Option<ServerRole>,
    ) -> Result<ServerRole> {
        if let Some(node) = existing {
            if node.server_role.is_member() {
                return Ok(node.server_role);
            }
        }

        let nodes = self.store.list_nodes(&config.cluster_id).await?;
        let taken = |role: ServerRole| {
            nodes
                .iter()
                .any(|n| n.server_role == role && existing.map_or(true, |e| e.id != n.id))
        };

        if let Some(role) = requested.filter(|r| r.is_member()) {
            if !taken(role) {
                return Ok(role);
            }
        }

        ServerRole::MEMBER_ROLES
            .into_iter()
            .find(|role| !taken(*role))
            .ok_or_else(|| Error::Conflict("cluster is full".into()))
    }

    /// Connection parameters for a joined node
    fn bootstrap_response(&self, config: &ClusterConfig, node: &ClusterNode) -> JoinResponse {
        let reachable = |host: &str| {
            if is_local_only_host(host) {
                config.server_ip.clone()
            } else {
                host.to_string()
            }
        };

        JoinResponse {
            success: true,
            cluster_id: config.cluster_id.clone(),
            assigned_role: node.server_role,
            main_server_ip: config.server_ip.clone(),
            db_host: reachable(&self.params.db_host),
            db_port: self.params.db_port,
            db_user: self.params.db_user.clone(),
            db_password: self.params.db_password.clone(),
            db_name: self.params.db_name.clone(),
            redis_host: reachable(&self.params.redis_host),
            redis_port: self.params.redis_port,
            redis_password: self.params.redis_password.clone(),
            replication_slot: replication_slot_name(&node.hardware_id),
        }
    }
}
