//! Leaving a cluster and removing nodes from it

use super::ClusterService;
use crate::error::{Error, Result};
use crate::model::{
    Ack, EventType, NewEvent, NodeLeftRequest, PromotionState, ServerRole, Severity,
};
use crate::tasks::TaskKind;

impl ClusterService {
    /// Leave the cluster and return to standalone
    pub async fn leave_cluster(&self) -> Result<Ack> {
        let config = self.config.require().await?;

        if config.server_role == ServerRole::Main {
            let members = self.store.count_members(&config.cluster_id).await?;
            if members > 0 {
                return Err(Error::Conflict(format!(
                    "{} node(s) are still attached; remove or promote them first",
                    members
                )));
            }
        } else {
            let peers = self.peers.clone();
            let main_ip = config.main_server_ip.clone();
            let request = NodeLeftRequest {
                cluster_secret: config.cluster_secret.clone(),
                hardware_id: config.hardware_id.clone(),
            };
            self.tasks
                .submit(TaskKind::LeaveNotification, async move {
                    let ack = peers.node_left(&main_ip, &request).await?;
                    Ok(format!("main {} acknowledged leave: {}", main_ip, ack.message))
                })
                .await?;
        }

        // A member's registry is a mirror of the main's, so it goes too
        let (nodes, events) = self.store.delete_cluster(&config.cluster_id).await?;
        tracing::debug!("Removed {} node rows and {} events of {}", nodes, events, config.cluster_id);

        self.config.reset().await?;
        self.store.set_promotion_state(&PromotionState::default()).await?;

        tracing::info!("Left cluster {} (was {})", config.cluster_id, config.server_role);
        Ok(Ack::ok(format!("Left cluster {}", config.cluster_id)))
    }

    /// A secondary announced it is leaving
    pub async fn node_left(&self, request: NodeLeftRequest) -> Result<Ack> {
        let config = self.config.require_role(ServerRole::Main).await?;
        self.check_secret(&config, &request.cluster_secret)?;

        let node = self
            .store
            .find_node_by_hardware(&config.cluster_id, &request.hardware_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("node {}", request.hardware_id)))?;
        if node.server_role == ServerRole::Main {
            return Err(Error::Forbidden("the main node cannot leave through node-left".into()));
        }

        self.store.delete_node(node.id).await?;
        self.store
            .append_event(
                NewEvent::new(
                    &config.cluster_id,
                    EventType::NodeLeft,
                    format!("{} ({}) left the cluster", node.server_name, node.server_ip),
                )
                .node(&node),
            )
            .await?;

        tracing::info!("Node {} ({}) left", node.server_name, node.server_ip);
        Ok(Ack::ok("Node removed"))
    }

    /// Remove a node from the registry
    pub async fn remove_node(&self, node_id: i64) -> Result<Ack> {
        let config = self.config.require_role(ServerRole::Main).await?;
        let node = self
            .store
            .get_node(node_id)
            .await?
            .filter(|n| n.cluster_id == config.cluster_id)
            .ok_or_else(|| Error::NotFound(format!("cluster node {}", node_id)))?;

        if node.server_role == ServerRole::Main {
            return Err(Error::Forbidden("the main node cannot be removed".into()));
        }

        self.store.delete_node(node.id).await?;
        self.store
            .append_event(
                NewEvent::new(
                    &config.cluster_id,
                    EventType::NodeRemoved,
                    format!("{} ({}) removed from the cluster", node.server_name, node.server_ip),
                )
                .node(&node)
                .severity(Severity::Warning),
            )
            .await?;

        tracing::info!("Removed node {} ({})", node.server_name, node.server_ip);
        Ok(Ack::ok(format!("Node {} removed", node.server_ip)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PromotionPhase;
    use crate::tasks::{wait_for, TaskStatus};
    use crate::testing::{Harness, CLUSTER_ID, SECONDARY_HW, SECRET};

    #[tokio::test]
    async fn test_main_cannot_leave_with_members() {
        let h = Harness::main().await;
        let member = h.register("hw-x", "10.0.0.7", ServerRole::Secondary).await;

        assert!(matches!(h.service.leave_cluster().await, Err(Error::Conflict(_))));
        assert_eq!(h.service.config().require().await.unwrap().server_role, ServerRole::Main);

        h.service.remove_node(member.id).await.unwrap();
        h.service.leave_cluster().await.unwrap();

        let config = h.service.config().get().await.unwrap().unwrap();
        assert_eq!(config.server_role, ServerRole::Standalone);
        assert!(config.cluster_id.is_empty());
        assert!(config.cluster_secret.is_empty());
        assert!(h.store.list_nodes(CLUSTER_ID).await.unwrap().is_empty());
        assert!(h.store.recent_events(CLUSTER_ID, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_secondary_leaves_even_if_main_is_unreachable() {
        let h = Harness::secondary().await;
        let mut outcomes = h.service.tasks().subscribe();

        h.service.leave_cluster().await.unwrap();
        let config = h.service.config().get().await.unwrap().unwrap();
        assert_eq!(config.server_role, ServerRole::Standalone);
        assert!(h.store.find_node_by_hardware(CLUSTER_ID, SECONDARY_HW).await.unwrap().is_none());
        assert_eq!(h.store.promotion_state().await.unwrap().phase, PromotionPhase::Idle);

        let outcome = wait_for(&mut outcomes, TaskKind::LeaveNotification).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_node_left_on_main() {
        let h = Harness::main().await;
        h.register("hw-x", "10.0.0.7", ServerRole::Server3).await;

        let bad = NodeLeftRequest {
            cluster_secret: "wrong".into(),
            hardware_id: "hw-x".into(),
        };
        assert!(matches!(h.service.node_left(bad).await, Err(Error::Unauthorized)));

        let request = NodeLeftRequest {
            cluster_secret: SECRET.into(),
            hardware_id: "hw-x".into(),
        };
        h.service.node_left(request.clone()).await.unwrap();
        assert!(h.store.find_node_by_hardware(CLUSTER_ID, "hw-x").await.unwrap().is_none());
        assert_eq!(h.event_types().await[0], "node_left");
        assert!(matches!(h.service.node_left(request).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_node_rules() {
        let h = Harness::main().await;
        let main = h.store.find_main_node(CLUSTER_ID).await.unwrap().unwrap();
        assert!(matches!(h.service.remove_node(main.id).await, Err(Error::Forbidden(_))));
        assert!(matches!(h.service.remove_node(4242).await, Err(Error::NotFound(_))));

        let node = h.register("hw-x", "10.0.0.7", ServerRole::Server4).await;
        h.service.remove_node(node.id).await.unwrap();
        assert_eq!(h.event_types().await[0], "node_removed");

        let secondary = Harness::secondary().await;
        assert!(matches!(
            secondary.service.remove_node(1).await,
            Err(Error::RoleMismatch { .. })
        ));
    }
}
