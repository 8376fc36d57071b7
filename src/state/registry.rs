//! Node Registry
//!
//! Cluster-wide roster of known member nodes, including self.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::store::{parse_col, ClusterStore};
use crate::error::{Error, Result};
use crate::model::{ClusterNode, NewClusterNode, NodeStatus, ServerRole, SyncStatus};

const NODE_COLUMNS: &str = r#"
    id, cluster_id, hardware_id, server_name, server_ip, server_role, status,
    db_sync_status, redis_sync_status, cpu_cores, ram_mb, cpu_usage, mem_usage,
    disk_usage, db_replication_lag, version, joined_at, last_heartbeat
"#;

impl ClusterStore {
    /// Insert a new node row; the node starts online with a fresh heartbeat
    pub async fn insert_node(&self, node: NewClusterNode) -> Result<ClusterNode> {
        let now = Utc::now();
        let id = {
            let conn = self.conn.lock().await;
            conn.execute(
                r#"
                INSERT INTO cluster_nodes (
                    cluster_id, hardware_id, server_name, server_ip, server_role, status,
                    db_sync_status, redis_sync_status, version, joined_at, last_heartbeat
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                "#,
                params![
                    node.cluster_id,
                    node.hardware_id,
                    node.server_name,
                    node.server_ip,
                    node.server_role.as_str(),
                    NodeStatus::Online.as_str(),
                    SyncStatus::Syncing.as_str(),
                    SyncStatus::Syncing.as_str(),
                    node.version,
                    now,
                ],
            )?;
            conn.last_insert_rowid()
        };

        self.get_node(id)
            .await?
            .ok_or_else(|| Error::Store(format!("node {} vanished after insert", id)))
    }

    /// Get a node by registry id
    pub async fn get_node(&self, id: i64) -> Result<Option<ClusterNode>> {
        let conn = self.conn.lock().await;
        let node = conn
            .query_row(
                &format!("SELECT {} FROM cluster_nodes WHERE id = ?1", NODE_COLUMNS),
                params![id],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    /// Find a node by its hardware id
    pub async fn find_node_by_hardware(
        &self,
        cluster_id: &str,
        hardware_id: &str,
    ) -> Result<Option<ClusterNode>> {
        let conn = self.conn.lock().await;
        let node = conn
            .query_row(
                &format!(
                    "SELECT {} FROM cluster_nodes WHERE cluster_id = ?1 AND hardware_id = ?2",
                    NODE_COLUMNS
                ),
                params![cluster_id, hardware_id],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    /// Find the node currently holding the main role
    pub async fn find_main_node(&self, cluster_id: &str) -> Result<Option<ClusterNode>> {
        let conn = self.conn.lock().await;
        let node = conn
            .query_row(
                &format!(
                    "SELECT {} FROM cluster_nodes WHERE cluster_id = ?1 AND server_role = ?2
                     ORDER BY id LIMIT 1",
                    NODE_COLUMNS
                ),
                params![cluster_id, ServerRole::Main.as_str()],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    /// All nodes of a cluster, ordered by id
    pub async fn list_nodes(&self, cluster_id: &str) -> Result<Vec<ClusterNode>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM cluster_nodes WHERE cluster_id = ?1 ORDER BY id",
            NODE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![cluster_id], node_from_row)?;

        let mut nodes = Vec::new();
        for result in rows {
            nodes.push(result?);
        }
        Ok(nodes)
    }

    /// Persist every mutable field of a node row (last write wins)
    pub async fn update_node(&self, node: &ClusterNode) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            r#"
            UPDATE cluster_nodes SET
                server_name = ?2, server_ip = ?3, server_role = ?4, status = ?5,
                db_sync_status = ?6, redis_sync_status = ?7, cpu_cores = ?8, ram_mb = ?9,
                cpu_usage = ?10, mem_usage = ?11, disk_usage = ?12, db_replication_lag = ?13,
                version = ?14, last_heartbeat = ?15
            WHERE id = ?1
            "#,
            params![
                node.id,
                node.server_name,
                node.server_ip,
                node.server_role.as_str(),
                node.status.as_str(),
                node.db_sync_status.as_str(),
                node.redis_sync_status.as_str(),
                node.cpu_cores,
                node.ram_mb as i64,
                node.cpu_usage,
                node.mem_usage,
                node.disk_usage,
                node.db_replication_lag,
                node.version,
                node.last_heartbeat,
            ],
        )?;

        if updated == 0 {
            return Err(Error::NotFound(format!("cluster node {}", node.id)));
        }
        Ok(())
    }

    /// Delete a single node row
    pub async fn delete_node(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM cluster_nodes WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Delete every node and event row for a cluster
    pub async fn delete_cluster(&self, cluster_id: &str) -> Result<(usize, usize)> {
        let conn = self.conn.lock().await;
        let nodes = conn.execute("DELETE FROM cluster_nodes WHERE cluster_id = ?1", params![cluster_id])?;
        let events = conn.execute("DELETE FROM cluster_events WHERE cluster_id = ?1", params![cluster_id])?;
        Ok((nodes, events))
    }

    /// Number of attached non-main nodes
    pub async fn count_members(&self, cluster_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cluster_nodes WHERE cluster_id = ?1 AND server_role != ?2",
            params![cluster_id, ServerRole::Main.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Replace the local roster with the main's view of the cluster
    ///
    /// Rows are matched on hardware id; local rows the main no longer
    /// knows are removed.
    pub async fn mirror_roster(&self, cluster_id: &str, members: &[ClusterNode]) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        for node in members {
            tx.execute(
                r#"
                INSERT INTO cluster_nodes (
                    cluster_id, hardware_id, server_name, server_ip, server_role, status,
                    db_sync_status, redis_sync_status, cpu_cores, ram_mb, cpu_usage, mem_usage,
                    disk_usage, db_replication_lag, version, joined_at, last_heartbeat
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                ON CONFLICT(cluster_id, hardware_id) DO UPDATE SET
                    server_name = excluded.server_name, server_ip = excluded.server_ip,
                    server_role = excluded.server_role, status = excluded.status,
                    db_sync_status = excluded.db_sync_status,
                    redis_sync_status = excluded.redis_sync_status,
                    cpu_cores = excluded.cpu_cores, ram_mb = excluded.ram_mb,
                    cpu_usage = excluded.cpu_usage, mem_usage = excluded.mem_usage,
                    disk_usage = excluded.disk_usage,
                    db_replication_lag = excluded.db_replication_lag,
                    version = excluded.version, joined_at = excluded.joined_at,
                    last_heartbeat = excluded.last_heartbeat
                "#,
                params![
                    cluster_id,
                    node.hardware_id,
                    node.server_name,
                    node.server_ip,
                    node.server_role.as_str(),
                    node.status.as_str(),
                    node.db_sync_status.as_str(),
                    node.redis_sync_status.as_str(),
                    node.cpu_cores,
                    node.ram_mb as i64,
                    node.cpu_usage,
                    node.mem_usage,
                    node.disk_usage,
                    node.db_replication_lag,
                    node.version,
                    node.joined_at,
                    node.last_heartbeat,
                ],
            )?;
        }

        let known: Vec<String> = {
            let mut stmt = tx.prepare("SELECT hardware_id FROM cluster_nodes WHERE cluster_id = ?1")?;
            let rows = stmt.query_map(params![cluster_id], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for hardware_id in known {
            if !members.iter().any(|m| m.hardware_id == hardware_id) {
                tx.execute(
                    "DELETE FROM cluster_nodes WHERE cluster_id = ?1 AND hardware_id = ?2",
                    params![cluster_id, hardware_id],
                )?;
            }
        }

        tx.commit()?;
        Ok(members.len())
    }
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<ClusterNode> {
    Ok(ClusterNode {
        id: row.get(0)?,
        cluster_id: row.get(1)?,
        hardware_id: row.get(2)?,
        server_name: row.get(3)?,
        server_ip: row.get(4)?,
        server_role: parse_col(row, 5)?,
        status: parse_col(row, 6)?,
        db_sync_status: parse_col(row, 7)?,
        redis_sync_status: parse_col(row, 8)?,
        cpu_cores: row.get(9)?,
        ram_mb: row.get::<_, i64>(10)? as u64,
        cpu_usage: row.get(11)?,
        mem_usage: row.get(12)?,
        disk_usage: row.get(13)?,
        db_replication_lag: row.get(14)?,
        version: row.get(15)?,
        joined_at: row.get(16)?,
        last_heartbeat: row.get(17)?,
    })
}

/// Cluster summary information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub offline_nodes: usize,
    pub main_ip: Option<String>,
    /// Every member's database replication is online
    pub db_replication_ok: bool,
    /// Every member's cache replication is online
    pub redis_replication_ok: bool,
}

impl ClusterSummary {
    pub fn from_nodes(nodes: &[ClusterNode]) -> Self {
        let mut summary = ClusterSummary {
            total_nodes: nodes.len(),
            db_replication_ok: true,
            redis_replication_ok: true,
            ..Default::default()
        };

        for node in nodes {
            match node.status {
                NodeStatus::Online => summary.online_nodes += 1,
                NodeStatus::Offline | NodeStatus::Error => summary.offline_nodes += 1,
            }

            if node.server_role == ServerRole::Main {
                summary.main_ip = Some(node.server_ip.clone());
                continue;
            }

            if node.db_sync_status != SyncStatus::Online {
                summary.db_replication_ok = false;
            }
            if node.redis_sync_status != SyncStatus::Online {
                summary.redis_replication_ok = false;
            }
        }

        summary
    }
}
