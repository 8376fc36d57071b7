//! Event Log
//!
//! Append-only audit trail of membership and failover events.

use chrono::Utc;
use rusqlite::params;

use super::store::{parse_col, parse_opt_col, ClusterStore};
use crate::error::Result;
use crate::model::{ClusterEvent, NewEvent};

impl ClusterStore {
    /// Append an event to the log
    pub async fn append_event(&self, event: NewEvent) -> Result<ClusterEvent> {
        let created_at = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO cluster_events (
                cluster_id, event_type, node_id, node_ip, node_role, description, severity, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                event.cluster_id,
                event.event_type.as_str(),
                event.node_id,
                event.node_ip,
                event.node_role.map(|r| r.as_str()),
                event.description,
                event.severity.as_str(),
                created_at,
            ],
        )?;

        Ok(ClusterEvent {
            id: conn.last_insert_rowid(),
            cluster_id: event.cluster_id,
            event_type: event.event_type,
            node_id: event.node_id,
            node_ip: event.node_ip,
            node_role: event.node_role,
            description: event.description,
            severity: event.severity,
            created_at,
        })
    }

    /// Most recent events for a cluster, newest first
    pub async fn recent_events(&self, cluster_id: &str, limit: usize) -> Result<Vec<ClusterEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, cluster_id, event_type, node_id, node_ip, node_role, description, severity, created_at
            FROM cluster_events WHERE cluster_id = ?1
            ORDER BY id DESC LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![cluster_id, limit as i64], |row| {
            Ok(ClusterEvent {
                id: row.get(0)?,
                cluster_id: row.get(1)?,
                event_type: parse_col(row, 2)?,
                node_id: row.get(3)?,
                node_ip: row.get(4)?,
                node_role: parse_opt_col(row, 5)?,
                description: row.get(6)?,
                severity: parse_col(row, 7)?,
                created_at: row.get(8)?,
            })
        })?;

        let mut events = Vec::new();
        for result in rows {
            events.push(result?);
        }
        Ok(events)
    }
}
