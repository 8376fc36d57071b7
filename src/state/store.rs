//! Cluster State Store
//!
//! Persistent storage for the local cluster configuration, the node
//! registry, the event log and the promotion marker.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::model::{ClusterConfig, PromotionPhase, PromotionState, SyncStatus};

/// Persistent cluster state backed by SQLite
pub struct ClusterStore {
    /// Database connection
    pub(super) conn: Mutex<Connection>,
}

impl ClusterStore {
    /// Create or open the state database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a throwaway in-memory store
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS cluster_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                cluster_id TEXT NOT NULL,
                cluster_secret TEXT NOT NULL,
                server_role TEXT NOT NULL,
                server_name TEXT NOT NULL,
                server_ip TEXT NOT NULL,
                main_server_ip TEXT NOT NULL,
                hardware_id TEXT NOT NULL,
                database_id TEXT NOT NULL,
                is_active INTEGER NOT NULL,
                db_replication_enabled INTEGER NOT NULL,
                db_replication_status TEXT,
                redis_replication_enabled INTEGER NOT NULL,
                redis_replication_status TEXT,
                last_heartbeat TEXT,
                last_sync_time TEXT
            );

            CREATE TABLE IF NOT EXISTS cluster_nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id TEXT NOT NULL,
                hardware_id TEXT NOT NULL,
                server_name TEXT NOT NULL,
                server_ip TEXT NOT NULL,
                server_role TEXT NOT NULL,
                status TEXT NOT NULL,
                db_sync_status TEXT NOT NULL,
                redis_sync_status TEXT NOT NULL,
                cpu_cores INTEGER NOT NULL DEFAULT 0,
                ram_mb INTEGER NOT NULL DEFAULT 0,
                cpu_usage REAL NOT NULL DEFAULT 0,
                mem_usage REAL NOT NULL DEFAULT 0,
                disk_usage REAL NOT NULL DEFAULT 0,
                db_replication_lag REAL NOT NULL DEFAULT 0,
                version TEXT NOT NULL DEFAULT '',
                joined_at TEXT NOT NULL,
                last_heartbeat TEXT,
                UNIQUE (cluster_id, hardware_id)
            );

            CREATE TABLE IF NOT EXISTS cluster_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                node_id INTEGER,
                node_ip TEXT NOT NULL,
                node_role TEXT,
                description TEXT NOT NULL,
                severity TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cluster_events_cluster
                ON cluster_events(cluster_id, id);

            CREATE TABLE IF NOT EXISTS promotion_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                phase TEXT NOT NULL,
                previous_main_ip TEXT NOT NULL,
                started_at TEXT,
                updated_at TEXT,
                error TEXT
            );

            CREATE TABLE IF NOT EXISTS task_outcomes (
                kind TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                message TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Load the local cluster configuration, if this node has one
    pub async fn load_config(&self) -> Result<Option<ClusterConfig>> {
        let conn = self.conn.lock().await;
        let config = conn
            .query_row(
                r#"
                SELECT cluster_id, cluster_secret, server_role, server_name, server_ip,
                       main_server_ip, hardware_id, database_id, is_active,
                       db_replication_enabled, db_replication_status,
                       redis_replication_enabled, redis_replication_status,
                       last_heartbeat, last_sync_time
                FROM cluster_config WHERE id = 1
                "#,
                [],
                config_from_row,
            )
            .optional()?;
        Ok(config)
    }

    /// Write the local cluster configuration (the single row is replaced)
    pub async fn save_config(&self, config: &ClusterConfig) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO cluster_config (
                id, cluster_id, cluster_secret, server_role, server_name, server_ip,
                main_server_ip, hardware_id, database_id, is_active,
                db_replication_enabled, db_replication_status,
                redis_replication_enabled, redis_replication_status,
                last_heartbeat, last_sync_time
            ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(id) DO UPDATE SET
                cluster_id = ?1, cluster_secret = ?2, server_role = ?3, server_name = ?4,
                server_ip = ?5, main_server_ip = ?6, hardware_id = ?7, database_id = ?8,
                is_active = ?9, db_replication_enabled = ?10, db_replication_status = ?11,
                redis_replication_enabled = ?12, redis_replication_status = ?13,
                last_heartbeat = ?14, last_sync_time = ?15
            "#,
            params![
                config.cluster_id,
                config.cluster_secret,
                config.server_role.as_str(),
                config.server_name,
                config.server_ip,
                config.main_server_ip,
                config.hardware_id,
                config.database_id,
                config.is_active,
                config.db_replication_enabled,
                config.db_replication_status.map(|s| s.as_str()),
                config.redis_replication_enabled,
                config.redis_replication_status.map(|s| s.as_str()),
                config.last_heartbeat,
                config.last_sync_time,
            ],
        )?;
        Ok(())
    }

    /// Get the persisted promotion marker
    pub async fn promotion_state(&self) -> Result<PromotionState> {
        let conn = self.conn.lock().await;
        let state = conn
            .query_row(
                "SELECT phase, previous_main_ip, started_at, updated_at, error
                 FROM promotion_state WHERE id = 1",
                [],
                |row| {
                    Ok(PromotionState {
                        phase: parse_col(row, 0)?,
                        previous_main_ip: row.get(1)?,
                        started_at: row.get(2)?,
                        updated_at: row.get(3)?,
                        error: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    /// Advance the promotion marker
    pub async fn set_promotion_state(&self, state: &PromotionState) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO promotion_state (id, phase, previous_main_ip, started_at, updated_at, error)
            VALUES (1, ?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                phase = ?1, previous_main_ip = ?2, started_at = ?3, updated_at = ?4, error = ?5
            "#,
            params![
                state.phase.as_str(),
                state.previous_main_ip,
                state.started_at,
                state.updated_at,
                state.error,
            ],
        )?;
        Ok(())
    }

    /// Convenience: move the marker to a new phase, keeping its context
    pub async fn advance_promotion(&self, phase: PromotionPhase, error: Option<String>) -> Result<PromotionState> {
        let mut state = self.promotion_state().await?;
        state.phase = phase;
        state.updated_at = Some(Utc::now());
        state.error = error;
        self.set_promotion_state(&state).await?;
        Ok(state)
    }
}

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<ClusterConfig> {
    Ok(ClusterConfig {
        cluster_id: row.get(0)?,
        cluster_secret: row.get(1)?,
        server_role: parse_col(row, 2)?,
        server_name: row.get(3)?,
        server_ip: row.get(4)?,
        main_server_ip: row.get(5)?,
        hardware_id: row.get(6)?,
        database_id: row.get(7)?,
        is_active: row.get(8)?,
        db_replication_enabled: row.get(9)?,
        db_replication_status: parse_opt_col::<SyncStatus>(row, 10)?,
        redis_replication_enabled: row.get(11)?,
        redis_replication_status: parse_opt_col::<SyncStatus>(row, 12)?,
        last_heartbeat: row.get::<_, Option<DateTime<Utc>>>(13)?,
        last_sync_time: row.get::<_, Option<DateTime<Utc>>>(14)?,
    })
}

/// Parse a text column into one of the model enums
pub(super) fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = crate::Error>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(super) fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = crate::Error>,
{
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServerRole;
    use tempfile::tempdir;

    fn sample_config() -> ClusterConfig {
        ClusterConfig {
            cluster_id: "cluster-1".into(),
            cluster_secret: "s3cret".into(),
            server_role: ServerRole::Main,
            server_name: "core-1".into(),
            server_ip: "10.0.0.1".into(),
            main_server_ip: "10.0.0.1".into(),
            hardware_id: "hw-main".into(),
            database_id: "7301".into(),
            is_active: true,
            db_replication_enabled: true,
            db_replication_status: Some(SyncStatus::Online),
            redis_replication_enabled: false,
            redis_replication_status: None,
            last_heartbeat: Some(Utc::now()),
            last_sync_time: None,
        }
    }

    #[tokio::test]
    async fn test_config_round_trip_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("cluster.db");
        let config = sample_config();

        {
            let store = ClusterStore::open(&path).unwrap();
            assert!(store.load_config().await.unwrap().is_none());
            store.save_config(&config).await.unwrap();
        }

        let store = ClusterStore::open(&path).unwrap();
        let loaded = store.load_config().await.unwrap().unwrap();
        assert_eq!(loaded.cluster_id, config.cluster_id);
        assert_eq!(loaded.server_role, ServerRole::Main);
        assert_eq!(loaded.db_replication_status, Some(SyncStatus::Online));
        assert_eq!(loaded.redis_replication_status, None);
    }

    #[tokio::test]
    async fn test_save_config_keeps_single_row() {
        let store = ClusterStore::in_memory().unwrap();
        let mut config = sample_config();
        store.save_config(&config).await.unwrap();
        config.server_role = ServerRole::Secondary;
        store.save_config(&config).await.unwrap();

        let conn = store.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cluster_config", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_promotion_marker() {
        let store = ClusterStore::in_memory().unwrap();
        assert_eq!(store.promotion_state().await.unwrap().phase, PromotionPhase::Idle);

        store
            .set_promotion_state(&PromotionState {
                phase: PromotionPhase::Started,
                previous_main_ip: "10.0.0.1".into(),
                started_at: Some(Utc::now()),
                updated_at: None,
                error: None,
            })
            .await
            .unwrap();

        let state = store
            .advance_promotion(PromotionPhase::DatabasePromoted, None)
            .await
            .unwrap();
        assert_eq!(state.previous_main_ip, "10.0.0.1");
        assert_eq!(store.promotion_state().await.unwrap().phase, PromotionPhase::DatabasePromoted);
    }
}
