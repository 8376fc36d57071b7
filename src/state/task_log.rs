//! Background task outcomes
//!
//! Keeps the last attempt of every background task kind so operators
//! can see failures without reading logs.

use chrono::Utc;
use rusqlite::params;

use super::store::{parse_col, ClusterStore};
use crate::error::Result;
use crate::tasks::{TaskKind, TaskRecord, TaskStatus};

impl ClusterStore {
    /// Mark a task kind as running
    pub async fn record_task_started(&self, kind: TaskKind) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO task_outcomes (kind, status, message, started_at, finished_at)
            VALUES (?1, ?2, '', ?3, NULL)
            ON CONFLICT(kind) DO UPDATE SET
                status = ?2, message = '', started_at = ?3, finished_at = NULL
            "#,
            params![kind.as_str(), TaskStatus::Running.as_str(), Utc::now()],
        )?;
        Ok(())
    }

    /// Record how the last attempt of a task kind ended
    pub async fn record_task_finished(&self, kind: TaskKind, status: TaskStatus, message: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE task_outcomes SET status = ?2, message = ?3, finished_at = ?4 WHERE kind = ?1",
            params![kind.as_str(), status.as_str(), message, Utc::now()],
        )?;
        Ok(())
    }

    /// Last outcome of every task kind that has run
    pub async fn task_outcomes(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT kind, status, message, started_at, finished_at FROM task_outcomes ORDER BY kind",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TaskRecord {
                kind: parse_col(row, 0)?,
                status: parse_col(row, 1)?,
                message: row.get(2)?,
                started_at: row.get(3)?,
                finished_at: row.get(4)?,
            })
        })?;

        let mut records = Vec::new();
        for result in rows {
            records.push(result?);
        }
        Ok(records)
    }
}
