//! Supervised Background Tasks
//!
//! Long-running side effects (replication bootstrap, promotion, peer
//! notification) run on a worker instead of detached spawns. Every
//! attempt is persisted as the task kind's last outcome and broadcast
//! to subscribers.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::{Error, Result};
use crate::state::ClusterStore;

/// Future executed by the supervisor; the `Ok` string is the outcome message
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// Kinds of supervised background work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ReplicationBootstrap,
    ReplicationRepoint,
    Promotion,
    NotifyPeers,
    LeaveNotification,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ReplicationBootstrap => "replication_bootstrap",
            TaskKind::ReplicationRepoint => "replication_repoint",
            TaskKind::Promotion => "promotion",
            TaskKind::NotifyPeers => "notify_peers",
            TaskKind::LeaveNotification => "leave_notification",
        }
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "replication_bootstrap" => Ok(TaskKind::ReplicationBootstrap),
            "replication_repoint" => Ok(TaskKind::ReplicationRepoint),
            "promotion" => Ok(TaskKind::Promotion),
            "notify_peers" => Ok(TaskKind::NotifyPeers),
            "leave_notification" => Ok(TaskKind::LeaveNotification),
            other => Err(Error::Store(format!("invalid task kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::Store(format!("invalid task status: {}", other))),
        }
    }
}

/// Persisted last attempt of a task kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Broadcast when a task finishes
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub message: String,
}

struct Job {
    kind: TaskKind,
    future: TaskFuture,
}

/// Handle for submitting background work
#[derive(Clone)]
pub struct TaskSupervisor {
    jobs: mpsc::Sender<Job>,
    outcomes: broadcast::Sender<TaskOutcome>,
    store: Arc<ClusterStore>,
}

impl TaskSupervisor {
    /// Start the worker loop; must be called inside a tokio runtime
    pub fn start(store: Arc<ClusterStore>) -> Self {
        let (jobs, mut job_rx) = mpsc::channel::<Job>(64);
        let (outcomes, _) = broadcast::channel(64);

        let worker_store = Arc::clone(&store);
        let worker_outcomes = outcomes.clone();
        tokio::spawn(async move {
            tracing::debug!("Task supervisor started");
            while let Some(job) = job_rx.recv().await {
                let store = Arc::clone(&worker_store);
                let outcomes = worker_outcomes.clone();
                tokio::spawn(async move {
                    let kind = job.kind;
                    let (status, message) = match tokio::spawn(job.future).await {
                        Ok(Ok(message)) => {
                            tracing::info!("Task {} succeeded: {}", kind.as_str(), message);
                            (TaskStatus::Succeeded, message)
                        }
                        Ok(Err(e)) => {
                            tracing::error!("Task {} failed: {}", kind.as_str(), e);
                            (TaskStatus::Failed, e.to_string())
                        }
                        Err(e) => {
                            tracing::error!("Task {} aborted: {}", kind.as_str(), e);
                            (TaskStatus::Failed, format!("task aborted: {}", e))
                        }
                    };

                    if let Err(e) = store.record_task_finished(kind, status, &message).await {
                        tracing::warn!("Failed to record outcome of {}: {}", kind.as_str(), e);
                    }
                    let _ = outcomes.send(TaskOutcome { kind, status, message });
                });
            }
            tracing::debug!("Task supervisor stopped");
        });

        Self { jobs, outcomes, store }
    }

    /// Submit a task; returns once it is queued, not when it finishes
    pub async fn submit<F>(&self, kind: TaskKind, future: F) -> Result<()>
    where
        F: Future<Output = Result<String>> + Send + 'static,
    {
        self.store.record_task_started(kind).await?;
        self.jobs
            .send(Job {
                kind,
                future: Box::pin(future),
            })
            .await
            .map_err(|_| Error::Internal("task supervisor is not running".into()))
    }

    /// Subscribe to task completions
    pub fn subscribe(&self) -> broadcast::Receiver<TaskOutcome> {
        self.outcomes.subscribe()
    }

    /// Last recorded outcome of every task kind
    pub async fn outcomes(&self) -> Result<Vec<TaskRecord>> {
        self.store.task_outcomes().await
    }
}

/// Wait for the next outcome of a given kind
pub async fn wait_for(
    rx: &mut broadcast::Receiver<TaskOutcome>,
    kind: TaskKind,
) -> Option<TaskOutcome> {
    loop {
        match rx.recv().await {
            Ok(outcome) if outcome.kind == kind => return Some(outcome),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_and_failure_are_recorded() {
        let store = Arc::new(ClusterStore::in_memory().unwrap());
        let supervisor = TaskSupervisor::start(Arc::clone(&store));
        let mut rx = supervisor.subscribe();

        supervisor
            .submit(TaskKind::NotifyPeers, async { Ok("notified 2 peers".to_string()) })
            .await
            .unwrap();
        let outcome = wait_for(&mut rx, TaskKind::NotifyPeers).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Succeeded);

        supervisor
            .submit(TaskKind::ReplicationBootstrap, async {
                Err(Error::ExternalOperation("pg_basebackup exited with 1".into()))
            })
            .await
            .unwrap();
        let outcome = wait_for(&mut rx, TaskKind::ReplicationBootstrap).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(outcome.message.contains("pg_basebackup"));

        let records = supervisor.outcomes().await.unwrap();
        assert_eq!(records.len(), 2);
        let bootstrap = records
            .iter()
            .find(|r| r.kind == TaskKind::ReplicationBootstrap)
            .unwrap();
        assert_eq!(bootstrap.status, TaskStatus::Failed);
        assert!(bootstrap.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let store = Arc::new(ClusterStore::in_memory().unwrap());
        let supervisor = TaskSupervisor::start(store);
        let mut rx = supervisor.subscribe();

        supervisor
            .submit(TaskKind::Promotion, async {
                let explode = true;
                if explode {
                    panic!("boom");
                }
                Ok(String::new())
            })
            .await
            .unwrap();

        let outcome = wait_for(&mut rx, TaskKind::Promotion).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(outcome.message.contains("aborted"));
    }
}
