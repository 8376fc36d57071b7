//! Storage Engine Collaborators
//!
//! The cluster control plane drives the database and cache replication
//! engines but does not implement them. These traits are the seam: the
//! production implementations issue SQL or shell out, tests use mocks.

mod command;
mod postgres;
mod redis;

pub use command::run_checked;
pub use postgres::PostgresEngine;
pub use redis::{parse_link_status, RedisCliEngine};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::Result;
use crate::model::SyncStatus;

/// Everything a standby needs to stream from a primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandbyPlan {
    pub primary_host: String,
    pub primary_port: u16,
    pub replication_user: String,
    pub replication_password: String,
    pub slot_name: String,
    pub database: String,
}

/// Where a cache replica should follow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSource {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

/// Control surface of the replicated database
#[async_trait::async_trait]
pub trait DatabaseEngine: Send + Sync {
    /// Whether the database is a read-only standby
    async fn is_in_recovery(&self) -> Result<bool>;

    /// Ask a standby to become primary
    async fn promote(&self) -> Result<()>;

    /// Stable identifier of the underlying database cluster
    async fn system_identifier(&self) -> Result<String>;

    /// Seconds since the last replayed transaction (0 on a primary)
    async fn replication_lag_secs(&self) -> Result<f64>;

    /// (Re)build this node as a standby following `plan`
    async fn configure_standby(&self, plan: &StandbyPlan) -> Result<String>;
}

/// Control surface of the replicated cache
#[async_trait::async_trait]
pub trait CacheEngine: Send + Sync {
    /// Make this cache a replica of `source`
    async fn replicate_from(&self, source: &CacheSource) -> Result<()>;

    /// Detach from any primary and serve independently
    async fn stop_replication(&self) -> Result<()>;

    /// Health of the replication link as seen locally
    async fn link_status(&self) -> Result<SyncStatus>;
}

/// The engine pair a node controls
#[derive(Clone)]
pub struct Engines {
    pub database: Arc<dyn DatabaseEngine>,
    pub cache: Arc<dyn CacheEngine>,
}

impl Engines {
    /// Production engines for the configured database and cache
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            database: Arc::new(PostgresEngine::new(&config.database)),
            cache: Arc::new(RedisCliEngine::new(&config.cache)),
        }
    }
}
