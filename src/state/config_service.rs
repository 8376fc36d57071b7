//! Cluster Configuration Service
//!
//! Single read/write accessor for the local ClusterConfig row with an
//! in-process cache that is replaced on every write.

use std::sync::Arc;
use tokio::sync::RwLock;

use super::ClusterStore;
use crate::error::{Error, Result};
use crate::model::{ClusterConfig, ServerRole};

/// Cached accessor for the local cluster configuration
pub struct ConfigService {
    store: Arc<ClusterStore>,
    /// `None` until first load; `Some(None)` means "no config row"
    cache: RwLock<Option<Option<ClusterConfig>>>,
}

impl ConfigService {
    pub fn new(store: Arc<ClusterStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
        }
    }

    /// Current configuration, if this node has one
    pub async fn get(&self) -> Result<Option<ClusterConfig>> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return Ok(cached.clone());
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref() {
            return Ok(cached.clone());
        }
        let loaded = self.store.load_config().await?;
        *cache = Some(loaded.clone());
        Ok(loaded)
    }

    /// Configuration of a node that belongs to a cluster
    pub async fn require(&self) -> Result<ClusterConfig> {
        match self.get().await? {
            Some(config) if config.in_cluster() => Ok(config),
            _ => Err(Error::NotConfigured),
        }
    }

    /// Configuration of a node that must currently hold `role`
    pub async fn require_role(&self, role: ServerRole) -> Result<ClusterConfig> {
        let config = self.require().await?;
        if config.server_role != role {
            return Err(Error::role_mismatch(role, config.server_role));
        }
        Ok(config)
    }

    /// Persist a configuration and refresh the cache
    pub async fn save(&self, config: &ClusterConfig) -> Result<()> {
        let mut cache = self.cache.write().await;
        self.store.save_config(config).await?;
        *cache = Some(Some(config.clone()));
        Ok(())
    }

    /// Read-modify-write the configuration under the cache lock
    pub async fn update<F>(&self, f: F) -> Result<ClusterConfig>
    where
        F: FnOnce(&mut ClusterConfig),
    {
        let mut cache = self.cache.write().await;
        let mut config = match cache.as_ref() {
            Some(cached) => cached.clone(),
            None => self.store.load_config().await?,
        }
        .ok_or(Error::NotConfigured)?;

        f(&mut config);
        self.store.save_config(&config).await?;
        *cache = Some(Some(config.clone()));
        Ok(config)
    }

    /// Reset to standalone, clearing every cluster field
    pub async fn reset(&self) -> Result<ClusterConfig> {
        let mut cache = self.cache.write().await;
        let previous = match cache.as_ref() {
            Some(cached) => cached.clone(),
            None => self.store.load_config().await?,
        };

        let (hardware_id, server_name, server_ip, database_id) = previous
            .map(|c| (c.hardware_id, c.server_name, c.server_ip, c.database_id))
            .unwrap_or_default();

        let config = ClusterConfig {
            cluster_id: String::new(),
            cluster_secret: String::new(),
            server_role: ServerRole::Standalone,
            server_name,
            server_ip,
            main_server_ip: String::new(),
            hardware_id,
            database_id,
            is_active: false,
            db_replication_enabled: false,
            db_replication_status: None,
            redis_replication_enabled: false,
            redis_replication_status: None,
            last_heartbeat: None,
            last_sync_time: None,
        };
        self.store.save_config(&config).await?;
        *cache = Some(Some(config.clone()));
        Ok(config)
    }

    /// Drop the cache so the next read goes to the store
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
