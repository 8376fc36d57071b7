//! PostgreSQL Engine
//!
//! Role checks and promotion go through SQL; building a standby is
//! delegated to the configured standby command.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tokio::process::Command;

use super::{run_checked, DatabaseEngine, StandbyPlan};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Seconds `pg_promote` waits for the promotion to finish
const PROMOTE_WAIT_SECS: i32 = 60;

/// Lag of a standby in seconds
///
/// A standby that has replayed everything it received is current, however
/// old its last replayed transaction is.
fn standby_lag(in_recovery: bool, caught_up: bool, replay_age: Option<f64>) -> f64 {
    if !in_recovery || caught_up {
        return 0.0;
    }
    replay_age.unwrap_or(0.0).max(0.0)
}

pub struct PostgresEngine {
    pool: PgPool,
    standby_command: String,
}

impl PostgresEngine {
    /// Create an engine; connections are opened on first use
    pub fn new(config: &DatabaseConfig) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.name);

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_lazy_with(options);

        Self {
            pool,
            standby_command: config.standby_command.clone(),
        }
    }
}

#[async_trait::async_trait]
impl DatabaseEngine for PostgresEngine {
    async fn is_in_recovery(&self) -> Result<bool> {
        let in_recovery: bool = sqlx::query_scalar("SELECT pg_is_in_recovery()")
            .fetch_one(&self.pool)
            .await?;
        Ok(in_recovery)
    }

    async fn promote(&self) -> Result<()> {
        tracing::info!("Issuing pg_promote()");
        let promoted: bool = sqlx::query_scalar("SELECT pg_promote(true, $1)")
            .bind(PROMOTE_WAIT_SECS)
            .fetch_one(&self.pool)
            .await?;

        if !promoted {
            return Err(Error::ExternalOperation(format!(
                "pg_promote did not complete within {}s",
                PROMOTE_WAIT_SECS
            )));
        }
        Ok(())
    }

    async fn system_identifier(&self) -> Result<String> {
        let id: String = sqlx::query_scalar("SELECT system_identifier::text FROM pg_control_system()")
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn replication_lag_secs(&self) -> Result<f64> {
        let (in_recovery, caught_up, replay_age): (bool, bool, Option<f64>) = sqlx::query_as(
            r#"
            SELECT
                pg_is_in_recovery(),
                pg_last_wal_receive_lsn() IS NOT DISTINCT FROM pg_last_wal_replay_lsn(),
                EXTRACT(EPOCH FROM now() - pg_last_xact_replay_timestamp())::float8
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(standby_lag(in_recovery, caught_up, replay_age))
    }

    async fn configure_standby(&self, plan: &StandbyPlan) -> Result<String> {
        tracing::info!(
            "Configuring database standby of {}:{} using slot {}",
            plan.primary_host,
            plan.primary_port,
            plan.slot_name
        );

        let mut cmd = Command::new(&self.standby_command);
        cmd.env("PRIMARY_HOST", &plan.primary_host)
            .env("PRIMARY_PORT", plan.primary_port.to_string())
            .env("REPL_USER", &plan.replication_user)
            .env("REPL_PASSWORD", &plan.replication_password)
            .env("SLOT_NAME", &plan.slot_name)
            .env("DB_NAME", &plan.database);

        run_checked(cmd, "standby setup").await
    }
}
