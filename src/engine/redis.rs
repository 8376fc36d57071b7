//! Redis Engine
//!
//! Drives cache replication through `redis-cli`.

use tokio::process::Command;

use super::{run_checked, CacheEngine, CacheSource};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::model::SyncStatus;

pub struct RedisCliEngine {
    cli: String,
    host: String,
    port: u16,
    password: Option<String>,
}

impl RedisCliEngine {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            cli: config.cli.clone(),
            host: config.host.clone(),
            port: config.port,
            password: config.password.clone(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.cli);
        cmd.arg("-h").arg(&self.host).arg("-p").arg(self.port.to_string());
        if let Some(password) = &self.password {
            cmd.arg("--no-auth-warning").env("REDISCLI_AUTH", password);
        }
        cmd.args(args);
        cmd
    }

    /// redis-cli exits 0 on server-side errors, so the reply is checked too
    async fn run(&self, args: &[&str]) -> Result<String> {
        let label = format!("redis-cli {}", args.first().copied().unwrap_or_default());
        let reply = run_checked(self.command(args), &label).await?;
        check_reply(&label, reply)
    }
}

#[async_trait::async_trait]
impl CacheEngine for RedisCliEngine {
    async fn replicate_from(&self, source: &CacheSource) -> Result<()> {
        tracing::info!("Configuring cache replica of {}:{}", source.host, source.port);
        if let Some(password) = source.password.as_deref().filter(|p| !p.is_empty()) {
            self.run(&["CONFIG", "SET", "masterauth", password]).await?;
        }
        let port = source.port.to_string();
        self.run(&["REPLICAOF", &source.host, &port]).await?;
        Ok(())
    }

    async fn stop_replication(&self) -> Result<()> {
        tracing::info!("Detaching cache from its primary");
        self.run(&["REPLICAOF", "NO", "ONE"]).await?;
        Ok(())
    }

    async fn link_status(&self) -> Result<SyncStatus> {
        let info = self.run(&["INFO", "replication"]).await?;
        Ok(parse_link_status(&info))
    }
}

fn check_reply(label: &str, reply: String) -> Result<String> {
    if reply.starts_with("ERR") || reply.starts_with("NOAUTH") || reply.starts_with("(error)") {
        return Err(Error::ExternalOperation(format!("{}: {}", label, reply)));
    }
    Ok(reply)
}

/// Classify `INFO replication` output
pub fn parse_link_status(info: &str) -> SyncStatus {
    let field = |name: &str| {
        info.lines()
            .filter_map(|line| line.trim().split_once(':'))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.trim().to_string())
    };

    match field("role").as_deref() {
        Some("master") => SyncStatus::Online,
        Some("slave") => {
            if field("master_sync_in_progress").as_deref() == Some("1") {
                SyncStatus::Syncing
            } else if field("master_link_status").as_deref() == Some("up") {
                SyncStatus::Online
            } else {
                SyncStatus::Error
            }
        }
        _ => SyncStatus::Error,
    }
}
