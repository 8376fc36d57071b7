//! Connectivity Probe
//!
//! Raw TCP reachability checks, no authentication involved.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Ports checked on a candidate main
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePorts {
    pub api: u16,
    pub db: u16,
    pub redis: u16,
}

/// Per-service reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub api_ok: bool,
    pub db_ok: bool,
    pub redis_ok: bool,
}

/// Whether a TCP connection to `host:port` opens within `limit`
pub async fn probe_port(host: &str, port: u16, limit: Duration) -> bool {
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!("Probe {}:{} failed: {}", host, port, e);
            false
        }
        Err(_) => {
            tracing::debug!("Probe {}:{} timed out", host, port);
            false
        }
    }
}

/// Check the application, database and cache ports of `host` concurrently
pub async fn test_connection(host: &str, ports: ProbePorts, limit: Duration) -> ConnectionReport {
    let (api_ok, db_ok, redis_ok) = tokio::join!(
        probe_port(host, ports.api, limit),
        probe_port(host, ports.db, limit),
        probe_port(host, ports.redis, limit),
    );

    tracing::info!(
        "Connection test to {}: api={} db={} redis={}",
        host,
        api_ok,
        db_ok,
        redis_ok
    );

    ConnectionReport { api_ok, db_ok, redis_ok }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_reports_each_service() {
        let api = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let db = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let report = test_connection(
            "127.0.0.1",
            ProbePorts {
                api: api.local_addr().unwrap().port(),
                db: db.local_addr().unwrap().port(),
                redis: closed_port(),
            },
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(
            report,
            ConnectionReport {
                api_ok: true,
                db_ok: true,
                redis_ok: false
            }
        );
    }
}
