//! Node Identity Resolver
//!
//! Derives the stable identity a node registers and authenticates with:
//! hardware id, reachable IP, server name and running software version.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::AppConfig;
use crate::error::Result;

/// Machine id sources, in lookup order
const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Length of the hex-encoded hardware id
const HARDWARE_ID_LEN: usize = 32;

/// Resolved identity of the local node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeIdentity {
    pub hardware_id: String,
    pub server_ip: String,
    pub server_name: String,
    pub version_file: PathBuf,
}

impl NodeIdentity {
    /// Resolve the identity from configuration and the host system
    pub fn resolve(config: &AppConfig) -> Result<Self> {
        let hardware_id = resolve_hardware_id(&config.node.data_dir)?;
        let server_ip = config
            .node
            .advertise_ip
            .clone()
            .unwrap_or_else(|| detect_local_ip().to_string());
        let server_name = config.node.server_name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".into())
        });

        tracing::debug!(
            hardware_id = %hardware_id,
            server_ip = %server_ip,
            server_name = %server_name,
            "Resolved node identity"
        );

        Ok(Self {
            hardware_id,
            server_ip,
            server_name,
            version_file: config.node.version_file.clone(),
        })
    }

    /// Currently running software version (re-read on every call)
    pub fn version(&self) -> String {
        read_version_marker(&self.version_file)
    }
}

/// Hash a machine id into a fixed-length hardware id
pub fn hardware_id_from_machine_id(machine_id: &str) -> String {
    let digest = Sha256::digest(machine_id.trim().as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(HARDWARE_ID_LEN);
    id
}

/// Hardware id from the OS machine id, else a generated id persisted in `data_dir`
pub fn resolve_hardware_id(data_dir: &Path) -> Result<String> {
    for path in MACHINE_ID_PATHS {
        if let Ok(content) = std::fs::read_to_string(path) {
            if !content.trim().is_empty() {
                return Ok(hardware_id_from_machine_id(&content));
            }
        }
    }
    persisted_hardware_id(data_dir)
}

fn persisted_hardware_id(data_dir: &Path) -> Result<String> {
    let path = data_dir.join("hardware_id");
    if let Ok(content) = std::fs::read_to_string(&path) {
        let id = content.trim();
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }

    std::fs::create_dir_all(data_dir)?;
    let id = hardware_id_from_machine_id(&uuid::Uuid::new_v4().to_string());
    std::fs::write(&path, &id)?;
    tracing::info!("Generated hardware id, saved to {:?}", path);
    Ok(id)
}

/// Address of the interface used for outbound traffic
///
/// Connecting a UDP socket selects a route without sending anything.
pub fn detect_local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            tracing::debug!("Local IP detection failed: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Read the version marker file; empty when missing
pub fn read_version_marker(path: &Path) -> String {
    std::fs::read_to_string(path)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// Whether a host name only makes sense inside this machine's private network
///
/// Loopback, unspecified and link-local addresses, `localhost`, and bare
/// single-label names (container service aliases) are not reachable from
/// other cluster members.
pub fn is_local_only_host(host: &str) -> bool {
    let host = host.trim();
    if host.is_empty() || host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_unspecified() || ip.is_link_local(),
        Ok(IpAddr::V6(ip)) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => !host.contains('.'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hardware_id_is_stable_and_fixed_length() {
        let a = hardware_id_from_machine_id("4c4c4544-0042-3510-8051-b4c04f4b4d32\n");
        let b = hardware_id_from_machine_id("4c4c4544-0042-3510-8051-b4c04f4b4d32");
        assert_eq!(a, b);
        assert_eq!(a.len(), HARDWARE_ID_LEN);
        assert_ne!(a, hardware_id_from_machine_id("another-machine"));
    }

    #[test]
    fn test_persisted_hardware_id_survives_restart() {
        let dir = tempdir().unwrap();
        let first = persisted_hardware_id(dir.path()).unwrap();
        let second = persisted_hardware_id(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), HARDWARE_ID_LEN);
    }

    #[test]
    fn test_version_marker() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("VERSION");
        assert_eq!(read_version_marker(&path), "");
        std::fs::write(&path, "4.2.1\n").unwrap();
        assert_eq!(read_version_marker(&path), "4.2.1");
    }

    #[test]
    fn test_local_only_hosts() {
        assert!(is_local_only_host("localhost"));
        assert!(is_local_only_host("127.0.0.1"));
        assert!(is_local_only_host("0.0.0.0"));
        assert!(is_local_only_host("::1"));
        assert!(is_local_only_host("postgres"));
        assert!(is_local_only_host(""));
        assert!(!is_local_only_host("10.0.0.5"));
        assert!(!is_local_only_host("db.isp.example"));
    }

    #[test]
    fn test_resolve_uses_configured_values() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.node.data_dir = dir.path().to_path_buf();
        config.node.advertise_ip = Some("192.0.2.10".into());
        config.node.server_name = Some("core-2".into());
        config.node.version_file = dir.path().join("VERSION");

        let identity = NodeIdentity::resolve(&config).unwrap();
        assert_eq!(identity.server_ip, "192.0.2.10");
        assert_eq!(identity.server_name, "core-2");
        assert_eq!(identity.version(), "");
    }
}
