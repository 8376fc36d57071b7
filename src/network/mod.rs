//! Network Module
//!
//! Outbound calls to peer nodes and connectivity probes.

mod client;
mod probe;

pub use client::PeerClient;
pub use probe::{probe_port, test_connection, ConnectionReport, ProbePorts};

/// Base URL of a peer's API, bracketing IPv6 literals
pub fn peer_base_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("http://[{}]:{}", host, port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_base_url() {
        assert_eq!(peer_base_url("10.0.0.1", 8090), "http://10.0.0.1:8090");
        assert_eq!(peer_base_url("fd00::2", 8090), "http://[fd00::2]:8090");
        assert_eq!(peer_base_url("core-1.isp.example", 80), "http://core-1.isp.example:80");
    }
}
