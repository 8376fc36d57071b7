//! ISP Cluster - High-availability control plane for ISP core servers
//!
//! Turns a set of standalone servers, each running a relational database
//! and an in-memory cache, into a cluster with one main and up to four
//! replicas.
//!
//! # Architecture
//!
//! Every node runs the same daemon with a local SQLite state store and an
//! HTTP API. The main holds the authoritative node registry; members
//! report health to it through heartbeats and mirror its roster. Failover
//! is operator-driven: a secondary is promoted on request and the new
//! main notifies its peers.
//!
//! # Features
//!
//! - Cluster creation and the shared-secret join handshake
//! - Streaming database replication and cache replication bootstrap
//! - Heartbeat health monitoring with stale node detection
//! - Resumable promotion with a persisted phase marker
//! - Supervised background tasks with recorded outcomes

pub mod api;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod model;
pub mod network;
pub mod state;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

pub use config::AppConfig;
pub use error::{Error, Result};
