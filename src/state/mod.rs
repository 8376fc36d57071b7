//! State Management Module
//!
//! Persistent cluster state for this node: the local configuration row,
//! the node registry, the event log and the promotion marker.

mod store;
mod registry;
mod events;
mod config_service;
mod task_log;

pub use store::ClusterStore;
pub use registry::ClusterSummary;
pub use config_service::ConfigService;
