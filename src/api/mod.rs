//! HTTP API Module
//!
//! Operator endpoints and the node-to-node protocol.

mod http;

pub use http::{
    ApiError, AppState, ErrorResponse, FailoverRequest, HealthResponse, HttpServer,
    TestConnectionResponse,
};
