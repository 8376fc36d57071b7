//! Peer Client
//!
//! JSON-over-HTTP client for the cluster endpoints of other nodes.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::peer_base_url;
use crate::error::{Error, Result};
use crate::model::{
    Ack, HeartbeatRequest, HeartbeatResponse, JoinRequest, JoinResponse, NodeLeftRequest,
    NotifyRequest, PromoteRequest,
};

/// Timeout for calls that must not hold up a loop or fan-out
const SHORT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Error body rendered by the API layer
#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Client for peer API calls
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    port: u16,
    /// Timeout for join and promote calls
    timeout: Duration,
}

impl PeerClient {
    /// Create a client addressing peers on `port`
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout.min(SHORT_CALL_TIMEOUT))
            .build()?;
        Ok(Self { http, port, timeout })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Register with the main
    pub async fn join(&self, main_ip: &str, request: &JoinRequest) -> Result<JoinResponse> {
        self.post(main_ip, "/cluster/join", request, self.timeout).await
    }

    /// Report health to the main
    pub async fn heartbeat(&self, main_ip: &str, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.post(main_ip, "/cluster/heartbeat", request, SHORT_CALL_TIMEOUT).await
    }

    /// Push a notification to a member
    pub async fn notify(&self, peer_ip: &str, request: &NotifyRequest) -> Result<Ack> {
        self.post(peer_ip, "/cluster/notify", request, SHORT_CALL_TIMEOUT).await
    }

    /// Ask a secondary to promote itself
    pub async fn promote(&self, peer_ip: &str, request: &PromoteRequest) -> Result<Ack> {
        self.post(peer_ip, "/cluster/promote", request, self.timeout).await
    }

    /// Tell the main this node is leaving
    pub async fn node_left(&self, main_ip: &str, request: &NodeLeftRequest) -> Result<Ack> {
        self.post(main_ip, "/cluster/node-left", request, SHORT_CALL_TIMEOUT).await
    }

    async fn post<Req, Resp>(&self, host: &str, path: &str, body: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", peer_base_url(host, self.port), path);
        tracing::debug!("POST {}", url);

        let response = self.http.post(&url).timeout(timeout).json(body).send().await?;
        decode(host, response).await
    }
}

/// Decode a peer response, mapping error statuses back onto the taxonomy
async fn decode<T: DeserializeOwned>(host: &str, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let message = response
        .json::<ErrorBody>()
        .await
        .map(|b| b.message)
        .unwrap_or_else(|_| status.to_string());

    Err(match status.as_u16() {
        400 => Error::Conflict(format!("{} rejected the request: {}", host, message)),
        401 => Error::Unauthorized,
        403 => Error::Forbidden(message),
        404 => Error::NotFound(message),
        _ => Error::ExternalOperation(format!("{} returned {}: {}", host, status, message)),
    })
}
