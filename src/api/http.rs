//! HTTP API Server
//!
//! Operator endpoints and the peer protocol share one listener. Peer
//! routes authenticate with the cluster secret in the body; operator
//! routes only answer loopback callers or a configured operator token.
//! Every handler delegates to `ClusterService`; errors render as
//! `{"success": false, "message": ...}` with the error's status code.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, ConnectInfo, FromRequest, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cluster::{
    ClusterService, ClusterStatus, PromotionReport, ReplicationStatus, SetupMainRequest,
    SetupMainResponse, SetupSecondaryRequest, SetupSecondaryResponse, TestConnectionRequest,
};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::model::{
    Ack, HeartbeatRequest, HeartbeatResponse, JoinRequest, JoinResponse, NodeLeftRequest,
    NotifyRequest, PromoteRequest, ServerRole,
};
use crate::network::ConnectionReport;

/// Shared application state
pub struct AppState {
    pub service: Arc<ClusterService>,
    pub operator_token: Option<String>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, service: Arc<ClusterService>) -> Self {
        let operator_token = config.operator_token.clone().filter(|t| !t.is_empty());
        Self {
            config,
            state: Arc::new(AppState {
                service,
                operator_token,
            }),
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        let router = create_router(Arc::clone(&self.state));
        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Bind and serve until the task is dropped
    pub async fn start(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

fn create_router(state: Arc<AppState>) -> Router {
    let operator = Router::new()
        // Status
        .route("/cluster/status", get(handle_status))
        .route("/cluster/replication-status", get(handle_replication_status))
        // Operator actions
        .route("/cluster/setup-main", post(handle_setup_main))
        .route("/cluster/setup-secondary", post(handle_setup_secondary))
        .route("/cluster/test-connection", post(handle_test_connection))
        .route("/cluster/leave", post(handle_leave))
        .route("/cluster/nodes/:node_id", delete(handle_remove_node))
        .route("/cluster/failover", post(handle_failover))
        .route("/cluster/promote-to-main", post(handle_promote_to_main))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_operator));

    Router::new()
        .route("/health", get(handle_health))
        // Peer protocol
        .route("/cluster/join", post(handle_join))
        .route("/cluster/heartbeat", post(handle_heartbeat))
        .route("/cluster/promote", post(handle_promote))
        .route("/cluster/notify", post(handle_notify))
        .route("/cluster/node-left", post(handle_node_left))
        .merge(operator)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Admit loopback callers, or remote callers presenting the operator token
async fn require_operator(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    if peer.is_some_and(|addr| is_loopback(addr.ip()))
        || has_operator_token(state.operator_token.as_deref(), request.headers())
    {
        return next.run(request).await;
    }

    tracing::warn!(
        "Rejected operator request {} from {}",
        request.uri().path(),
        peer.map(|a| a.to_string()).unwrap_or_else(|| "unknown peer".into())
    );
    ApiError(Error::Forbidden(
        "operator endpoints require a local caller or a valid operator token".into(),
    ))
    .into_response()
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(v6.is_loopback(), |v4| v4.is_loopback()),
    }
}

fn has_operator_token(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == expected)
}

/// JSON body extractor whose rejections use the API error shape
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(rejection.into()),
        }
    }
}

// ============ Request/Response Types ============

/// Failover request
#[derive(Debug, Deserialize, Serialize)]
pub struct FailoverRequest {
    pub target_node_id: i64,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub server_role: ServerRole,
    pub hardware_id: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TestConnectionResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: ConnectionReport,
    pub message: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

/// Error wrapper rendered as a JSON failure body
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::InvalidRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self.0);
        }

        let body = ErrorResponse {
            success: false,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let service = &state.service;
    let server_role = service
        .config()
        .get()
        .await?
        .map(|c| c.server_role)
        .unwrap_or(ServerRole::Standalone);

    Ok(Json(HealthResponse {
        healthy: true,
        server_role,
        hardware_id: service.identity().hardware_id.clone(),
        version: service.identity().version(),
    }))
}

async fn handle_status(State(state): State<Arc<AppState>>) -> ApiResult<ClusterStatus> {
    Ok(Json(state.service.status().await?))
}

async fn handle_replication_status(State(state): State<Arc<AppState>>) -> ApiResult<ReplicationStatus> {
    Ok(Json(state.service.replication_status().await?))
}

async fn handle_setup_main(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<SetupMainRequest>,
) -> ApiResult<SetupMainResponse> {
    Ok(Json(state.service.setup_main(req).await?))
}

async fn handle_setup_secondary(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<SetupSecondaryRequest>,
) -> ApiResult<SetupSecondaryResponse> {
    Ok(Json(state.service.setup_secondary(req).await?))
}

async fn handle_test_connection(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<TestConnectionRequest>,
) -> ApiResult<TestConnectionResponse> {
    let report = state.service.test_connection(&req).await?;
    let message = if report.api_ok && report.db_ok && report.redis_ok {
        format!("{} is reachable", req.main_server_ip.trim())
    } else {
        format!("{} is not fully reachable", req.main_server_ip.trim())
    };

    Ok(Json(TestConnectionResponse {
        success: true,
        report,
        message,
    }))
}

async fn handle_leave(State(state): State<Arc<AppState>>) -> ApiResult<Ack> {
    Ok(Json(state.service.leave_cluster().await?))
}

async fn handle_remove_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<i64>,
) -> ApiResult<Ack> {
    Ok(Json(state.service.remove_node(node_id).await?))
}

async fn handle_failover(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<FailoverRequest>,
) -> ApiResult<Ack> {
    Ok(Json(state.service.manual_failover(req.target_node_id).await?))
}

async fn handle_promote_to_main(State(state): State<Arc<AppState>>) -> ApiResult<PromotionReport> {
    Ok(Json(state.service.promote_to_main().await?))
}

async fn handle_join(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<JoinRequest>,
) -> ApiResult<JoinResponse> {
    Ok(Json(state.service.join(req).await?))
}

async fn handle_heartbeat(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<HeartbeatRequest>,
) -> ApiResult<HeartbeatResponse> {
    Ok(Json(state.service.heartbeat(req).await?))
}

async fn handle_promote(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<PromoteRequest>,
) -> ApiResult<Ack> {
    Ok(Json(state.service.handle_promote(req).await?))
}

async fn handle_notify(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<NotifyRequest>,
) -> ApiResult<Ack> {
    Ok(Json(state.service.handle_notify(req).await?))
}

async fn handle_node_left(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<NodeLeftRequest>,
) -> ApiResult<Ack> {
    Ok(Json(state.service.node_left(req).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterConfig, NodeStatus};
    use crate::tasks::{wait_for, TaskKind, TaskStatus};
    use crate::testing::{closed_port, main_config, Harness, MockDatabase, CLUSTER_ID, MAIN_HW, SECRET};
    use axum::body::Body;
    use axum::http::Method;
    use tower::ServiceExt;

    const LOCAL: ([u8; 4], u16) = ([127, 0, 0, 1], 41000);
    const REMOTE: ([u8; 4], u16) = ([203, 0, 113, 9], 41000);

    fn router(h: &Harness) -> Router {
        HttpServer::new(ApiConfig::default(), Arc::clone(&h.service)).router()
    }

    async fn call(router: Router, method: Method, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        call_from(router, LOCAL.into(), None, method, uri, body.to_string()).await
    }

    async fn call_from(
        router: Router,
        peer: SocketAddr,
        token: Option<&str>,
        method: Method,
        uri: &str,
        body: String,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let mut request = builder.body(Body::from(body)).unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_standalone_status() {
        let h = Harness::new(MockDatabase::primary()).await;

        let (status, body) = call(router(&h), Method::GET, "/health", serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server_role"], "standalone");

        let (status, body) = call(router(&h), Method::GET, "/cluster/status", serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server_role"], "standalone");
        assert_eq!(body["total_nodes"], 0);
    }

    #[tokio::test]
    async fn test_setup_main_over_http() {
        let h = Harness::new(MockDatabase::primary()).await;

        let (status, body) = call(
            router(&h),
            Method::POST,
            "/cluster/setup-main",
            serde_json::json!({ "server_name": "edge-main" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["cluster_secret"].as_str().unwrap().len(), 64);

        let (status, body) = call(router(&h), Method::POST, "/cluster/setup-main", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let h = Harness::main().await;

        let (status, body) = call(
            router(&h),
            Method::POST,
            "/cluster/join",
            serde_json::json!({
                "cluster_secret": "wrong",
                "hardware_id": "hw-x",
                "server_name": "x",
                "server_ip": "10.0.0.9"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let main = h.store.find_main_node(CLUSTER_ID).await.unwrap().unwrap();
        let uri = format!("/cluster/nodes/{}", main.id);
        let (status, _) = call(router(&h), Method::DELETE, &uri, serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(router(&h), Method::DELETE, "/cluster/nodes/999", serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(router(&h), Method::POST, "/cluster/promote-to-main", serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_operator_routes_refuse_remote_callers() {
        let h = Harness::main().await;

        let (status, body) = call_from(
            router(&h),
            REMOTE.into(),
            None,
            Method::GET,
            "/cluster/status",
            String::new(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["success"], false);
        assert!(!body.to_string().contains(SECRET));

        let (status, body) = call_from(router(&h), REMOTE.into(), None, Method::GET, "/health", String::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server_role"], "main");

        // Peer routes stay reachable and authenticate with the secret
        let join = serde_json::json!({
            "cluster_secret": "wrong",
            "hardware_id": "hw-x",
            "server_name": "x",
            "server_ip": "10.0.0.9"
        });
        let (status, _) = call_from(router(&h), REMOTE.into(), None, Method::POST, "/cluster/join", join.to_string()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let secondary = Harness::secondary().await;
        let (status, _) = call_from(
            router(&secondary),
            REMOTE.into(),
            None,
            Method::POST,
            "/cluster/promote-to-main",
            "{}".into(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(secondary.database.promote_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(
            secondary.service.config().require().await.unwrap().server_role,
            ServerRole::Secondary
        );
    }

    #[tokio::test]
    async fn test_operator_token_admits_remote_callers() {
        let h = Harness::main().await;
        let config = ApiConfig {
            operator_token: Some("op-token".into()),
            ..ApiConfig::default()
        };
        let router = || HttpServer::new(config.clone(), Arc::clone(&h.service)).router();

        let (status, _) = call_from(
            router(),
            REMOTE.into(),
            Some("guess"),
            Method::GET,
            "/cluster/status",
            String::new(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call_from(
            router(),
            REMOTE.into(),
            Some("op-token"),
            Method::GET,
            "/cluster/status",
            String::new(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cluster_secret"], SECRET);
    }

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(is_loopback("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_loopback("::ffff:10.0.0.1".parse().unwrap()));
        assert!(!is_loopback("10.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_malformed_body_uses_error_shape() {
        let h = Harness::main().await;

        let (status, body) = call_from(
            router(&h),
            LOCAL.into(),
            None,
            Method::POST,
            "/cluster/heartbeat",
            "{not json".into(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().starts_with("Invalid request"));

        let (status, body) = call(router(&h), Method::POST, "/cluster/failover", serde_json::json!({ "target": 3 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_failover_then_remote_promote() {
        let h = Harness::secondary().await;
        let mut outcomes = h.service.tasks().subscribe();

        let (status, body) = call(
            router(&h),
            Method::POST,
            "/cluster/promote",
            serde_json::json!({
                "cluster_secret": SECRET,
                "current_main": "10.0.0.1",
                "cluster_id": CLUSTER_ID,
                "event": "manual_failover"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Promotion initiated");

        let outcome = wait_for(&mut outcomes, TaskKind::Promotion).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Succeeded);

        let (_, body) = call(router(&h), Method::GET, "/cluster/replication-status", serde_json::Value::Null).await;
        assert_eq!(body["server_role"], "main");
        assert_eq!(body["promotion"]["phase"], "completed");
    }

    #[tokio::test]
    async fn test_secondary_joins_and_heartbeats_over_network() {
        let main = Harness::build(MAIN_HW, "127.0.0.1", "core-1", MockDatabase::primary(), closed_port()).await;
        main.service
            .config()
            .save(&ClusterConfig {
                server_ip: "127.0.0.1".into(),
                main_server_ip: "127.0.0.1".into(),
                ..main_config()
            })
            .await
            .unwrap();
        main.register(MAIN_HW, "127.0.0.1", ServerRole::Main).await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = router(&main);
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        let local = reqwest::get(format!("http://127.0.0.1:{}/cluster/status", port)).await.unwrap();
        assert_eq!(local.status(), reqwest::StatusCode::OK);

        let secondary = Harness::build("hw-joiner", "10.0.0.5", "core-5", MockDatabase::primary(), port).await;
        let mut outcomes = secondary.service.tasks().subscribe();

        let joined = secondary
            .service
            .setup_secondary(SetupSecondaryRequest {
                main_server_ip: "127.0.0.1".into(),
                cluster_secret: SECRET.into(),
                server_name: None,
                server_ip: None,
                server_role: None,
            })
            .await
            .unwrap();
        assert_eq!(joined.cluster_id, CLUSTER_ID);
        assert_eq!(joined.assigned_role, ServerRole::Secondary);

        let outcome = wait_for(&mut outcomes, TaskKind::ReplicationBootstrap).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Succeeded);
        let plans = secondary.database.plans();
        assert_eq!(plans[0].primary_host, "127.0.0.1");

        secondary.service.heartbeat_tick().await.unwrap();

        let on_main = main.store.find_node_by_hardware(CLUSTER_ID, "hw-joiner").await.unwrap().unwrap();
        assert_eq!(on_main.status, NodeStatus::Online);
        assert!(on_main.last_heartbeat.is_some());
        assert_eq!(secondary.store.list_nodes(CLUSTER_ID).await.unwrap().len(), 2);

        let bad = Harness::build("hw-intruder", "10.0.0.6", "core-6", MockDatabase::primary(), port).await;
        let err = bad
            .service
            .setup_secondary(SetupSecondaryRequest {
                main_server_ip: "127.0.0.1".into(),
                cluster_secret: "guess".into(),
                server_name: None,
                server_ip: None,
                server_role: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
        assert!(bad.service.config().get().await.unwrap().map_or(true, |c| !c.in_cluster()));
    }
}
