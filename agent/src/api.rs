//! HTTP API consumed by the controller
//!
//! `/health` is open; every other route needs `Authorization: Bearer <api_key>`.

use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::error::{CommandError, UpdateError};
use crate::gateway::{CommandGateway, CommandResult, CommandSpec};
use crate::host::HostInfo;
use crate::metrics::{collect_metrics, MetricsProbe, MetricsSnapshot};
use crate::update::{UpdateOrchestrator, UpdateOutcome, UpdatePhase, UpdateTrigger};
use crate::version::VersionState;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub gateway: Arc<CommandGateway>,
    pub orchestrator: Arc<UpdateOrchestrator>,
    pub probe: Arc<dyn MetricsProbe>,
    pub host: Arc<HostInfo>,
    pub version: Arc<VersionState>,
}

pub fn router(state: AppState) -> Router {
    // Auth runs as a route layer, before any body extractor.
    let protected = Router::new()
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/execute", post(execute))
        .route("/update", post(update))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight requests
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Agent API listening on http://{addr}");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Agent API stopped");
    Ok(())
}

// ── errors ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Command(CommandError),
    Update(UpdateError),
    InvalidBody { status: StatusCode, detail: String },
    Internal(String),
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        Self::Command(e)
    }
}

impl From<UpdateError> for ApiError {
    fn from(e: UpdateError) -> Self {
        Self::Update(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidBody {
            status: rejection.status(),
            detail: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Unauthorized => {
                let body = json!({
                    "error": "unauthorized",
                    "detail": "missing or invalid bearer token",
                });
                let mut resp = (StatusCode::UNAUTHORIZED, Json(body)).into_response();
                resp.headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                return resp;
            }
            Self::Command(e) => command_error_body(e),
            Self::Update(e) => update_error_body(e),
            Self::InvalidBody { status, detail } => (
                status,
                json!({"error": "invalid_request", "detail": detail}),
            ),
            Self::Internal(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "internal_error", "detail": detail}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

fn command_error_body(e: CommandError) -> (StatusCode, Value) {
    let detail = e.to_string();
    match e {
        CommandError::NotAllowed { allowed, .. } => (
            StatusCode::FORBIDDEN,
            json!({"error": "command_not_allowed", "detail": detail, "allowed_commands": allowed}),
        ),
        CommandError::ArgumentNotAllowed { argument, .. } => (
            StatusCode::FORBIDDEN,
            json!({"error": "argument_not_allowed", "detail": detail, "argument": argument}),
        ),
        CommandError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            json!({"error": "command_not_found", "detail": detail}),
        ),
        CommandError::TimedOut { timeout, .. } => (
            StatusCode::REQUEST_TIMEOUT,
            json!({"error": "command_timed_out", "detail": detail, "timeout_secs": timeout.as_secs()}),
        ),
        CommandError::Spawn { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "command_failed", "detail": detail}),
        ),
    }
}

fn update_error_body(e: UpdateError) -> (StatusCode, Value) {
    match e {
        UpdateError::InProgress => (
            StatusCode::CONFLICT,
            json!({"error": "update_in_progress", "detail": UpdateError::InProgress.to_string()}),
        ),
        UpdateError::CheckFailed(_) => (
            StatusCode::BAD_GATEWAY,
            json!({"error": "update_check_failed", "detail": "version registry unavailable"}),
        ),
        UpdateError::DownloadFailed { version, .. } => (
            StatusCode::BAD_GATEWAY,
            json!({"error": "update_download_failed", "detail": "artifact download failed", "version": version}),
        ),
        UpdateError::VerifyFailed { version, .. } => (
            StatusCode::BAD_GATEWAY,
            json!({"error": "update_verify_failed", "detail": "artifact checksum verification failed", "version": version}),
        ),
        UpdateError::WriteFailed { version, .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "update_write_failed", "detail": "installation failed and was rolled back", "version": version}),
        ),
    }
}

async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    authorize(&state, request.headers())?;
    Ok(next.run(request).await)
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();

    let expected = state.config.api_key.as_bytes();
    if !token.is_empty() && bool::from(token.as_bytes().ct_eq(expected)) {
        Ok(())
    } else {
        warn!("Rejected request with missing or invalid bearer token");
        Err(ApiError::Unauthorized)
    }
}

// ── handlers ──────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "service": "ninode-agent"}))
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    version: String,
    latest_version: Option<String>,
    hostname: String,
    platform: crate::host::PlatformInfo,
    ip_address: String,
    update_phase: UpdatePhase,
    metrics: MetricsSnapshot,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "online",
        version: state.version.current().await,
        latest_version: state.version.latest_known().await,
        hostname: state.host.hostname.clone(),
        platform: state.host.platform.clone(),
        ip_address: state.host.ip_address.clone(),
        update_phase: state.orchestrator.phase().await,
        metrics: collect_metrics(&state.probe).await,
    })
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "metrics": collect_metrics(&state.probe).await }))
}

async fn execute(
    State(state): State<AppState>,
    body: Result<Json<CommandSpec>, JsonRejection>,
) -> Result<Json<CommandResult>, ApiError> {
    let Json(spec) = body?;
    let result = state
        .gateway
        .execute(&spec, state.config.command_timeout())
        .await?;
    Ok(Json(result))
}

async fn update(State(state): State<AppState>) -> Result<Json<UpdateOutcome>, ApiError> {
    // A spawned task keeps running if the caller disconnects mid-update.
    let orchestrator = state.orchestrator.clone();
    let outcome = tokio::spawn(async move { orchestrator.run(UpdateTrigger::Manual).await })
        .await
        .map_err(|e| {
            warn!("Update task aborted: {e}");
            ApiError::Internal("update task aborted".into())
        })??;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArtifactConfig;
    use crate::restart::RestartHandle;
    use crate::test_support::{serve as serve_router, test_config, FixedProbe};
    use tokio_util::sync::CancellationToken;

    async fn agent_with_registry(tag: &str) -> (String, Arc<VersionState>) {
        let tag = tag.to_string();
        let registry = serve_router(Router::new().route(
            "/releases/latest",
            get(move || async move { Json(json!({ "tag_name": tag })) }),
        ))
        .await;

        let mut config = test_config("http://127.0.0.1:1");
        config.update.registry_url = format!("{registry}/releases/latest");
        config.update.artifacts = vec![ArtifactConfig {
            url: "http://127.0.0.1:1/{tag}/ninode-agent".into(),
            path: Some("/nonexistent/ninode/ninode-agent".into()),
        }];
        config.command_timeout_secs = 5;
        let config = Arc::new(config);

        let version = Arc::new(VersionState::new("1.9.0"));
        let orchestrator = UpdateOrchestrator::new(
            &config.update,
            version.clone(),
            RestartHandle::new(CancellationToken::new()),
        )
        .unwrap();

        let state = AppState {
            config,
            gateway: Arc::new(CommandGateway::new()),
            orchestrator: Arc::new(orchestrator),
            probe: Arc::new(FixedProbe),
            host: Arc::new(HostInfo::collect().await),
            version: version.clone(),
        };
        (serve_router(router(state)).await, version)
    }

    async fn agent() -> String {
        agent_with_registry("v1.9.0").await.0
    }

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let url = agent().await;
        let resp = client().get(format!("{url}/health")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"status": "healthy", "service": "ninode-agent"}));
    }

    #[tokio::test]
    async fn test_protected_routes_reject_bad_tokens() {
        let url = agent().await;
        for (method, path) in [
            (reqwest::Method::GET, "/status"),
            (reqwest::Method::GET, "/metrics"),
            (reqwest::Method::POST, "/update"),
        ] {
            let resp = client()
                .request(method.clone(), format!("{url}{path}"))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 401, "{path} without token");
            assert_eq!(resp.headers()["www-authenticate"], "Bearer");

            let resp = client()
                .request(method, format!("{url}{path}"))
                .bearer_auth("wrong-token")
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 401, "{path} with wrong token");
        }

        let resp = client()
            .post(format!("{url}/execute"))
            .json(&json!({"command": "uname"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn test_auth_is_checked_before_body() {
        let url = agent().await;

        let resp = client().post(format!("{url}/execute")).send().await.unwrap();
        assert_eq!(resp.status(), 401, "no token, no body");
        assert_eq!(resp.headers()["www-authenticate"], "Bearer");

        let resp = client()
            .post(format!("{url}/execute"))
            .json(&json!({"cmd": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401, "no token, malformed body");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "unauthorized");
        assert!(!body.to_string().contains("command"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_json_error() {
        let url = agent().await;

        let resp = client()
            .post(format!("{url}/execute"))
            .bearer_auth("test-token")
            .json(&json!({"cmd": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 422);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "invalid_request");
        assert!(body["detail"].is_string());

        let resp = client()
            .post(format!("{url}/execute"))
            .bearer_auth("test-token")
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 415);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_status_and_metrics() {
        let url = agent().await;
        let body: Value = client()
            .get(format!("{url}/status"))
            .bearer_auth("test-token")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "online");
        assert_eq!(body["version"], "1.9.0");
        assert_eq!(body["update_phase"], "idle");
        assert!(body["hostname"].is_string());
        assert_eq!(body["metrics"]["cpu"]["cores"], 2);

        let body: Value = client()
            .get(format!("{url}/metrics"))
            .bearer_auth("test-token")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["metrics"]["memory"]["total_mb"], 2048);
    }

    #[tokio::test]
    async fn test_execute_rejects_unlisted_commands() {
        let url = agent().await;
        for command in ["rm", "RM", " Rm "] {
            let resp = client()
                .post(format!("{url}/execute"))
                .bearer_auth("test-token")
                .json(&json!({"command": command, "args": ["-rf", "/"]}))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 403, "{command:?}");
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["error"], "command_not_allowed");
            assert!(body["allowed_commands"]
                .as_array()
                .unwrap()
                .contains(&json!("uname")));
        }
    }

    #[tokio::test]
    async fn test_execute_rejects_mutating_arguments() {
        let url = agent().await;
        let resp = client()
            .post(format!("{url}/execute"))
            .bearer_auth("test-token")
            .json(&json!({"command": "date", "args": ["-s", "2020-01-01"]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "argument_not_allowed");
    }

    #[tokio::test]
    async fn test_execute_runs_allowlisted_command() {
        let url = agent().await;
        let resp = client()
            .post(format!("{url}/execute"))
            .bearer_auth("test-token")
            .json(&json!({"command": "uname", "args": ["-s"]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["exit_code"], 0);
        assert_eq!(body["stdout"].as_str().unwrap().trim(), "Linux");
        assert_eq!(body["command"], "uname -s");
    }

    #[tokio::test]
    async fn test_update_reports_up_to_date() {
        let (url, _) = agent_with_registry("v1.9.0").await;
        let resp = client()
            .post(format!("{url}/update"))
            .bearer_auth("test-token")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"status": "up_to_date", "current_version": "1.9.0"}));
    }

    #[tokio::test]
    async fn test_update_download_failure_is_bad_gateway() {
        // newer release listed, artifact host down
        let (url, version) = agent_with_registry("v9.9.9").await;
        let resp = client()
            .post(format!("{url}/update"))
            .bearer_auth("test-token")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "update_download_failed");
        assert_eq!(body["version"], "9.9.9");
        assert_eq!(version.current().await, "1.9.0");
    }
}
