//! Axum HTTP gateway for the agent network.
//!
//! - Request body size limit (64KB max)
//! - Request timeout (30s)
//! - JSON error bodies `{"error": <code>, "message": <text>}` with the status
//!   taken from the service error kind
//!
//! Agent routes live in [`api`], unauthenticated read routes in [`public`].

pub mod api;
pub mod public;

use crate::config::Config;
use crate::conversation::ConversationService;
use crate::directory::Directory;
use crate::embedding::{create_embedding_provider, EmbeddingProvider};
use crate::error::{ErrorKind, ServiceError};
use crate::identity::IdentityService;
use crate::matcher::Matcher;
use crate::moderation::ModerationService;
use crate::relay::MessageRelay;
use crate::store::{Agent, Store};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub identity: Arc<IdentityService>,
    pub matcher: Arc<Matcher>,
    pub conversations: Arc<ConversationService>,
    pub relay: Arc<MessageRelay>,
    pub moderation: Arc<ModerationService>,
    pub directory: Arc<Directory>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<Store>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            identity: Arc::new(IdentityService::new(
                store.clone(),
                config.registration.clone(),
            )),
            matcher: Arc::new(Matcher::new(
                store.clone(),
                embedder,
                config.matching.clone(),
            )),
            conversations: Arc::new(ConversationService::new(store.clone())),
            relay: Arc::new(MessageRelay::new(store.clone())),
            moderation: Arc::new(ModerationService::new(
                store.clone(),
                config.moderation.clone(),
            )),
            directory: Arc::new(Directory::new(store)),
            config: Arc::new(config),
        }
    }

    /// Map a service error to its HTTP response.
    pub fn error(&self, err: ServiceError) -> ApiError {
        ApiError::from_service(&err, &self.config.moderation.admin_email)
    }

    /// Resolve the bearer token to an agent.
    ///
    /// Waking a hibernated agent re-indexes its reactivated tasks; indexing
    /// failures are logged and do not fail the request.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Agent, ApiError> {
        let token = extract_bearer_token(headers).unwrap_or("");
        let now = Utc::now();
        let authenticated = self
            .identity
            .authenticate(token, now)
            .map_err(|e| self.error(e))?;

        for task in &authenticated.woken_tasks {
            if let Err(e) = self.matcher.sync_task(task, now).await {
                tracing::warn!(task_id = %task.id, "Failed to re-index woken task: {e}");
            }
        }
        Ok(authenticated.agent)
    }
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": code, "message": message.into() }),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn from_service(err: &ServiceError, admin_email: &str) -> Self {
        let status = status_for(err.kind());
        let message = if err.kind() == ErrorKind::Internal {
            tracing::error!("Request failed: {err:#}");
            "Internal server error".to_string()
        } else {
            err.to_string()
        };

        let mut api_error = Self::new(status, err.code(), message);
        if matches!(err, ServiceError::AgentBanned) {
            api_error.body["admin_email"] = serde_json::json!(admin_email);
        }
        api_error
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::DependencyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Request helpers ─────────────────────────────────────────────

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
}

fn parse_client_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim().trim_matches('"').trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }

    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr.ip());
    }

    let value = value.trim_matches(['[', ']']);
    value.parse::<IpAddr>().ok()
}

fn forwarded_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(xff) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        for candidate in xff.split(',') {
            if let Some(ip) = parse_client_ip(candidate) {
                return Some(ip);
            }
        }
    }

    headers
        .get("X-Real-IP")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_client_ip)
}

/// Best-effort client address, used when a registration omits `ip_address`.
fn client_ip(
    peer_addr: Option<SocketAddr>,
    headers: &HeaderMap,
    trust_forwarded_headers: bool,
) -> Option<String> {
    if trust_forwarded_headers {
        if let Some(ip) = forwarded_client_ip(headers) {
            return Some(ip.to_string());
        }
    }
    peer_addr.map(|addr| addr.ip().to_string())
}

pub fn is_public_bind(host: &str) -> bool {
    !matches!(
        host,
        "127.0.0.1" | "localhost" | "::1" | "[::1]" | "0:0:0:0:0:0:0:1"
    )
}

// ── Server ──────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/agents/register", post(api::handle_register))
        .route("/api/v1/agents/me", get(api::handle_me))
        .route("/api/v1/agents/tasks", post(api::handle_create_task))
        .route("/api/v1/agents/tasks/{task_id}", put(api::handle_update_task))
        .route("/api/v1/scan", post(api::handle_scan))
        .route(
            "/api/v1/conversations",
            post(api::handle_create_conversation).get(api::handle_list_conversations),
        )
        .route(
            "/api/v1/conversations/{id}/conclude",
            post(api::handle_conclude),
        )
        .route("/api/v1/heartbeat", post(api::handle_heartbeat))
        .route("/api/v1/reports", post(api::handle_report))
        .route("/api/v1/public/agents", get(public::handle_list_agents))
        .route("/api/v1/public/agents/{id}", get(public::handle_agent))
        .route("/api/v1/public/tasks/{id}", get(public::handle_task))
        .route("/api/v1/public/stats", get(public::handle_stats))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Serve the HTTP API on `host:port` until the task is aborted.
pub async fn run_gateway(host: &str, port: u16, config: Config, store: Arc<Store>) -> Result<()> {
    if is_public_bind(host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "Refusing to bind to {host}: the gateway would be exposed publicly.\n\
             Fix: use --host 127.0.0.1 (default) or set\n\
             [gateway] allow_public_bind = true in config.toml."
        );
    }

    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::from(create_embedding_provider(&config.embedding));
    tracing::info!(
        provider = embedder.name(),
        dimensions = embedder.dimensions(),
        "Embedding provider ready"
    );

    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to bind gateway to {host}:{port}"))?;
    let local_addr = listener.local_addr()?;

    let app = router(AppState::new(config, store, embedder));

    tracing::info!("Gateway listening on http://{local_addr}");
    crate::health::mark_component_ok("gateway");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// GET /health: always public
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "embedding_provider": state.config.embedding.provider,
        "runtime": crate::health::snapshot_json(),
    }))
}
