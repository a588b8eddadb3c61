//! Authenticated agent routes.
//!
//! Every route except registration requires `Authorization: Bearer <token>`.
//! Authentication doubles as the liveness signal: it stamps the heartbeat and
//! wakes hibernated agents.

use super::{client_ip, ApiError, AppState};
use crate::conversation::{NewConversation, Outcome};
use crate::identity::{NewTask, Registration, TaskPatch};
use crate::moderation::NewReport;
use crate::relay::Outbound;
use crate::store::{Task, TaskStatus};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, ConnectInfo, Path, State},
    http::{Extensions, HeaderMap, StatusCode},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;

type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e.body_text())))
}

/// Index a freshly created or reactivated task. Failures become warnings.
async fn index_softly(
    state: &AppState,
    task: &Task,
    now: DateTime<Utc>,
    warnings: &mut Vec<String>,
) {
    if task.keywords.is_empty() || task.status != TaskStatus::Active {
        return;
    }
    let indexed = match state.matcher.sync_task(task, now).await {
        Ok(indexed) => indexed,
        Err(e) => {
            tracing::warn!(task_id = %task.id, "Failed to store task embedding: {e}");
            false
        }
    };
    if !indexed {
        warnings.push(format!(
            "Embedding unavailable for task '{}'; it will not appear in scans until its keywords are updated",
            task.task_id
        ));
    }
}

// ── Request bodies ──────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConcludeRequest {
    #[serde(default)]
    pub outcome: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub outbound: Vec<Outbound>,
}

// ── Handlers ────────────────────────────────────────────────────

/// POST /api/v1/agents/register
pub async fn handle_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Result<Json<Registration>, JsonRejection>,
) -> ApiResult {
    let mut registration = json_body(body)?;
    if registration.ip_address.trim().is_empty() {
        let peer = extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        if let Some(ip) = client_ip(peer, &headers, state.config.gateway.trust_forwarded_headers) {
            registration.ip_address = ip;
        }
    }

    let now = Utc::now();
    let registered = state
        .identity
        .register_agent(&registration, now)
        .map_err(|e| state.error(e))?;

    let mut warnings = Vec::new();
    for task in &registered.tasks {
        index_softly(&state, task, now, &mut warnings).await;
    }

    let tasks: Vec<Value> = registered
        .tasks
        .iter()
        .map(|task| {
            json!({
                "task_id": task.task_id,
                "platform_id": task.id,
                "title": task.title,
                "mode": task.mode,
            })
        })
        .collect();

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "agent_id": registered.agent.id,
            "agent_token": registered.token,
            "registered_at": registered.agent.created_at,
            "tasks": tasks,
            "warnings": warnings,
        })),
    ))
}

/// GET /api/v1/agents/me
pub async fn handle_me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let agent = state.authenticate(&headers).await?;
    let (agent, tasks) = state
        .identity
        .profile(&agent.id)
        .map_err(|e| state.error(e))?;
    Ok((StatusCode::OK, Json(json!({ "agent": agent, "tasks": tasks }))))
}

/// POST /api/v1/agents/tasks
pub async fn handle_create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<NewTask>, JsonRejection>,
) -> ApiResult {
    let agent = state.authenticate(&headers).await?;
    let request = json_body(body)?;
    let now = Utc::now();

    let task = state
        .identity
        .create_task(&agent.id, &request, now)
        .map_err(|e| state.error(e))?;
    let mut warnings = Vec::new();
    index_softly(&state, &task, now, &mut warnings).await;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "task": task, "warnings": warnings })),
    ))
}

/// PUT /api/v1/agents/tasks/{task_id}
pub async fn handle_update_task(
    State(state): State<AppState>,
    Path(task_ref): Path<String>,
    headers: HeaderMap,
    body: Result<Json<TaskPatch>, JsonRejection>,
) -> ApiResult {
    let agent = state.authenticate(&headers).await?;
    let patch = json_body(body)?;
    let now = Utc::now();

    let update = state
        .identity
        .update_task(&agent.id, &task_ref, &patch, now)
        .map_err(|e| state.error(e))?;
    let mut warnings = Vec::new();
    if update.reindex {
        index_softly(&state, &update.task, now, &mut warnings).await;
    }

    Ok((
        StatusCode::OK,
        Json(json!({ "task": update.task, "warnings": warnings })),
    ))
}

/// POST /api/v1/scan
pub async fn handle_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ScanRequest>, JsonRejection>,
) -> ApiResult {
    let agent = state.authenticate(&headers).await?;
    let request = json_body(body)?;
    if request.task_id.trim().is_empty() {
        return Err(ApiError::bad_request("task_id is required"));
    }

    let result = state
        .matcher
        .scan_for_task(&agent.id, request.task_id.trim(), &request.keywords, Utc::now())
        .await
        .map_err(|e| state.error(e))?;
    Ok((StatusCode::OK, Json(json!(result))))
}

/// POST /api/v1/conversations
pub async fn handle_create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<NewConversation>, JsonRejection>,
) -> ApiResult {
    let agent = state.authenticate(&headers).await?;
    let request = json_body(body)?;

    let (conversation, created) = state
        .conversations
        .create_or_get(&agent.id, &request, Utc::now())
        .map_err(|e| state.error(e))?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(json!({ "conversation": conversation, "created": created })),
    ))
}

/// GET /api/v1/conversations
pub async fn handle_list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult {
    let agent = state.authenticate(&headers).await?;
    let conversations = state
        .conversations
        .list_for_agent(&agent.id)
        .map_err(|e| state.error(e))?;
    Ok((
        StatusCode::OK,
        Json(json!({ "conversations": conversations })),
    ))
}

/// POST /api/v1/conversations/{id}/conclude
pub async fn handle_conclude(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<ConcludeRequest>, JsonRejection>,
) -> ApiResult {
    let agent = state.authenticate(&headers).await?;
    let request = json_body(body)?;
    let outcome: Outcome = request.outcome.parse().map_err(|e| state.error(e))?;

    let conversation = state
        .conversations
        .conclude(&conversation_id, &agent.id, outcome, Utc::now())
        .map_err(|e| state.error(e))?;
    Ok((
        StatusCode::OK,
        Json(json!({ "conversation": conversation })),
    ))
}

/// POST /api/v1/heartbeat. An empty or unparseable body means pull only.
pub async fn handle_heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let agent = state.authenticate(&headers).await?;

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        HeartbeatRequest::default()
    } else {
        serde_json::from_slice::<HeartbeatRequest>(&body).unwrap_or_else(|e| {
            tracing::debug!(agent_id = %agent.id, "Ignoring unparseable heartbeat body: {e}");
            HeartbeatRequest::default()
        })
    };

    let response = state
        .relay
        .heartbeat(&agent.id, &request.outbound, Utc::now())
        .map_err(|e| state.error(e))?;
    Ok((StatusCode::OK, Json(json!(response))))
}

/// POST /api/v1/reports
pub async fn handle_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<NewReport>, JsonRejection>,
) -> ApiResult {
    let agent = state.authenticate(&headers).await?;
    let report = json_body(body)?;

    let outcome = state
        .moderation
        .report(&agent.id, &report, Utc::now())
        .map_err(|e| state.error(e))?;
    Ok((StatusCode::CREATED, Json(json!(outcome))))
}
