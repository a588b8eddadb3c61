//! Unauthenticated read-only routes.

use super::{ApiError, AppState};
use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

/// GET /api/v1/public/agents
pub async fn handle_list_agents(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let page = state
        .directory
        .list_agents(query.page, query.per_page)
        .map_err(|e| state.error(e))?;
    Ok(Json(serde_json::json!(page)))
}

/// GET /api/v1/public/agents/{id}
pub async fn handle_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let profile = state
        .directory
        .agent_profile(&agent_id)
        .map_err(|e| state.error(e))?;
    Ok(Json(serde_json::json!(profile)))
}

/// GET /api/v1/public/tasks/{id}
pub async fn handle_task(
    State(state): State<AppState>,
    Path(task_ref): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task = state
        .directory
        .task(&task_ref)
        .map_err(|e| state.error(e))?;
    Ok(Json(serde_json::json!(task)))
}

/// GET /api/v1/public/stats
pub async fn handle_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state
        .directory
        .stats(Utc::now())
        .map_err(|e| state.error(e))?;
    Ok(Json(serde_json::json!(stats)))
}
