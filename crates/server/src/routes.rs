use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::services::{ServeDir, ServeFile};

use arena_brain::BrainData;
use arena_core::{Event, RangeKey};
use arena_db::Db;

use crate::state::{AppState, build_agents_state, build_budget_state, build_state};
use crate::ws;

#[derive(Serialize)]
pub struct ApiError {
    error: String,
}

#[derive(Deserialize)]
struct RangeQuery {
    range: Option<String>,
}

#[derive(Deserialize)]
struct EventsQuery {
    range: Option<String>,
    limit: Option<u32>,
}

pub fn build_app(state: AppState, static_dir: Option<std::path::PathBuf>) -> Router {
    let api = Router::new()
        .route("/api/health", get(health))
        .route("/api/state", get(state_snapshot))
        .route("/api/agents", get(agents))
        .route("/api/budget", get(budget))
        .route("/api/events", get(events))
        .route("/api/skills", get(skills))
        .route("/api/context", get(context))
        .route("/api/event", post(push_event))
        .route("/api/sync-status", get(sync_status))
        .route("/api/brain/health", get(brain_health))
        .route("/api/brain/instances", get(brain_instances))
        .route("/api/brain/projects", get(brain_projects))
        .route("/api/brain/briefs", get(brain_briefs))
        .route("/api/brain/sessions", get(brain_sessions))
        .route("/ws", get(ws::upgrade))
        .with_state(state);

    match static_dir {
        Some(dir) => {
            let service = ServeDir::new(&dir).fallback(ServeFile::new(dir.join("index.html")));
            api.fallback_service(service)
        }
        None => api,
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn state_snapshot(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
    let range = resolve_range(&query.range)?;
    let db = open_db(&state)?;
    build_state(&db, &state, range).map(Json).map_err(to_api_error)
}

async fn agents(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
    let range = resolve_range(&query.range)?;
    let db = open_db(&state)?;
    let agents = build_agents_state(&db, &state, range).map_err(to_api_error)?;
    Ok(Json(json!({ "range": range.as_str(), "agents": agents })))
}

async fn budget(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
    let db = open_db(&state)?;
    build_budget_state(&db, &state.budget)
        .map(Json)
        .map_err(to_api_error)
}

async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
    let range = resolve_range(&query.range)?;
    let limit = query.limit.unwrap_or(50).min(500);
    let db = open_db(&state)?;
    let events = db.recent_events(range, limit).map_err(to_api_error)?;
    Ok(Json(json!({ "range": range.as_str(), "events": events })))
}

async fn skills(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
    let range = resolve_range(&query.range)?;
    let db = open_db(&state)?;
    let heatmap = db.skill_heatmap(range).map_err(to_api_error)?;
    Ok(Json(json!({ "range": range.as_str(), "heatmap": heatmap })))
}

async fn context(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
    let db = open_db(&state)?;
    let window = db.context_window_state().map_err(to_api_error)?;
    Ok(Json(json!({ "context_window": window })))
}

/// Push ingress for the agent hook. Duplicates are acknowledged without
/// side effects; persistence failures surface as 500 so the hook retries.
async fn push_event(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
    let mut db = open_db(&state)?;
    let outcome = db.insert_event(&event).map_err(to_api_error)?;

    if outcome.is_applied() {
        arena_sync::broadcast_applied(&state.hub, std::slice::from_ref(&event)).await;
    }
    Ok(Json(json!({ "status": "ok", "applied": outcome.is_applied() })))
}

async fn sync_status(State(state): State<AppState>) -> Json<Value> {
    let upstream = state.brain.get("/api/sync-status", &[]).await;
    Json(state.brain.sync_status(upstream))
}

async fn brain_health(State(state): State<AppState>) -> Json<Value> {
    proxy(&state, "/health", &[]).await
}

async fn brain_instances(State(state): State<AppState>) -> Json<Value> {
    proxy(&state, "/api/instances", &[("include_stale", "false".to_string())]).await
}

async fn brain_projects(State(state): State<AppState>) -> Json<Value> {
    proxy(&state, "/api/projects", &[]).await
}

async fn brain_briefs(State(state): State<AppState>) -> Json<Value> {
    proxy(&state, "/api/briefs", &[]).await
}

async fn brain_sessions(State(state): State<AppState>) -> Json<Value> {
    proxy(&state, "/api/sessions", &[("days", "7".to_string())]).await
}

/// Brain reads degrade to an offline placeholder rather than erroring, so
/// the dashboard renders with or without the upstream.
async fn proxy(state: &AppState, path: &str, params: &[(&str, String)]) -> Json<Value> {
    match state.brain.get(path, params).await {
        BrainData::Available(value) => Json(value),
        BrainData::Unavailable => Json(json!({ "status": "offline" })),
    }
}

fn resolve_range(range: &Option<String>) -> Result<RangeKey, (StatusCode, Json<ApiError>)> {
    match range {
        None => Ok(RangeKey::default()),
        Some(value) => RangeKey::parse(value).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ApiError {
                    error: format!("invalid range: {value}"),
                }),
            )
        }),
    }
}

fn open_db(state: &AppState) -> Result<Db, (StatusCode, Json<ApiError>)> {
    Db::open(&state.db_path).map_err(to_api_error)
}

fn to_api_error(err: impl std::fmt::Display) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError {
            error: err.to_string(),
        }),
    )
}
