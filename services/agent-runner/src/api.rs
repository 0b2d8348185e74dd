//! Read-only observability HTTP interface
//!
//! Serves the diary and log files. Nothing here touches trading state.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::diary::Diary;
use crate::logs::{self, LogError, LogLimit, DEFAULT_LOG_FILE};

const DEFAULT_LIMIT: usize = 200;

pub struct ApiState {
    pub diary: Arc<Diary>,
    pub log_dir: PathBuf,
}

type ApiError = (StatusCode, String);

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/diary", get(diary))
        .route("/logs", get(log_file))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits
pub async fn serve(state: Arc<ApiState>, host: &str, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Observability API listening on {}:{}", host, port);
    axum::serve(listener, router(state)).await
}

#[derive(Debug, Deserialize)]
pub struct DiaryQuery {
    limit: Option<usize>,
    raw: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DiaryResponse {
    entries: Vec<Value>,
}

fn truthy(flag: Option<&str>) -> bool {
    matches!(flag, Some("1") | Some("true") | Some("yes"))
}

/// GET /diary - last `limit` diary entries, or the raw JSONL with `raw=1`
async fn diary(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<DiaryQuery>,
) -> Result<Response, ApiError> {
    let internal = |e: crate::error::AgentError| {
        error!("Diary read failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    };

    if truthy(query.raw.as_deref()) {
        let text = state.diary.read_raw().await.map_err(internal)?;
        return Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], text).into_response());
    }

    let entries = state
        .diary
        .tail(query.limit.unwrap_or(DEFAULT_LIMIT))
        .await
        .map_err(internal)?;
    Ok(Json(DiaryResponse { entries }).into_response())
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    name: Option<String>,
    limit: Option<String>,
}

/// GET /logs - tail of a file inside the log directory
async fn log_file(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Value>, ApiError> {
    let name = query.name.as_deref().unwrap_or(DEFAULT_LOG_FILE);
    let limit = LogLimit::parse(query.limit.as_deref(), DEFAULT_LIMIT)
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let path = logs::resolve(&state.log_dir, name).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let lines = logs::tail_lines(&path, limit).await.map_err(|e| match e {
        LogError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        LogError::InvalidName(_) => (StatusCode::BAD_REQUEST, e.to_string()),
        LogError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    })?;

    Ok(Json(json!({ "name": name, "lines": lines })))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
