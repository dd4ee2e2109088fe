use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use stack_backup_core::{LogLine, Stack};
use stack_backup_storage::ArchiveEntry;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Settings;
use crate::engine::{Engine, EngineStatus, RunHandle, TriggerError};
use crate::log_sink::{LogFileEntry, LogFileError, LOG_BUFFER_CAPACITY};
use crate::restore::RestoreRequest;

const DEFAULT_LOG_LINES: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub settings: Arc<Settings>,
    pub api_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/healthz", get(healthz))
        .route("/api/v1/status", get(status))
        .route("/api/v1/stacks", get(list_stacks))
        .route("/api/v1/backups", post(trigger_backup))
        .route("/api/v1/archives", get(list_archives))
        .route("/api/v1/restores", post(trigger_restore))
        .route("/api/v1/logs", get(recent_logs))
        .route("/api/v1/log-files", get(list_log_files))
        .route("/api/v1/log-files/{name}", get(read_log_file))
        .route("/api/v1/config", get(show_config))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

fn require_api_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.api_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<Uuid>,
}

fn trigger_response(result: Result<RunHandle, TriggerError>) -> (StatusCode, Json<TriggerResponse>) {
    match result {
        Ok(handle) => {
            info!(run_id = %handle.run_id(), "run accepted");
            (
                StatusCode::ACCEPTED,
                Json(TriggerResponse {
                    accepted: true,
                    reason: None,
                    run_id: Some(handle.run_id()),
                }),
            )
        }
        Err(e) => {
            let code = match e {
                TriggerError::Busy => StatusCode::CONFLICT,
                TriggerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                TriggerError::Discovery(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            (
                code,
                Json(TriggerResponse {
                    accepted: false,
                    reason: Some(e.to_string()),
                    run_id: None,
                }),
            )
        }
    }
}

async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<EngineStatus>, StatusCode> {
    require_api_auth(&state, &headers)?;
    Ok(Json(state.engine.status()))
}

async fn list_stacks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Stack>>, StatusCode> {
    require_api_auth(&state, &headers)?;
    state.engine.list_stacks().await.map(Json).map_err(|e| {
        error!(error = %e, "stack discovery failed");
        StatusCode::SERVICE_UNAVAILABLE
    })
}

#[derive(Debug, Deserialize)]
struct BackupRequest {
    stacks: Vec<String>,
}

async fn trigger_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BackupRequest>,
) -> Result<(StatusCode, Json<TriggerResponse>), StatusCode> {
    require_api_auth(&state, &headers)?;
    Ok(trigger_response(state.engine.trigger_backup(&req.stacks).await))
}

async fn trigger_restore(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RestoreRequest>,
) -> Result<(StatusCode, Json<TriggerResponse>), StatusCode> {
    require_api_auth(&state, &headers)?;
    Ok(trigger_response(state.engine.trigger_restore(req).await))
}

async fn list_archives(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ArchiveEntry>>, StatusCode> {
    require_api_auth(&state, &headers)?;
    state.engine.list_archives().map(Json).map_err(|e| {
        error!(error = %e, "listing archives failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<i64>,
}

async fn recent_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogLine>>, StatusCode> {
    require_api_auth(&state, &headers)?;
    // out-of-range counts are clamped, not rejected
    let n = query
        .lines
        .map_or(DEFAULT_LOG_LINES, |n| n.clamp(1, LOG_BUFFER_CAPACITY as i64) as usize);
    Ok(Json(state.engine.recent_logs(n)))
}

async fn list_log_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<LogFileEntry>>, StatusCode> {
    require_api_auth(&state, &headers)?;
    state.engine.logs().list_log_files().map(Json).map_err(|e| {
        error!(error = %e, "listing log files failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn read_log_file(
    Path(name): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    require_api_auth(&state, &headers)?;
    let contents = state.engine.logs().read_log_file(&name).map_err(|e| match e {
        LogFileError::InvalidName(_) => StatusCode::BAD_REQUEST,
        LogFileError::NotFound(_) => StatusCode::NOT_FOUND,
        LogFileError::Io(e) => {
            error!(error = %e, file = %name, "reading log file failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        contents,
    )
        .into_response())
}

async fn show_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Settings>, StatusCode> {
    require_api_auth(&state, &headers)?;
    Ok(Json(Settings::clone(&state.settings)))
}
