//! In-container control layer endpoints (§6 "Per-step bearer token"):
//! a running step's sidecar posts log lines and its terminal result
//! back here, authenticated by the bearer token minted into its
//! `ExecutionConfig` and scoped to the step id in the URL.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use forgeline_core::ResourceId;
use forgeline_db::{LogRepo, StepRunRepo};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{step_run_id}/logs", post(append_logs))
        .route("/{step_run_id}/result", post(report_result))
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))
}

async fn authorize(state: &AppState, step_run_id: ResourceId, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = bearer_token(headers)?;
    if state.step_tokens.validate(step_run_id, token).await {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("invalid or expired step token".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct AppendLogsRequest {
    lines: Vec<String>,
    #[serde(default = "default_stream")]
    stream: String,
}

fn default_stream() -> String {
    "stdout".to_string()
}

async fn append_logs(
    State(state): State<AppState>,
    Path(step_run_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<AppendLogsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let step_run_id = ResourceId::from_uuid(step_run_id);
    authorize(&state, step_run_id, &headers).await?;

    let step_run = state.step_run_repo.get(step_run_id).await?;
    let entries: Vec<(String, String)> =
        req.lines.into_iter().map(|line| (req.stream.clone(), line)).collect();
    state
        .log_repo
        .append_logs_batch(step_run.pipeline_run_id, &step_run.step_id, &entries)
        .await?;

    Ok(Json(serde_json::json!({ "accepted": true })))
}

#[derive(Debug, Deserialize)]
struct ReportResultRequest {
    success: bool,
    exit_code: i32,
    error: Option<String>,
    duration_ms: u64,
}

async fn report_result(
    State(state): State<AppState>,
    Path(step_run_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<ReportResultRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let step_run_id = ResourceId::from_uuid(step_run_id);
    authorize(&state, step_run_id, &headers).await?;
    state.step_tokens.revoke(step_run_id).await;

    let result = forgeline_core::step::StepResult {
        success: req.success,
        exit_code: req.exit_code,
        logs: String::new(),
        error: req.error,
        duration_ms: req.duration_ms,
        container_id: None,
    };

    let job = {
        let step_run = state.step_run_repo.get(step_run_id).await?;
        state
            .queue
            .active_for_run(step_run.pipeline_run_id)
            .await
            .into_iter()
            .find(|j| j.step_run_id == step_run_id)
    };

    if let Some(job) = job {
        if result.success {
            state.queue.complete(job.id).await;
        } else {
            state
                .queue
                .fail(job.id, result.error.clone().unwrap_or_else(|| "step failed".to_string()))
                .await;
        }
        crate::completion::handle_step_completion(std::sync::Arc::new(state.clone()), job, result).await;
    }

    Ok(Json(serde_json::json!({ "accepted": true })))
}
