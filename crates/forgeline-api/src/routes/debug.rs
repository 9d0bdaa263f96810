//! Debug re-run session endpoints (§4.9): create a paused re-run of a
//! previously completed pipeline run, step through its breakpoints,
//! and resume or abort it. The in-process `DebugSessionRegistry` is
//! the live source of truth the executor consults while dispatching;
//! `debug_session_repo` mirrors each transition so a session survives
//! a process restart.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use forgeline_core::ResourceId;
use forgeline_core::debug::{ConnectionMode, DebugSession};
use forgeline_core::pipeline::TriggerContext;
use forgeline_db::{DebugSessionRepo, PipelineRepo, RepositoryRepo};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_session))
        .route("/{id}", get(get_session))
        .route("/{id}/connect", post(connect_session))
        .route("/{id}/resume", post(resume_session))
        .route("/{id}/abort", post(abort_session))
        .route("/{id}/extend-timeout", post(extend_timeout))
}

#[derive(Debug, Serialize)]
struct DebugSessionResponse {
    id: String,
    pipeline_run_id: String,
    original_run_id: String,
    breakpoints: Vec<usize>,
    state: forgeline_core::debug::DebugSessionState,
    current_step_index: Option<usize>,
    current_step_name: Option<String>,
    expires_at: Option<String>,
}

fn session_response(session: DebugSession) -> DebugSessionResponse {
    DebugSessionResponse {
        id: session.id.to_string(),
        pipeline_run_id: session.pipeline_run_id.to_string(),
        original_run_id: session.original_run_id.to_string(),
        breakpoints: session.breakpoints,
        state: session.state,
        current_step_index: session.current_step_index,
        current_step_name: session.current_step_name,
        expires_at: session.expires_at.map(|t| t.to_rfc3339()),
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    original_run_id: Uuid,
    breakpoints: Vec<usize>,
}

/// Re-triggers the original run's pipeline with the same trigger
/// context to get a fresh `PipelineRun` to pause, then registers a
/// session around it.
async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<DebugSessionResponse>, ApiError> {
    let original_run_id = ResourceId::from_uuid(req.original_run_id);
    let original_run = state.pipeline_repo.get_run(original_run_id).await?;
    let pipeline = state.pipeline_repo.get_by_id(original_run.pipeline_id).await?;
    let repository = state.repository_repo.get_by_id(pipeline.repository_id).await?;

    let trigger = TriggerContext {
        card_id: None,
        ..original_run.trigger.clone()
    };
    let new_run = state.executor.start(&pipeline, &repository, trigger).await?;

    let session = state
        .debug_sessions
        .create(new_run.id, original_run_id, req.breakpoints)
        .await;
    state.debug_session_repo.upsert(&session).await?;

    state.broadcaster.publish(crate::ws::DomainEvent::DebugStatus {
        session_id: session.id,
        state: session.state,
    });

    Ok(Json(session_response(session)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DebugSessionResponse>, ApiError> {
    let id = ResourceId::from_uuid(id);
    let session = state
        .debug_sessions
        .get(id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("debug session {id}")))?;
    Ok(Json(session_response(session)))
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    #[serde(default)]
    mode: ConnectModeDto,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ConnectModeDto {
    #[default]
    Shell,
    Sidecar,
}

async fn connect_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<DebugSessionResponse>, ApiError> {
    let id = ResourceId::from_uuid(id);
    let mode = match req.mode {
        ConnectModeDto::Shell => ConnectionMode::Shell,
        ConnectModeDto::Sidecar => ConnectionMode::Sidecar,
    };
    let session = state.debug_sessions.on_connect(id, mode).await?;
    state.debug_session_repo.upsert(&session).await?;

    state.broadcaster.publish(crate::ws::DomainEvent::DebugStatus {
        session_id: session.id,
        state: session.state,
    });

    Ok(Json(session_response(session)))
}

async fn resume_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = ResourceId::from_uuid(id);
    let run_id = state.debug_sessions.resume(id).await?;
    if let Some(session) = state.debug_sessions.get(id).await {
        state.debug_session_repo.upsert(&session).await?;
    }

    state.broadcaster.publish(crate::ws::DomainEvent::DebugResume { session_id: id, run_id });

    Ok(Json(serde_json::json!({ "run_id": run_id.to_string() })))
}

async fn abort_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = ResourceId::from_uuid(id);
    let run_id = state.debug_sessions.abort(id).await?;
    if let Some(session) = state.debug_sessions.get(id).await {
        state.debug_session_repo.upsert(&session).await?;
    }

    let mut run = state.pipeline_repo.get_run(run_id).await?;
    state.executor.cancel(&mut run).await?;

    state.broadcaster.publish(crate::ws::DomainEvent::DebugStatus {
        session_id: id,
        state: forgeline_core::debug::DebugSessionState::Ended,
    });

    Ok(Json(serde_json::json!({ "run_id": run_id.to_string() })))
}

#[derive(Debug, Deserialize)]
struct ExtendTimeoutRequest {
    additional_seconds: i64,
}

async fn extend_timeout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ExtendTimeoutRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = ResourceId::from_uuid(id);
    let expires_at = state.debug_sessions.extend_timeout(id, req.additional_seconds).await?;
    if let Some(session) = state.debug_sessions.get(id).await {
        state.debug_session_repo.upsert(&session).await?;
    }
    Ok(Json(serde_json::json!({ "expires_at": expires_at.to_rfc3339() })))
}
