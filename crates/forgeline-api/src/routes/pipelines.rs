//! Pipeline and pipeline-run endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use forgeline_core::ResourceId;
use forgeline_core::pipeline::{PipelineDefinition, RunStatus, TriggerContext};
use forgeline_db::{LogRepo, PipelineRepo, RepositoryRepo};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_pipelines))
        .route("/{id}", get(get_pipeline))
        .route("/{id}/runs", get(list_runs).post(trigger_run))
        .route("/{id}/runs/{run_id}", get(get_run))
        .route("/{id}/runs/{run_id}/logs", get(get_run_logs))
}

#[derive(Debug, Deserialize)]
struct ListPipelinesQuery {
    repository_id: Uuid,
}

#[derive(Debug, Serialize)]
struct PipelineResponse {
    id: String,
    repository_id: String,
    name: String,
    step_count: usize,
}

fn pipeline_response(pipeline: forgeline_core::pipeline::Pipeline) -> PipelineResponse {
    PipelineResponse {
        id: pipeline.id.to_string(),
        repository_id: pipeline.repository_id.to_string(),
        step_count: pipeline.definition.step_count(),
        name: pipeline.name,
    }
}

async fn list_pipelines(
    State(state): State<AppState>,
    Query(query): Query<ListPipelinesQuery>,
) -> Result<Json<Vec<PipelineResponse>>, ApiError> {
    let repository_id = ResourceId::from_uuid(query.repository_id);
    let pipelines = state.pipeline_repo.list_by_repository(repository_id).await?;
    Ok(Json(pipelines.into_iter().map(pipeline_response).collect()))
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PipelineResponse>, ApiError> {
    let pipeline = state.pipeline_repo.get_by_id(ResourceId::from_uuid(id)).await?;
    Ok(Json(pipeline_response(pipeline)))
}

#[derive(Debug, Serialize)]
struct RunResponse {
    id: String,
    pipeline_id: String,
    status: RunStatus,
    active_step_ids: Vec<String>,
    completed_step_ids: Vec<String>,
}

fn run_response(run: forgeline_core::pipeline::PipelineRun) -> RunResponse {
    RunResponse {
        id: run.id.to_string(),
        pipeline_id: run.pipeline_id.to_string(),
        status: run.status,
        active_step_ids: run.active_step_ids,
        completed_step_ids: run.completed_step_ids,
    }
}

async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<RunResponse>>, ApiError> {
    let runs = state.pipeline_repo.list_runs(ResourceId::from_uuid(id), 20).await?;
    Ok(Json(runs.into_iter().map(run_response).collect()))
}

async fn get_run(
    State(state): State<AppState>,
    Path((_pipeline_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state.pipeline_repo.get_run(ResourceId::from_uuid(run_id)).await?;
    Ok(Json(run_response(run)))
}

#[derive(Debug, Default, Deserialize)]
struct TriggerRunRequest {
    branch: Option<String>,
    commit_sha: Option<String>,
}

async fn trigger_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TriggerRunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let pipeline_id = ResourceId::from_uuid(id);
    let pipeline = state.pipeline_repo.get_by_id(pipeline_id).await?;
    if let PipelineDefinition::Graph(graph) = &pipeline.definition {
        graph.validate()?;
    }
    let repository = state.repository_repo.get_by_id(pipeline.repository_id).await?;

    let trigger = TriggerContext {
        branch: req.branch,
        commit_sha: req.commit_sha,
        card_id: None,
        on_pass: Default::default(),
        on_fail: Default::default(),
    };

    let run = state.executor.start(&pipeline, &repository, trigger).await?;

    state.broadcaster.publish(crate::ws::DomainEvent::PipelineRunStatus {
        run_id: run.id,
        status: run.status,
    });

    Ok(Json(run_response(run)))
}

#[derive(Debug, Deserialize)]
struct GetLogsQuery {
    step_id: Option<String>,
    offset: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    id: String,
    step_id: String,
    timestamp: String,
    stream: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    logs: Vec<LogEntry>,
    has_more: bool,
}

async fn get_run_logs(
    State(state): State<AppState>,
    Path((_pipeline_id, run_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<GetLogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let run_id = ResourceId::from_uuid(run_id);
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(500).min(1000);

    let logs = state
        .log_repo
        .get_logs_paginated(run_id, query.step_id.as_deref(), offset, limit + 1)
        .await?;

    let has_more = logs.len() > limit as usize;
    let logs: Vec<LogEntry> = logs
        .into_iter()
        .take(limit as usize)
        .map(|log| LogEntry {
            id: log.id.to_string(),
            step_id: log.step_id,
            timestamp: log.timestamp.to_rfc3339(),
            stream: log.stream,
            content: log.content,
        })
        .collect();

    Ok(Json(LogsResponse { logs, has_more }))
}
