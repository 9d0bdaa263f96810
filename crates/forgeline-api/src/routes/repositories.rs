//! Repository management endpoints. A repository here is a bare
//! repo hosted by this server (see `routes::git`), not an external
//! clone — there is no provider/owner/organization concept.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use forgeline_core::ResourceId;
use forgeline_core::repository::Repository;
use forgeline_db::RepositoryRepo;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_repositories).post(create_repository))
        .route("/{id}", get(get_repository).delete(delete_repository))
        .route("/{id}/ingest", post(ingest_repository))
}

#[derive(Debug, Serialize)]
pub struct RepositoryResponse {
    pub id: String,
    pub name: String,
    pub default_branch: String,
    pub remote_url: Option<String>,
    pub ingested: bool,
}

fn repository_response(repo: Repository) -> RepositoryResponse {
    RepositoryResponse {
        id: repo.id.to_string(),
        name: repo.name,
        default_branch: repo.default_branch,
        remote_url: repo.remote_url,
        ingested: repo.ingested,
    }
}

async fn list_repositories(
    State(state): State<AppState>,
) -> Result<Json<Vec<RepositoryResponse>>, ApiError> {
    let repos = state.repository_repo.list().await?;
    Ok(Json(repos.into_iter().map(repository_response).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateRepositoryRequest {
    pub name: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

async fn create_repository(
    State(state): State<AppState>,
    Json(req): Json<CreateRepositoryRequest>,
) -> Result<Json<RepositoryResponse>, ApiError> {
    if state.repository_repo.get_by_name(&req.name).await?.is_some() {
        return Err(ApiError::Conflict(format!("repository {} already exists", req.name)));
    }

    let mut repo = Repository::new(req.name, req.default_branch);
    repo.remote_url = Some(format!("{}/{}.git", state.config.backend_base_url, repo.id));
    let repo = state.repository_repo.create(&repo).await?;

    state
        .git
        .create_bare(&repo.id.to_string())
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(repository_response(repo)))
}

async fn get_repository(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RepositoryResponse>, ApiError> {
    let repo = state.repository_repo.get_by_id(ResourceId::from_uuid(id)).await?;
    Ok(Json(repository_response(repo)))
}

async fn delete_repository(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = ResourceId::from_uuid(id);
    state.repository_repo.delete(id).await?;
    if let Err(e) = state.git.delete(&id.to_string()) {
        tracing::warn!(repository_id = %id, error = %e, "failed to remove bare repo after db delete");
    }
    Ok(Json(serde_json::json!({"deleted": true})))
}

/// Marks a repository ingested (§3): the one-way flag the graph config
/// parser and pipeline-creation flow check before accepting pipelines
/// against it.
async fn ingest_repository(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RepositoryResponse>, ApiError> {
    let id = ResourceId::from_uuid(id);
    state.repository_repo.mark_ingested(id).await?;
    let repo = state.repository_repo.get_by_id(id).await?;
    Ok(Json(repository_response(repo)))
}
