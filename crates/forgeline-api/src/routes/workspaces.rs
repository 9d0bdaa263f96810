//! Workspace operational-state listing (§4.14 CLI "print workspace state").

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use forgeline_core::workspace::Workspace;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_workspaces))
}

async fn list_workspaces(State(state): State<AppState>) -> Json<Vec<Workspace>> {
    Json(state.workspaces.summaries().await)
}
