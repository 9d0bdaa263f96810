//! API routes.

pub mod control;
pub mod debug;
pub mod git;
pub mod health;
pub mod pipelines;
pub mod repositories;
pub mod workers;
pub mod workspaces;

use crate::AppState;
use crate::ws::ws_handler;
use axum::Router;
use axum::routing::get;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(git::router())
        .nest("/api/v1", api_router())
        .route("/ws", get(ws_handler))
        .route("/workers/ws", get(workers::ws_handler))
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/pipelines", pipelines::router())
        .nest("/repositories", repositories::router())
        .nest("/debug-sessions", debug::router())
        .nest("/control/steps", control::router())
        .nest("/workers", workers::router())
        .nest("/workspaces", workspaces::router())
}
