//! Server startup (§4.14 CLI "run the HTTP/duplex server"): builds
//! [`AppState`], recovers orphaned work, spawns every background task,
//! and serves the router. Shared by the `forgeline-server` binary and
//! the `forgeline serve` CLI subcommand so there is exactly one place
//! that wires the process together.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use forgeline_config::ProcessConfig;
use forgeline_core::execution::ExecutionKey;
use forgeline_db::{StepRunRepo, create_pool};
use forgeline_executor::docker::recover_orphan;
use forgeline_scheduler::debug::run_timeout_monitor as run_debug_timeout_monitor;
use forgeline_scheduler::dispatcher::run_dispatch_loop;
use forgeline_scheduler::idempotency::IdempotencyStore;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::completion::{handle_step_completion, recover_step_run, run_event_forwarder};
use crate::remote_dispatch::{run_remote_dispatch_loop, run_worker_sweep_loop};
use crate::{AppState, routes};

/// Connects to the database, migrates, builds state, spawns every
/// background task, and serves until the process is killed.
pub async fn run(mut config: ProcessConfig) -> anyhow::Result<()> {
    if let Ok(database_url) = std::env::var("DATABASE_URL") {
        config.database_url = database_url;
    }

    info!("connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    forgeline_db::run_migrations(&pool).await?;
    info!("database connected and migrated");

    let bind_address = config.bind_address.clone();
    let orphan_sweep_interval = config.orphan_sweep_interval_seconds;
    let state = Arc::new(AppState::new(pool, config).await?);

    recover_orphaned_step_runs(&state).await;

    let idempotency = Arc::new(IdempotencyStore::new());
    {
        let state = state.clone();
        let idempotency = idempotency.clone();
        tokio::spawn(async move {
            let local_executor = state.local_executor.clone() as Arc<dyn forgeline_core::step::StepExecutor>;
            run_dispatch_loop(
                state.queue.clone(),
                local_executor,
                idempotency,
                "forgeline-local",
                move |job, result| {
                    let state = state.clone();
                    tokio::spawn(handle_step_completion(state, job, result));
                },
            )
            .await;
        });
    }

    {
        let state = state.clone();
        tokio::spawn(async move { run_event_forwarder(state).await });
    }

    {
        let queue = state.queue.clone();
        let remote = state.remote.clone();
        let step_runs = state.step_run_repo.clone();
        tokio::spawn(async move { run_worker_sweep_loop(queue, remote, step_runs).await });
    }

    {
        let queue = state.queue.clone();
        let remote = state.remote.clone();
        tokio::spawn(async move { run_remote_dispatch_loop(queue, remote).await });
    }

    {
        let debug_sessions = state.debug_sessions.clone();
        let broadcaster = state.broadcaster.clone();
        tokio::spawn(async move {
            run_debug_timeout_monitor(debug_sessions, move |run_id| {
                broadcaster.publish(crate_ws_timeout_event(run_id));
            })
            .await;
        });
    }

    {
        let state = state.clone();
        tokio::spawn(async move { run_orphan_sweep_loop(state, orphan_sweep_interval).await });
    }

    let app = routes::router((*state).clone())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr: SocketAddr = bind_address.parse()?;
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn crate_ws_timeout_event(run_id: forgeline_core::ResourceId) -> crate::ws::DomainEvent {
    crate::ws::DomainEvent::PipelineRunStatus {
        run_id,
        status: forgeline_core::pipeline::RunStatus::Failed,
    }
}

/// Restart-time orphan recovery: any step run left `running` by an
/// unclean shutdown whose container is gone, exited, or dead is
/// recovered as a failed result before the dispatch loop starts
/// claiming new work.
async fn recover_orphaned_step_runs(state: &Arc<AppState>) {
    let running = match state.step_run_repo.list_running().await {
        Ok(runs) => runs,
        Err(e) => {
            warn!(error = %e, "failed to list running step runs for orphan recovery");
            return;
        }
    };

    for step_run in running {
        let key = ExecutionKey {
            pipeline_run_id: step_run.pipeline_run_id,
            step_index: step_run.step_index as u32,
            attempt: step_run.attempt,
        };
        if let Some(result) = recover_orphan(state.local_executor.docker(), &key.to_string()).await {
            warn!(step_run_id = %step_run.id, execution_key = %key, "recovered orphaned step run");
            recover_step_run(state.clone(), step_run.pipeline_run_id, step_run.id, result).await;
        }
    }
}

/// Periodic sweep (default 30s, per [`ProcessConfig::orphan_sweep_interval_seconds`])
/// for workspaces whose owning pipeline run is terminal or missing.
async fn run_orphan_sweep_loop(state: Arc<AppState>, interval_seconds: i64) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1) as u64));
    loop {
        ticker.tick().await;

        let tracked = state.workspaces.tracked_ids().await;
        let mut terminal_or_missing = HashSet::new();
        for run_id in tracked {
            let is_terminal = match state.pipeline_repo.get_run(run_id).await {
                Ok(run) => run.status.is_terminal(),
                Err(_) => true,
            };
            if is_terminal {
                terminal_or_missing.insert(run_id);
            }
        }

        let cleaned = state
            .workspaces
            .sweep_orphans(|run_id| terminal_or_missing.contains(&run_id))
            .await;
        if !cleaned.is_empty() {
            info!(count = cleaned.len(), "swept orphaned workspaces");
        }
    }
}
