//! Bridges a finished [`StepResult`] (from the local dispatch loop or a
//! worker's `step_complete` message) back into the pipeline executor and
//! out to subscribers over the observable event catalog.

use std::sync::Arc;

use forgeline_core::ResourceId;
use forgeline_core::step::StepResult;
use forgeline_db::{PipelineRepo, RepositoryRepo, StepRunRepo};
use forgeline_scheduler::queue::QueuedJob;
use tracing::error;

use crate::state::AppState;
use crate::ws::DomainEvent;

/// Runs after a queued job finishes: loads the owning run/pipeline/
/// repository, feeds the result back into the executor to advance the
/// graph (or legacy chain), persists the updated run, and broadcasts a
/// `step_run_status` event.
pub async fn handle_step_completion(state: Arc<AppState>, job: QueuedJob, result: StepResult) {
    if let Err(e) = complete_step_run(&state, job.pipeline_run_id, job.step_run_id, &result).await {
        error!(job_id = %job.id, error = %e, "failed to process step completion");
    }
}

/// Feeds a result that did not originate from a queued job — currently
/// only orphan recovery at startup, where the step run was left
/// `running` by an unclean shutdown and has no in-process job to match.
pub async fn recover_step_run(state: Arc<AppState>, pipeline_run_id: ResourceId, step_run_id: ResourceId, result: StepResult) {
    if let Err(e) = complete_step_run(&state, pipeline_run_id, step_run_id, &result).await {
        error!(step_run_id = %step_run_id, error = %e, "failed to process orphan recovery result");
    }
}

async fn complete_step_run(
    state: &AppState,
    pipeline_run_id: ResourceId,
    step_run_id: ResourceId,
    result: &StepResult,
) -> forgeline_core::Result<()> {
    let mut run = state
        .pipeline_repo
        .get_run(pipeline_run_id)
        .await
        .map_err(|e| forgeline_core::Error::Internal(e.to_string()))?;
    let pipeline = state
        .pipeline_repo
        .get_by_id(run.pipeline_id)
        .await
        .map_err(|e| forgeline_core::Error::Internal(e.to_string()))?;
    let repository = state
        .repository_repo
        .get_by_id(pipeline.repository_id)
        .await
        .map_err(|e| forgeline_core::Error::Internal(e.to_string()))?;

    let step_run = state
        .step_run_repo
        .get(step_run_id)
        .await
        .map_err(|e| forgeline_core::Error::Internal(e.to_string()))?;
    let step_id = step_run.step_id.clone();

    state
        .executor
        .on_step_complete(&repository, &pipeline, &mut run, step_run_id, &step_id, result, None)
        .await?;

    state
        .pipeline_repo
        .update_run(&run)
        .await
        .map_err(|e| forgeline_core::Error::Internal(e.to_string()))?;

    state.broadcaster.publish(DomainEvent::StepRunStatus {
        run_id: run.id,
        step_id,
        success: result.success,
    });
    state.broadcaster.publish(DomainEvent::PipelineRunStatus {
        run_id: run.id,
        status: run.status,
    });

    Ok(())
}

/// Drains the executor's event channel and republishes every event on
/// the broadcaster under the matching observable event (§6 "event
/// catalog").
pub async fn run_event_forwarder(state: Arc<AppState>) {
    loop {
        let event = {
            let mut rx = state.events.write().await;
            rx.recv().await
        };
        let Some(event) = event else { break };
        state.broadcaster.publish(DomainEvent::from_pipeline_event(event));
    }
}
