//! Pipeline executor (§4.8): graph fan-out/fan-in dispatch, legacy
//! linear dispatch, trigger-action handling on run completion, and
//! cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use forgeline_core::execution::ExecutionKey;
use forgeline_core::pipeline::{
    LegacyAction, LegacyStep, Pipeline, PipelineDefinition, PipelineGraph, PipelineRun,
    RunStatus, StepRun, StepRunStatus, TriggerAction,
};
use forgeline_core::repository::Repository;
use forgeline_core::step::{build_execution_config, StepKind, StepResult};
use forgeline_core::{Error, ResourceId, Result};
use forgeline_db::{PipelineRepo, StepRunRepo};
use forgeline_executor::WorkspaceManager;
use forgeline_git::GitHost;
use tokio::sync::mpsc;
use tracing::warn;

use crate::queue::JobQueue;
use crate::router::{ExecutionRouter, RoutingRequirements};

/// The directory a merged card branch leaves behind (§4.8a, §6).
const CONTEXT_DIRECTORY: &str = ".lazyaf-context/";

/// Card-board notifications the executor raises as trigger actions
/// resolve. The card board itself lives outside this crate (§1
/// "deliberately out of scope"); only this event shape is specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardOutcome {
    Done,
    Todo,
    Failed,
}

/// Observer-bus events (§4.12, §6 event catalog). Broadcasting these to
/// external subscribers is an external collaborator's job; this crate
/// only produces them.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    JobQueued {
        run_id: ResourceId,
        step_id: String,
        job_id: ResourceId,
    },
    StepCompleted {
        run_id: ResourceId,
        step_id: String,
        success: bool,
    },
    PipelineRunStatus {
        run_id: ResourceId,
        status: RunStatus,
    },
    CardUpdated {
        card_id: ResourceId,
        outcome: CardOutcome,
    },
    PipelineTriggered {
        pipeline_id: ResourceId,
    },
}

fn db_err(e: forgeline_db::DbError) -> Error {
    Error::Internal(e.to_string())
}

fn routing_requirements(kind: &StepKind) -> RoutingRequirements {
    RoutingRequirements {
        arch: None,
        has: kind.runner_type().map(|r| vec![r.to_string()]).unwrap_or_default(),
        runner_id: None,
    }
}

pub struct PipelineExecutor {
    pipelines: Arc<dyn PipelineRepo>,
    step_runs: Arc<dyn StepRunRepo>,
    router: ExecutionRouter,
    queue: Arc<JobQueue>,
    workspaces: Arc<WorkspaceManager>,
    git: Arc<GitHost>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    backend_url: Option<String>,
}

impl PipelineExecutor {
    pub fn new(
        pipelines: Arc<dyn PipelineRepo>,
        step_runs: Arc<dyn StepRunRepo>,
        router: ExecutionRouter,
        queue: Arc<JobQueue>,
        workspaces: Arc<WorkspaceManager>,
        git: Arc<GitHost>,
        backend_url: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                pipelines,
                step_runs,
                router,
                queue,
                workspaces,
                git,
                events: tx,
                backend_url,
            },
            rx,
        )
    }

    /// Starts a run: materializes the `PipelineRun` row and dispatches
    /// every entry-point step (graph) or the first step (legacy) in
    /// parallel.
    pub async fn start(
        &self,
        pipeline: &Pipeline,
        repository: &Repository,
        trigger: forgeline_core::pipeline::TriggerContext,
    ) -> Result<PipelineRun> {
        let mut run = PipelineRun::new(pipeline.id, trigger);
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        let mut run = self.pipelines.create_run(&run).await.map_err(db_err)?;

        if pipeline.definition.step_count() == 0 {
            self.finish_run(repository, pipeline, &mut run, RunStatus::Passed).await?;
            return Ok(run);
        }

        match &pipeline.definition {
            PipelineDefinition::Graph(graph) => {
                graph.validate()?;
                for entry in graph.entry_points.clone() {
                    if let Some(step) = graph.step(&entry).cloned() {
                        let index = graph.step_index(&entry).unwrap_or(0);
                        self.dispatch_one(
                            &mut run,
                            repository,
                            &step.id,
                            index,
                            &step.kind,
                            step.timeout_seconds,
                            None,
                        )
                        .await?;
                    }
                }
            }
            PipelineDefinition::Legacy(steps) => {
                let first = &steps[0];
                self.dispatch_one(&mut run, repository, "0", 0, &first.kind, first.timeout_seconds, None)
                    .await?;
            }
        }
        self.pipelines.update_run(&run).await.map_err(db_err)?;
        Ok(run)
    }

    /// Step dispatch (§4.8): records the active step, creates a
    /// `StepRun`, acquires the run's workspace, resolves an
    /// `ExecutionConfig`, asks the router for an execution route, and
    /// enqueues the job.
    async fn dispatch_one(
        &self,
        run: &mut PipelineRun,
        repository: &Repository,
        step_id: &str,
        step_index: usize,
        kind: &StepKind,
        timeout_seconds: Option<u64>,
        previous_worker_id: Option<ResourceId>,
    ) -> Result<()> {
        run.active_step_ids.push(step_id.to_string());

        let step_run = StepRun::new(run.id, step_id, step_index);
        let step_run = self.step_runs.create(&step_run).await.map_err(db_err)?;

        self.workspaces.get_or_create(run.id, repository.id).await?;
        let workspace = self.workspaces.acquire(run.id).await?;
        let workspace_path = workspace.lock().await.volume_name();

        let config = build_execution_config(
            kind,
            &HashMap::new(),
            workspace_path,
            timeout_seconds.unwrap_or(3600),
            "/workspace/repo",
            false,
            self.backend_url.clone(),
        )
        .map_err(|e| Error::InvalidInput(e.to_string()))?;

        let requirements = routing_requirements(kind);
        let route = self
            .router
            .route(&requirements, previous_worker_id)
            .map_err(|_| Error::RemoteDisabled)?;

        let execution_key = ExecutionKey::first(run.id, step_index as u32).to_string();
        let job = self.queue.enqueue(run.id, step_run.id, execution_key, config, route).await;

        let _ = self.events.send(PipelineEvent::JobQueued {
            run_id: run.id,
            step_id: step_id.to_string(),
            job_id: job.id,
        });
        Ok(())
    }

    /// Step-completion callback (§4.8): updates the `StepRun`, advances
    /// the run's active/completed sets, and fans out to whichever
    /// definition kind (graph or legacy) owns the continuation logic.
    pub async fn on_step_complete(
        &self,
        repository: &Repository,
        pipeline: &Pipeline,
        run: &mut PipelineRun,
        step_run_id: ResourceId,
        step_id: &str,
        result: &StepResult,
        previous_worker_id: Option<ResourceId>,
    ) -> Result<()> {
        let _ = self.workspaces.release(run.id).await;

        let mut step_run = self.step_runs.get(step_run_id).await.map_err(db_err)?;
        step_run.status = if result.success {
            StepRunStatus::Passed
        } else {
            StepRunStatus::Failed
        };
        step_run.logs = result.logs.clone();
        step_run.error = result.error.clone();
        step_run.finished_at = Some(Utc::now());
        self.step_runs.update(&step_run).await.map_err(db_err)?;

        run.active_step_ids.retain(|id| id != step_id);
        run.completed_step_ids.push(step_id.to_string());

        let _ = self.events.send(PipelineEvent::StepCompleted {
            run_id: run.id,
            step_id: step_id.to_string(),
            success: result.success,
        });

        match pipeline.definition.clone() {
            PipelineDefinition::Graph(graph) => {
                self.advance_graph(repository, pipeline, run, &graph, step_id, result.success, previous_worker_id)
                    .await
            }
            PipelineDefinition::Legacy(steps) => {
                self.advance_legacy(repository, pipeline, run, &steps, step_id, result.success, previous_worker_id)
                    .await
            }
        }
    }

    async fn advance_graph(
        &self,
        repository: &Repository,
        pipeline: &Pipeline,
        run: &mut PipelineRun,
        graph: &PipelineGraph,
        step_id: &str,
        succeeded: bool,
        previous_worker_id: Option<ResourceId>,
    ) -> Result<()> {
        let candidates: Vec<String> = graph
            .downstream_edges(step_id, succeeded)
            .into_iter()
            .map(|edge| edge.to_step.clone())
            .collect();

        for to in candidates {
            if run.completed_step_ids.iter().any(|s| s == &to) || run.active_step_ids.contains(&to) {
                continue;
            }
            let ready = graph
                .upstream_step_ids(&to)
                .into_iter()
                .all(|up| run.completed_step_ids.iter().any(|s| s == up));
            if !ready {
                continue;
            }
            let Some(next_step) = graph.step(&to).cloned() else {
                continue;
            };
            let index = graph.step_index(&to).unwrap_or(0);
            self.dispatch_one(
                run,
                repository,
                &next_step.id,
                index,
                &next_step.kind,
                next_step.timeout_seconds,
                previous_worker_id,
            )
            .await?;
        }

        self.pipelines.update_run(run).await.map_err(db_err)?;

        if run.active_step_ids.is_empty() {
            let step_runs = self.step_runs.list_for_run(run.id).await.map_err(db_err)?;
            let any_failed = step_runs.iter().any(|s| s.status == StepRunStatus::Failed);
            let status = if any_failed { RunStatus::Failed } else { RunStatus::Passed };
            self.finish_run(repository, pipeline, run, status).await?;
        }
        Ok(())
    }

    async fn advance_legacy(
        &self,
        repository: &Repository,
        pipeline: &Pipeline,
        run: &mut PipelineRun,
        steps: &[LegacyStep],
        step_id: &str,
        succeeded: bool,
        previous_worker_id: Option<ResourceId>,
    ) -> Result<()> {
        let index: usize = step_id
            .parse()
            .map_err(|_| Error::Internal(format!("non-numeric legacy step id {step_id}")))?;
        let step = steps
            .get(index)
            .ok_or_else(|| Error::Internal(format!("legacy step {index} out of range")))?;
        let action = if succeeded { step.on_success.clone() } else { step.on_failure.clone() };

        match action {
            LegacyAction::Next => {
                self.advance_legacy_to_next(repository, pipeline, run, steps, index, previous_worker_id)
                    .await
            }
            LegacyAction::Stop => {
                let status = if succeeded { RunStatus::Passed } else { RunStatus::Failed };
                self.finish_run(repository, pipeline, run, status).await
            }
            LegacyAction::Merge { target_branch } => {
                self.merge_card_branch(repository, run, target_branch.as_deref());
                self.advance_legacy_to_next(repository, pipeline, run, steps, index, previous_worker_id)
                    .await
            }
            LegacyAction::TriggerCard { card_id } => {
                // The card entity's persistence lives outside this crate
                // (§1); running its clone as a "fix" sub-step does not.
                // Re-dispatch the same step in place and keep the run
                // active until that sub-step reports its own result.
                let _ = self.events.send(PipelineEvent::CardUpdated {
                    card_id,
                    outcome: CardOutcome::Todo,
                });
                self.dispatch_one(
                    run,
                    repository,
                    step_id,
                    index,
                    &step.kind,
                    step.timeout_seconds,
                    previous_worker_id,
                )
                .await?;
                self.pipelines.update_run(run).await.map_err(db_err)
            }
            LegacyAction::TriggerPipeline { pipeline_id } => {
                let _ = self.events.send(PipelineEvent::PipelineTriggered { pipeline_id });
                self.advance_legacy_to_next(repository, pipeline, run, steps, index, previous_worker_id)
                    .await
            }
        }
    }

    async fn advance_legacy_to_next(
        &self,
        repository: &Repository,
        pipeline: &Pipeline,
        run: &mut PipelineRun,
        steps: &[LegacyStep],
        index: usize,
        previous_worker_id: Option<ResourceId>,
    ) -> Result<()> {
        let next_index = index + 1;
        if let Some(next) = steps.get(next_index) {
            self.dispatch_one(
                run,
                repository,
                &next_index.to_string(),
                next_index,
                &next.kind,
                next.timeout_seconds,
                previous_worker_id,
            )
            .await?;
            self.pipelines.update_run(run).await.map_err(db_err)?;
            Ok(())
        } else {
            self.finish_run(repository, pipeline, run, RunStatus::Passed).await
        }
    }

    async fn finish_run(
        &self,
        repository: &Repository,
        pipeline: &Pipeline,
        run: &mut PipelineRun,
        status: RunStatus,
    ) -> Result<()> {
        run.status = status;
        run.finished_at = Some(Utc::now());
        self.pipelines.update_run(run).await.map_err(db_err)?;
        let _ = self.events.send(PipelineEvent::PipelineRunStatus {
            run_id: run.id,
            status,
        });

        let action = match status {
            RunStatus::Passed => run.trigger.on_pass.clone(),
            RunStatus::Failed => run.trigger.on_fail.clone(),
            _ => TriggerAction::Nothing,
        };
        self.apply_trigger_action(repository, run, &action);
        let _ = pipeline;
        Ok(())
    }

    /// Trigger actions on terminal pipeline (§4.8).
    fn apply_trigger_action(&self, repository: &Repository, run: &PipelineRun, action: &TriggerAction) {
        let Some(card_id) = run.trigger.card_id else {
            return;
        };
        match action {
            TriggerAction::Nothing => {}
            TriggerAction::Merge { target_branch } => {
                let success = self.merge_card_branch(repository, run, target_branch.as_deref());
                let outcome = if success { CardOutcome::Done } else { CardOutcome::Failed };
                let _ = self.events.send(PipelineEvent::CardUpdated { card_id, outcome });
            }
            TriggerAction::Reject => {
                let _ = self.events.send(PipelineEvent::CardUpdated {
                    card_id,
                    outcome: CardOutcome::Todo,
                });
            }
            TriggerAction::Fail => {
                let _ = self.events.send(PipelineEvent::CardUpdated {
                    card_id,
                    outcome: CardOutcome::Failed,
                });
            }
        }
    }

    /// Merges the triggering card's branch into `target_branch` (or the
    /// repository default), then strips `.lazyaf-context/` from the
    /// target per §4.8a. Cleanup failure is logged only.
    fn merge_card_branch(&self, repository: &Repository, run: &PipelineRun, target_branch: Option<&str>) -> bool {
        let Some(branch) = run.trigger.branch.as_deref() else {
            warn!(run_id = %run.id, "merge trigger action requested but the run has no branch");
            return false;
        };
        let target = target_branch.unwrap_or(&repository.default_branch);
        let repo_id = repository.id.to_string();
        let outcome = self.git.merge_branch(&repo_id, branch, target);
        if outcome.success {
            if let Err(e) = self.git.delete_directory_from_branch(&repo_id, target, CONTEXT_DIRECTORY) {
                warn!(run_id = %run.id, error = %e, "post-merge context cleanup failed");
            }
        } else {
            warn!(run_id = %run.id, error = ?outcome.error, "card branch merge failed");
        }
        outcome.success
    }

    /// Cancellation (§4.8): marks the run and its active step runs
    /// cancelled, fails any still-queued jobs, and releases the
    /// workspace. Remote workers are not forcibly killed.
    pub async fn cancel(&self, run: &mut PipelineRun) -> Result<()> {
        run.status = RunStatus::Cancelled;
        run.finished_at = Some(Utc::now());
        self.pipelines.update_run(run).await.map_err(db_err)?;

        for mut step_run in self.step_runs.list_for_run(run.id).await.map_err(db_err)? {
            if !step_run.status.is_terminal() {
                step_run.status = StepRunStatus::Cancelled;
                step_run.finished_at = Some(Utc::now());
                self.step_runs.update(&step_run).await.map_err(db_err)?;
            }
        }
        for job in self.queue.active_for_run(run.id).await {
            self.queue.fail(job.id, "cancelled").await;
        }
        let _ = self.workspaces.release(run.id).await;

        let _ = self.events.send(PipelineEvent::PipelineRunStatus {
            run_id: run.id,
            status: RunStatus::Cancelled,
        });
        Ok(())
    }
}
