//! Remote step dispatcher: the counterpart to
//! `forgeline_scheduler::dispatcher::run_dispatch_loop` for jobs the
//! router sent to `RouteDecision::Remote` instead of running them
//! in-process. Claims a job, finds an idle worker satisfying its
//! requirements, and hands it off with `RemoteExecutor::push_step`;
//! on success the job stays `Claimed` until the worker's
//! `step_complete` message resolves it (see `routes::workers`).

use std::sync::Arc;
use std::time::Duration;

use forgeline_core::ResourceId;
use forgeline_db::StepRunRepo;
use forgeline_scheduler::queue::JobQueue;
use forgeline_scheduler::remote::RemoteExecutor;
use forgeline_scheduler::router::RouteDecision;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Polls `queue` for `Remote` jobs and pushes each to a matching idle
/// worker via `remote`. Jobs claimed as `Local` are released
/// immediately, mirroring the way the local dispatch loop releases
/// anything that isn't its own route.
pub async fn run_remote_dispatch_loop(queue: Arc<JobQueue>, remote: Arc<RemoteExecutor>) {
    loop {
        let Some(job) = queue.claim("forgeline-remote").await else {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        };

        let RouteDecision::Remote {
            required_worker,
            required_arch,
            required_labels,
        } = &job.route
        else {
            queue.release(job.id).await;
            tokio::time::sleep(RETRY_INTERVAL).await;
            continue;
        };

        let worker_id = match required_worker {
            Some(id) => Some(*id),
            None => remote.find_idle("any", required_arch, required_labels).await,
        };

        let Some(worker_id) = worker_id else {
            queue.release(job.id).await;
            tokio::time::sleep(RETRY_INTERVAL).await;
            continue;
        };

        let step_id = job.step_run_id.to_string();
        match remote
            .push_step(worker_id, step_id, job.execution_key.clone(), job.config.clone())
            .await
        {
            Ok(()) => {}
            Err(e) => {
                warn!(worker = %worker_id, execution_key = %job.execution_key, error = %e, "push_step failed, releasing job");
                queue.release(job.id).await;
            }
        }
    }
}

/// Sweeps dead workers off `remote` and requeues any step they were
/// holding so the remote dispatch loop can hand it to a different
/// worker. `forgeline_scheduler::remote::run_timeout_monitor` only
/// marks the worker dead and logs — requeuing needs the job queue,
/// which the scheduler crate doesn't carry a handle to.
pub async fn run_worker_sweep_loop(
    queue: Arc<JobQueue>,
    remote: Arc<RemoteExecutor>,
    step_runs: Arc<dyn StepRunRepo>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        for (worker_id, step_id) in remote.sweep_dead_workers().await {
            let Some(step_id) = step_id else { continue };
            warn!(worker = %worker_id, step_id, "worker died, requeuing its step");
            let Ok(step_run_id) = step_id.parse::<ResourceId>() else { continue };
            let Ok(step_run) = step_runs.get(step_run_id).await else { continue };
            let jobs = queue.active_for_run(step_run.pipeline_run_id).await;
            if let Some(job) = jobs.into_iter().find(|j| j.step_run_id == step_run_id) {
                queue.release(job.id).await;
                info!(step_id, "requeued step after worker death");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeline_core::step::ExecutionConfig;
    use forgeline_scheduler::router::RoutingRequirements;

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            image: "forgeline-base:latest".to_string(),
            command: vec!["true".to_string()],
            workspace_path: "/tmp/ws".to_string(),
            timeout_seconds: 60,
            environment: Default::default(),
            working_dir: "/workspace".to_string(),
            use_control_layer: false,
            backend_url: None,
            step_token: None,
        }
    }

    #[tokio::test]
    async fn local_job_claimed_by_remote_loop_is_released_not_dropped() {
        let queue = Arc::new(JobQueue::new());
        let run_id = forgeline_core::ResourceId::new();
        let key = forgeline_core::execution::ExecutionKey::first(run_id, 0);
        let router = forgeline_scheduler::router::ExecutionRouter::new("x86_64", true);
        let route = router
            .route(&RoutingRequirements::default(), None)
            .unwrap();
        assert!(matches!(route, RouteDecision::Local));
        queue
            .enqueue(run_id, forgeline_core::ResourceId::new(), key.to_string(), config(), route)
            .await;

        let remote = Arc::new(RemoteExecutor::new());
        let loop_handle = tokio::spawn(run_remote_dispatch_loop(queue.clone(), remote));
        tokio::time::sleep(Duration::from_millis(50)).await;
        loop_handle.abort();

        let jobs = queue.active_for_run(run_id).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, forgeline_scheduler::queue::JobStatus::Pending);
    }
}
