//! Local step dispatcher: claims `Local`-routed jobs off the
//! [`JobQueue`] and runs them against a [`StepExecutor`] (normally
//! `forgeline_executor::LocalDockerExecutor`), consulting the
//! idempotency store before spawning anything new.

use std::sync::Arc;
use std::time::Duration;

use forgeline_core::step::{StepExecutor, StepOutput, StepResult};
use forgeline_core::Result;
use futures::StreamExt;
use tracing::{error, info};

use crate::idempotency::IdempotencyStore;
use crate::queue::{JobQueue, QueuedJob};
use crate::router::RouteDecision;

/// Runs one job to completion: an idempotency hit short-circuits
/// execution; otherwise drains the executor's log/result stream and
/// records the terminal result before returning it.
pub async fn run_job(
    executor: &dyn StepExecutor,
    idempotency: &IdempotencyStore,
    job: &QueuedJob,
) -> Result<StepResult> {
    let key = forgeline_core::execution::ExecutionKey::parse(&job.execution_key)?;
    if let Some(cached) = idempotency.get(&key).await {
        return Ok(cached);
    }

    let mut stream = executor.execute_step(&job.execution_key, job.config.clone()).await?;
    let mut result = None;
    while let Some(output) = stream.next().await {
        match output {
            StepOutput::Log(line) => info!(execution_key = %job.execution_key, "{}", line.content),
            StepOutput::Result(r) => result = Some(r),
        }
    }
    let result = result.ok_or_else(|| {
        forgeline_core::Error::ExecutionFailed(format!(
            "executor stream for {} ended without a terminal result",
            job.execution_key
        ))
    })?;
    idempotency.record(&key, result.clone()).await;
    Ok(result)
}

/// Polls `queue` for `Local` jobs and executes each with `executor`,
/// invoking `on_complete(job, result)` once the step finishes (success
/// or failure alike — dispatch failures surface as a failed
/// `StepResult` rather than being silently dropped).
pub async fn run_dispatch_loop<F>(
    queue: Arc<JobQueue>,
    executor: Arc<dyn StepExecutor>,
    idempotency: Arc<IdempotencyStore>,
    consumer_name: &str,
    on_complete: F,
) where
    F: Fn(QueuedJob, StepResult) + Send + Sync + 'static,
{
    loop {
        let Some(job) = queue.claim(consumer_name).await else {
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        };
        if !matches!(job.route, RouteDecision::Local) {
            queue.release(job.id).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }

        match run_job(executor.as_ref(), &idempotency, &job).await {
            Ok(result) => {
                if result.success {
                    queue.complete(job.id).await;
                } else {
                    queue
                        .fail(job.id, result.error.clone().unwrap_or_else(|| "step failed".to_string()))
                        .await;
                }
                on_complete(job, result);
            }
            Err(e) => {
                error!(execution_key = %job.execution_key, error = %e, "local dispatch failed");
                queue.fail(job.id, e.to_string()).await;
                on_complete(
                    job,
                    StepResult {
                        success: false,
                        exit_code: -1,
                        logs: String::new(),
                        error: Some(e.to_string()),
                        duration_ms: 0,
                        container_id: None,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use forgeline_core::step::{ExecutionConfig, TerminalSession};
    use forgeline_core::ResourceId;
    use futures::stream::{self, BoxStream};

    struct StubExecutor;

    #[async_trait]
    impl StepExecutor for StubExecutor {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn execute_step(
            &self,
            _execution_key: &str,
            _config: ExecutionConfig,
        ) -> Result<BoxStream<'static, StepOutput>> {
            let result = StepResult {
                success: true,
                exit_code: 0,
                logs: "ok".to_string(),
                error: None,
                duration_ms: 5,
                container_id: Some("c1".to_string()),
            };
            Ok(Box::pin(stream::iter(vec![StepOutput::Result(result)])))
        }

        async fn cancel(&self, _execution_key: &str) -> Result<()> {
            Ok(())
        }

        async fn exec_interactive(&self, _execution_key: &str, _cmd: Vec<String>) -> Result<TerminalSession> {
            Err(forgeline_core::Error::Internal("not implemented".to_string()))
        }
    }

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
    async fn repeated_key_returns_cached_result_without_rerunning() {
        let idempotency = IdempotencyStore::new();
        let executor = StubExecutor;
        let run_id = ResourceId::new();
        let key = forgeline_core::execution::ExecutionKey::first(run_id, 0);

        let job = QueuedJob {
            id: ResourceId::new(),
            pipeline_run_id: run_id,
            step_run_id: ResourceId::new(),
            execution_key: key.to_string(),
            config: config(),
            route: RouteDecision::Local,
            status: crate::queue::JobStatus::Pending,
            claimed_by: None,
            error: None,
        };

        let first = run_job(&executor, &idempotency, &job).await.unwrap();
        assert!(first.success);
        let second = run_job(&executor, &idempotency, &job).await.unwrap();
        assert_eq!(second.container_id, first.container_id);
    }
}
