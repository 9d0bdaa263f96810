//! Job queue (§5 "Shared-resource policy"): FIFO, single-consumer-per-item,
//! in-process. Distinct from the persisted `PipelineRun`/`StepRun` rows in
//! `forgeline-db` — this is the dispatch handle the local step dispatcher
//! and the execution router pop from, carrying a step's resolved execution
//! config rather than the entity history.

use std::collections::VecDeque;

use forgeline_core::step::ExecutionConfig;
use forgeline_core::ResourceId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::router::RouteDecision;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

/// One dispatched step, carrying everything the chosen executor needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: ResourceId,
    pub pipeline_run_id: ResourceId,
    pub step_run_id: ResourceId,
    pub execution_key: String,
    pub config: ExecutionConfig,
    pub route: RouteDecision,
    pub status: JobStatus,
    pub claimed_by: Option<String>,
    pub error: Option<String>,
}

/// In-process FIFO job queue. A clear operation exists for test setup,
/// matching §5's "not otherwise used" note.
#[derive(Default)]
pub struct JobQueue {
    jobs: Mutex<VecDeque<QueuedJob>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(
        &self,
        pipeline_run_id: ResourceId,
        step_run_id: ResourceId,
        execution_key: String,
        config: ExecutionConfig,
        route: RouteDecision,
    ) -> QueuedJob {
        let job = QueuedJob {
            id: ResourceId::new(),
            pipeline_run_id,
            step_run_id,
            execution_key,
            config,
            route,
            status: JobStatus::Pending,
            claimed_by: None,
            error: None,
        };
        self.jobs.lock().await.push_back(job.clone());
        job
    }

    /// Claims the oldest pending job for `consumer`, marking it
    /// `claimed`.
    pub async fn claim(&self, consumer: &str) -> Option<QueuedJob> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.iter_mut().find(|j| j.status == JobStatus::Pending)?;
        job.status = JobStatus::Claimed;
        job.claimed_by = Some(consumer.to_string());
        Some(job.clone())
    }

    pub async fn complete(&self, job_id: ResourceId) {
        self.set_status(job_id, JobStatus::Completed, None).await;
    }

    pub async fn fail(&self, job_id: ResourceId, error: impl Into<String>) {
        self.set_status(job_id, JobStatus::Failed, Some(error.into())).await;
    }

    /// Releases a claimed job back to pending, e.g. on worker crash
    /// recovery.
    pub async fn release(&self, job_id: ResourceId) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
            job.status = JobStatus::Pending;
            job.claimed_by = None;
        }
    }

    pub async fn get(&self, job_id: ResourceId) -> Option<QueuedJob> {
        self.jobs.lock().await.iter().find(|j| j.id == job_id).cloned()
    }

    /// All jobs still active (pending or claimed) for a pipeline run,
    /// used by cancellation to mark every associated job failed.
    pub async fn active_for_run(&self, pipeline_run_id: ResourceId) -> Vec<QueuedJob> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|j| j.pipeline_run_id == pipeline_run_id && matches!(j.status, JobStatus::Pending | JobStatus::Claimed))
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.jobs.lock().await.clear();
    }

    async fn set_status(&self, job_id: ResourceId, status: JobStatus, error: Option<String>) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
            job.status = status;
            job.error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    async fn fifo_claim_order() {
        let queue = JobQueue::new();
        let run = ResourceId::new();
        let first = queue
            .enqueue(run, ResourceId::new(), "k1".to_string(), config(), RouteDecision::Local)
            .await;
        let _second = queue
            .enqueue(run, ResourceId::new(), "k2".to_string(), config(), RouteDecision::Local)
            .await;

        let claimed = queue.claim("worker-a").await.unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Claimed);
    }

    #[tokio::test]
    async fn release_returns_job_to_pending() {
        let queue = JobQueue::new();
        let job = queue
            .enqueue(ResourceId::new(), ResourceId::new(), "k".to_string(), config(), RouteDecision::Local)
            .await;
        queue.claim("worker-a").await;
        queue.release(job.id).await;
        let refreshed = queue.get(job.id).await.unwrap();
        assert_eq!(refreshed.status, JobStatus::Pending);
        assert!(refreshed.claimed_by.is_none());
    }

    #[tokio::test]
    async fn active_for_run_excludes_terminal_jobs() {
        let queue = JobQueue::new();
        let run = ResourceId::new();
        let job = queue
            .enqueue(run, ResourceId::new(), "k".to_string(), config(), RouteDecision::Local)
            .await;
        queue.complete(job.id).await;
        assert!(queue.active_for_run(run).await.is_empty());
    }
}
