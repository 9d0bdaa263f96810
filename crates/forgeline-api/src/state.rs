//! Application state.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::Docker;
use chrono::Utc;
use forgeline_config::ProcessConfig;
use forgeline_core::token::StepToken;
use forgeline_core::{Error, Result};
use forgeline_core::ResourceId;
use forgeline_db::{
    DebugSessionRepo, LogRepo, PgDebugSessionRepo, PgLogRepo, PgPipelineRepo, PgRepositoryRepo,
    PgStepRunRepo, PipelineRepo, RepositoryRepo, StepRunRepo,
};
use forgeline_executor::{LocalDockerExecutor, WorkspaceManager};
use forgeline_git::GitHost;
use forgeline_scheduler::debug::DebugSessionRegistry;
use forgeline_scheduler::orchestrator::PipelineExecutor;
use forgeline_scheduler::queue::JobQueue;
use forgeline_scheduler::remote::RemoteExecutor;
use forgeline_scheduler::router::ExecutionRouter;
use sqlx::PgPool;
use tokio::sync::{mpsc, RwLock};

use crate::ws::Broadcaster;

/// In-process store for per-step bearer tokens (§6). Never persisted —
/// see the "Workers, workspaces, and per-step tokens are in-process
/// only" note on `forgeline_db`.
#[derive(Default)]
pub struct StepTokenStore {
    tokens: RwLock<HashMap<ResourceId, StepToken>>,
}

impl StepTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: StepToken) {
        self.tokens.write().await.insert(token.step_run_id, token);
    }

    pub async fn get(&self, step_run_id: ResourceId) -> Option<StepToken> {
        self.tokens.read().await.get(&step_run_id).cloned()
    }

    pub async fn revoke(&self, step_run_id: ResourceId) {
        if let Some(token) = self.tokens.write().await.get_mut(&step_run_id) {
            token.revoked = true;
        }
    }

    /// Validates a presented token for `step_run_id`, matching the step
    /// id in the request URL against the record's own step id.
    pub async fn validate(&self, step_run_id: ResourceId, presented: &str) -> bool {
        match self.tokens.read().await.get(&step_run_id) {
            Some(record) if record.step_run_id == step_run_id => {
                forgeline_core::token::validate_step_token(record, presented, Utc::now())
            }
            _ => false,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<ProcessConfig>,
    pub repository_repo: Arc<dyn RepositoryRepo>,
    pub pipeline_repo: Arc<dyn PipelineRepo>,
    pub step_run_repo: Arc<dyn StepRunRepo>,
    pub debug_session_repo: Arc<dyn DebugSessionRepo>,
    pub log_repo: Arc<dyn LogRepo>,
    pub queue: Arc<JobQueue>,
    pub router: Arc<ExecutionRouter>,
    pub workspaces: Arc<WorkspaceManager>,
    pub git: Arc<GitHost>,
    pub executor: Arc<PipelineExecutor>,
    pub events: Arc<RwLock<mpsc::UnboundedReceiver<forgeline_scheduler::orchestrator::PipelineEvent>>>,
    pub remote: Arc<RemoteExecutor>,
    pub debug_sessions: Arc<DebugSessionRegistry>,
    pub step_tokens: Arc<StepTokenStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub local_executor: Arc<LocalDockerExecutor>,
}

impl AppState {
    pub async fn new(pool: PgPool, config: ProcessConfig) -> Result<Self> {
        let config = Arc::new(config);

        let repository_repo: Arc<dyn RepositoryRepo> = Arc::new(PgRepositoryRepo::new(pool.clone()));
        let pipeline_repo: Arc<dyn PipelineRepo> = Arc::new(PgPipelineRepo::new(pool.clone()));
        let step_run_repo: Arc<dyn StepRunRepo> = Arc::new(PgStepRunRepo::new(pool.clone()));
        let debug_session_repo: Arc<dyn DebugSessionRepo> =
            Arc::new(PgDebugSessionRepo::new(pool.clone()));
        let log_repo: Arc<dyn LogRepo> = Arc::new(PgLogRepo::new(pool.clone()));

        let queue = Arc::new(JobQueue::new());
        let router = Arc::new(ExecutionRouter::new(std::env::consts::ARCH, true));

        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Internal(format!("docker connect failed: {e}")))?;
        let workspaces = Arc::new(WorkspaceManager::new(docker));
        let local_executor = Arc::new(LocalDockerExecutor::new()?);

        let git = Arc::new(GitHost::new(config.git_repository_root.clone())?);

        let (executor, events) = PipelineExecutor::new(
            pipeline_repo.clone(),
            step_run_repo.clone(),
            ExecutionRouter::new(std::env::consts::ARCH, true),
            queue.clone(),
            workspaces.clone(),
            git.clone(),
            Some(config.backend_base_url.clone()),
        );

        let remote = Arc::new(RemoteExecutor::new());
        let debug_sessions = Arc::new(DebugSessionRegistry::new());
        let step_tokens = Arc::new(StepTokenStore::new());
        let broadcaster = Arc::new(Broadcaster::new());

        Ok(Self {
            pool,
            config,
            repository_repo,
            pipeline_repo,
            step_run_repo,
            debug_session_repo,
            log_repo,
            queue,
            router,
            workspaces,
            git,
            executor: Arc::new(executor),
            events: Arc::new(RwLock::new(events)),
            remote,
            debug_sessions,
            step_tokens,
            broadcaster,
            local_executor,
        })
    }
}
