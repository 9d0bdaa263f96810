//! Debug session registry (§4.9): holds every active [`DebugSession`]
//! in-process and implements [`BreakpointObserver`] so the pipeline
//! executor can ask "should this run pause here?" without depending on
//! the scheduler crate.

use std::collections::HashMap;
use std::sync::Arc;

use forgeline_core::debug::{BreakpointObserver, ConnectionMode, DebugSession};
use forgeline_core::{Error, ResourceId, Result};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct DebugSessionRegistry {
    sessions: RwLock<HashMap<ResourceId, DebugSession>>,
    /// Index from the paused pipeline run to its session, so
    /// `should_pause` is a single lookup rather than a scan.
    by_run: RwLock<HashMap<ResourceId, ResourceId>>,
}

impl DebugSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a debug re-run session for `new_run_id`, the freshly
    /// created `PipelineRun` that will re-execute `original_run_id`
    /// pausing at each of `breakpoints`.
    pub async fn create(
        &self,
        new_run_id: ResourceId,
        original_run_id: ResourceId,
        breakpoints: Vec<usize>,
    ) -> DebugSession {
        let session = DebugSession::new(new_run_id, original_run_id, breakpoints);
        self.sessions.write().await.insert(session.id, session.clone());
        self.by_run.write().await.insert(new_run_id, session.id);
        session
    }

    pub async fn get(&self, session_id: ResourceId) -> Option<DebugSession> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn on_connect(&self, session_id: ResourceId, mode: ConnectionMode) -> Result<DebugSession> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::NotFound(session_id.to_string()))?;
        session.on_connect(mode)?;
        Ok(session.clone())
    }

    /// Resumes execution from the breakpoint. Returns the run id the
    /// caller should hand back to the pipeline executor to continue.
    pub async fn resume(&self, session_id: ResourceId) -> Result<ResourceId> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::NotFound(session_id.to_string()))?;
        session.resume()?;
        let run_id = session.pipeline_run_id;
        self.by_run.write().await.remove(&run_id);
        Ok(run_id)
    }

    pub async fn abort(&self, session_id: ResourceId) -> Result<ResourceId> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::NotFound(session_id.to_string()))?;
        session.abort()?;
        let run_id = session.pipeline_run_id;
        self.by_run.write().await.remove(&run_id);
        Ok(run_id)
    }

    pub async fn extend_timeout(
        &self,
        session_id: ResourceId,
        additional_seconds: i64,
    ) -> Result<chrono::DateTime<chrono::Utc>> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::NotFound(session_id.to_string()))?;
        session.extend_timeout(additional_seconds, chrono::Utc::now())
    }

    /// Sweeps sessions past `expires_at`, transitioning them to
    /// `timeout` and returning their ids (and associated run ids) so
    /// the caller can cancel the underlying pipeline run.
    pub async fn sweep_timeouts(&self) -> Vec<(ResourceId, ResourceId)> {
        let now = chrono::Utc::now();
        let mut sessions = self.sessions.write().await;
        let mut timed_out = Vec::new();
        for session in sessions.values_mut() {
            if session.is_expired(now) {
                let _ = session.timeout();
                timed_out.push((session.id, session.pipeline_run_id));
            }
        }
        drop(sessions);
        let mut by_run = self.by_run.write().await;
        for (_, run_id) in &timed_out {
            by_run.remove(run_id);
        }
        timed_out
    }

    pub async fn on_pipeline_complete(&self, pipeline_run_id: ResourceId) {
        let session_id = self.by_run.write().await.remove(&pipeline_run_id);
        if let Some(session_id) = session_id {
            if let Some(session) = self.sessions.write().await.get_mut(&session_id) {
                let _ = session.end("pipeline completed");
            }
        }
    }
}

#[async_trait::async_trait]
impl BreakpointObserver for DebugSessionRegistry {
    async fn should_pause(&self, pipeline_run_id: ResourceId, step_index: usize) -> Option<ResourceId> {
        let session_id = *self.by_run.read().await.get(&pipeline_run_id)?;
        let sessions = self.sessions.read().await;
        let session = sessions.get(&session_id)?;
        if session.breakpoints.contains(&step_index) {
            Some(session_id)
        } else {
            None
        }
    }

    async fn notify_breakpoint_hit(
        &self,
        session_id: ResourceId,
        step_index: usize,
        step_name: &str,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::NotFound(session_id.to_string()))?;
        session.on_breakpoint_hit(step_index, step_name)
    }
}

/// Periodic timeout-sweep loop (§4.9 "session timeouts"), intended to
/// be spawned once per process. `on_timeout` is handed each timed-out
/// run id so the caller can cancel the underlying pipeline run.
pub async fn run_timeout_monitor<F>(registry: Arc<DebugSessionRegistry>, on_timeout: F)
where
    F: Fn(ResourceId),
{
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        interval.tick().await;
        for (_session_id, run_id) in registry.sweep_timeouts().await {
            on_timeout(run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_pause_only_at_registered_breakpoints() {
        let registry = DebugSessionRegistry::new();
        let new_run = ResourceId::new();
        let original_run = ResourceId::new();
        registry.create(new_run, original_run, vec![2, 4]).await;

        assert!(registry.should_pause(new_run, 2).await.is_some());
        assert!(registry.should_pause(new_run, 3).await.is_none());
    }

    #[tokio::test]
    async fn resume_clears_run_index() {
        let registry = DebugSessionRegistry::new();
        let new_run = ResourceId::new();
        let session = registry.create(new_run, ResourceId::new(), vec![1]).await;

        registry.notify_breakpoint_hit(session.id, 1, "step-1").await.unwrap();
        let run_id = registry.resume(session.id).await.unwrap();
        assert_eq!(run_id, new_run);
        assert!(registry.should_pause(new_run, 1).await.is_none());
    }
}
