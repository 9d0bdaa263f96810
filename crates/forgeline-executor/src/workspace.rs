//! Docker-volume-backed workspace manager.
//!
//! Drives the [`forgeline_core::workspace::Workspace`] state machine against
//! real Docker volumes: one volume per pipeline run, named
//! `lazyaf-ws-<pipeline_run_id>`, shared by every step of that run through
//! the reference-counted acquire/release protocol.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::Docker;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use chrono::Utc;
use forgeline_core::workspace::{Workspace, WorkspaceState};
use forgeline_core::{Error, ResourceId, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Orphan sweep threshold: a `ready`/`failed` workspace idle longer than
/// this, whose owning pipeline run is terminal or missing, is eligible
/// for forced cleanup.
pub const ORPHAN_IDLE_THRESHOLD_SECONDS: i64 = 7200;

/// How often the background orphan sweep checks for idle workspaces.
pub const ORPHAN_SWEEP_INTERVAL_SECONDS: i64 = 30;

pub struct WorkspaceManager {
    docker: Docker,
    workspaces: Mutex<HashMap<ResourceId, Arc<Mutex<Workspace>>>>,
}

impl WorkspaceManager {
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the workspace for `pipeline_run_id`, creating it (and its
    /// backing volume) under an exclusive lock if it does not exist yet.
    /// Idempotent: a concurrent caller racing to create the same workspace
    /// observes the single winner's result.
    pub async fn get_or_create(
        &self,
        pipeline_run_id: ResourceId,
        repository_id: ResourceId,
    ) -> Result<Arc<Mutex<Workspace>>> {
        let mut workspaces = self.workspaces.lock().await;
        if let Some(existing) = workspaces.get(&pipeline_run_id) {
            return Ok(existing.clone());
        }

        let mut workspace = Workspace::new(pipeline_run_id, repository_id);
        let volume_name = workspace.volume_name();
        self.create_volume(&volume_name)
            .await
            .map_err(|e| Error::WorkspaceCreationError(format!("{pipeline_run_id}: {e}")))?;

        workspace
            .transition(WorkspaceState::Ready)
            .map_err(|e| Error::WorkspaceCreationError(e.to_string()))?;

        let handle = Arc::new(Mutex::new(workspace));
        workspaces.insert(pipeline_run_id, handle.clone());
        Ok(handle)
    }

    async fn create_volume(&self, volume_name: &str) -> std::result::Result<(), String> {
        if self.docker.inspect_volume(volume_name).await.is_ok() {
            debug!(volume = %volume_name, "volume already exists");
            return Ok(());
        }

        let options = CreateVolumeOptions {
            name: volume_name.to_string(),
            ..Default::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map_err(|e| e.to_string())?;
        info!(volume = %volume_name, "created workspace volume");
        Ok(())
    }

    /// Acquires the workspace for exclusive step use, bumping its
    /// reference count. The workspace must already exist.
    pub async fn acquire(&self, pipeline_run_id: ResourceId) -> Result<Arc<Mutex<Workspace>>> {
        let handle = {
            let workspaces = self.workspaces.lock().await;
            workspaces
                .get(&pipeline_run_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("workspace {pipeline_run_id}")))?
        };
        let mut workspace = handle.lock().await;
        workspace
            .acquire()
            .map_err(|e| Error::WorkspaceAcquisitionError(format!("{pipeline_run_id}: {e}")))?;
        drop(workspace);
        Ok(handle)
    }

    /// Releases one reference; the workspace returns to `ready` once the
    /// count reaches zero.
    pub async fn release(&self, pipeline_run_id: ResourceId) -> Result<()> {
        let workspaces = self.workspaces.lock().await;
        let Some(handle) = workspaces.get(&pipeline_run_id) else {
            return Err(Error::NotFound(format!("workspace {pipeline_run_id}")));
        };
        let mut workspace = handle.lock().await;
        workspace.release();
        Ok(())
    }

    /// Removes a workspace's volume and forgets it. The reference count
    /// must be zero unless `force` is set (the orphan sweeper's path).
    pub async fn cleanup(&self, pipeline_run_id: ResourceId, force: bool) -> Result<()> {
        let handle = {
            let workspaces = self.workspaces.lock().await;
            workspaces
                .get(&pipeline_run_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("workspace {pipeline_run_id}")))?
        };

        let volume_name = {
            let mut workspace = handle.lock().await;
            if !workspace.can_cleanup(force) {
                return Err(Error::Conflict(format!(
                    "workspace {pipeline_run_id} is still in use"
                )));
            }
            workspace
                .transition(WorkspaceState::Cleaning)
                .map_err(|e| Error::Internal(e.to_string()))?;
            workspace.volume_name()
        };

        match self.remove_volume(&volume_name).await {
            Ok(()) => {
                let mut workspace = handle.lock().await;
                workspace
                    .transition(WorkspaceState::Cleaned)
                    .map_err(|e| Error::Internal(e.to_string()))?;
                drop(workspace);
                let mut workspaces = self.workspaces.lock().await;
                workspaces.remove(&pipeline_run_id);
                Ok(())
            }
            Err(e) => {
                let mut workspace = handle.lock().await;
                let _ = workspace.mark_failed(e.clone());
                Err(Error::Internal(format!(
                    "cleanup of {pipeline_run_id} failed: {e}"
                )))
            }
        }
    }

    async fn remove_volume(&self, volume_name: &str) -> std::result::Result<(), String> {
        let options = RemoveVolumeOptions { force: true };
        match self.docker.remove_volume(volume_name, Some(options)).await {
            Ok(()) => {
                debug!(volume = %volume_name, "removed workspace volume");
                Ok(())
            }
            Err(e) => {
                warn!(volume = %volume_name, error = %e, "failed to remove volume");
                Err(e.to_string())
            }
        }
    }

    /// The pipeline run ids of every workspace currently tracked
    /// in-process, for callers that need to resolve run status outside
    /// the manager's own lock (the orphan sweep's caller).
    pub async fn tracked_ids(&self) -> Vec<ResourceId> {
        self.workspaces.lock().await.keys().copied().collect()
    }

    /// Snapshot of every tracked workspace, for operational inspection.
    pub async fn summaries(&self) -> Vec<Workspace> {
        let workspaces = self.workspaces.lock().await;
        let mut out = Vec::with_capacity(workspaces.len());
        for handle in workspaces.values() {
            out.push(handle.lock().await.clone());
        }
        out
    }

    /// Sweeps `ready`/`failed` workspaces idle past the threshold whose
    /// owning pipeline run is reported terminal or missing by
    /// `run_is_terminal_or_missing`, force-cleaning each one. Returns the
    /// ids actually cleaned.
    pub async fn sweep_orphans<F>(&self, run_is_terminal_or_missing: F) -> Vec<ResourceId>
    where
        F: Fn(ResourceId) -> bool,
    {
        let now = Utc::now();
        let candidates: Vec<ResourceId> = {
            let workspaces = self.workspaces.lock().await;
            let mut ids = Vec::new();
            for (id, handle) in workspaces.iter() {
                let workspace = handle.lock().await;
                if workspace.is_orphaned(now, ORPHAN_IDLE_THRESHOLD_SECONDS, run_is_terminal_or_missing(*id)) {
                    ids.push(*id);
                }
            }
            ids
        };

        let mut cleaned = Vec::new();
        for id in candidates {
            match self.cleanup(id, true).await {
                Ok(()) => cleaned.push(id),
                Err(e) => warn!(workspace = %id, error = %e, "orphan sweep cleanup failed"),
            }
        }
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphan_threshold_matches_two_hours() {
        assert_eq!(ORPHAN_IDLE_THRESHOLD_SECONDS, 7200);
    }
}
