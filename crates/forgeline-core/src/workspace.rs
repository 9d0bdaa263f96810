//! Workspace state machine (§4.3): a per-pipeline-run Docker volume,
//! reference-counted across concurrently executing steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, ResourceId, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    Creating,
    Ready,
    InUse,
    Cleaning,
    Cleaned,
    Failed,
}

impl WorkspaceState {
    fn valid_targets(self) -> &'static [WorkspaceState] {
        use WorkspaceState::*;
        match self {
            Creating => &[Ready, Failed],
            Ready => &[InUse, Cleaning],
            InUse => &[Ready, Cleaning],
            Cleaning => &[Cleaned, Failed],
            Cleaned => &[],
            Failed => &[Cleaning],
        }
    }

    pub fn can_transition_to(self, target: WorkspaceState) -> bool {
        self.valid_targets().contains(&target)
    }
}

/// The Docker volume backing one pipeline run's workspace.
///
/// The volume name `lazyaf-ws-<pipeline_run_id>` is part of the wire
/// contract with the executor and is not an internal naming choice —
/// see `Workspace::volume_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: ResourceId,
    pub pipeline_run_id: ResourceId,
    pub repository_id: ResourceId,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub state: WorkspaceState,
    pub use_count: u32,
    pub last_activity_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl Workspace {
    pub fn new(pipeline_run_id: ResourceId, repository_id: ResourceId) -> Self {
        Self {
            id: ResourceId::new(),
            pipeline_run_id,
            repository_id,
            branch: None,
            commit_sha: None,
            state: WorkspaceState::Creating,
            use_count: 0,
            last_activity_at: Utc::now(),
            error: None,
        }
    }

    pub fn volume_name(&self) -> String {
        format!("lazyaf-ws-{}", self.pipeline_run_id)
    }

    pub fn transition(&mut self, to: WorkspaceState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: format!("{:?}", self.state),
                to: format!("{to:?}"),
            });
        }
        self.state = to;
        self.last_activity_at = Utc::now();
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.error = Some(error.into());
        self.transition(WorkspaceState::Failed)
    }

    /// Acquires a reference for concurrent step execution. Only
    /// callable from `Ready`/`InUse`; increments the refcount and
    /// moves to `InUse`.
    pub fn acquire(&mut self) -> Result<()> {
        match self.state {
            WorkspaceState::Ready => self.transition(WorkspaceState::InUse)?,
            WorkspaceState::InUse => {}
            other => {
                return Err(Error::WorkspaceAcquisitionError(format!(
                    "workspace is in state {other:?}, cannot acquire"
                )))
            }
        }
        self.use_count += 1;
        self.last_activity_at = Utc::now();
        Ok(())
    }

    /// Releases one reference. Drops back to `Ready` only when the
    /// last reference is released.
    pub fn release(&mut self) {
        if self.use_count == 0 {
            return;
        }
        self.use_count -= 1;
        self.last_activity_at = Utc::now();
        if self.use_count == 0 && self.state == WorkspaceState::InUse {
            self.state = WorkspaceState::Ready;
        }
    }

    pub fn can_cleanup(&self, force: bool) -> bool {
        force || self.use_count == 0
    }

    /// Orphan-sweep eligibility (§5 "2h inactivity threshold"): ready
    /// or failed, idle beyond `threshold_seconds`, and belonging to a
    /// run that has reached a terminal status (or no longer exists).
    pub fn is_orphaned(
        &self,
        now: DateTime<Utc>,
        threshold_seconds: i64,
        run_is_terminal_or_missing: bool,
    ) -> bool {
        matches!(self.state, WorkspaceState::Ready | WorkspaceState::Failed)
            && (now - self.last_activity_at).num_seconds() >= threshold_seconds
            && run_is_terminal_or_missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_ws() -> Workspace {
        Workspace::new(ResourceId::new(), ResourceId::new())
    }

    #[test]
    fn volume_name_matches_wire_format() {
        let run_id = ResourceId::new();
        let ws = Workspace::new(run_id, ResourceId::new());
        assert_eq!(ws.volume_name(), format!("lazyaf-ws-{run_id}"));
    }

    #[test]
    fn acquire_release_refcounting() {
        let mut ws = new_ws();
        ws.transition(WorkspaceState::Ready).unwrap();
        ws.acquire().unwrap();
        ws.acquire().unwrap();
        assert_eq!(ws.use_count, 2);
        assert_eq!(ws.state, WorkspaceState::InUse);
        ws.release();
        assert_eq!(ws.state, WorkspaceState::InUse);
        ws.release();
        assert_eq!(ws.state, WorkspaceState::Ready);
        assert_eq!(ws.use_count, 0);
    }

    #[test]
    fn cannot_acquire_while_cleaning() {
        let mut ws = new_ws();
        ws.transition(WorkspaceState::Ready).unwrap();
        ws.transition(WorkspaceState::Cleaning).unwrap();
        assert!(ws.acquire().is_err());
    }

    #[test]
    fn cannot_cleanup_in_use_unless_forced() {
        let mut ws = new_ws();
        ws.transition(WorkspaceState::Ready).unwrap();
        ws.acquire().unwrap();
        assert!(!ws.can_cleanup(false));
        assert!(ws.can_cleanup(true));
    }

    #[test]
    fn orphan_detection_requires_terminal_run_and_idle_threshold() {
        let mut ws = new_ws();
        ws.transition(WorkspaceState::Ready).unwrap();
        ws.last_activity_at = Utc::now() - chrono::Duration::hours(3);
        assert!(ws.is_orphaned(Utc::now(), 7200, true));
        assert!(!ws.is_orphaned(Utc::now(), 7200, false));

        ws.last_activity_at = Utc::now();
        assert!(!ws.is_orphaned(Utc::now(), 7200, true));
    }
}
