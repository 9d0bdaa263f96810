//! Worker state machine (§4.6): connection lifecycle for a remote
//! execution agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, ResourceId, Result};

pub const ACK_TIMEOUT_SECONDS: u64 = 5;
pub const DEATH_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Idle,
    Assigned,
    Busy,
    Dead,
}

impl WorkerState {
    fn valid_targets(self) -> &'static [WorkerState] {
        use WorkerState::*;
        match self {
            Disconnected => &[Connecting],
            Connecting => &[Idle, Disconnected],
            Idle => &[Assigned, Disconnected],
            Assigned => &[Busy, Dead, Disconnected],
            Busy => &[Idle, Dead, Disconnected],
            Dead => &[Connecting],
        }
    }

    pub fn can_transition_to(self, target: WorkerState) -> bool {
        self.valid_targets().contains(&target)
    }
}

/// One recorded transition, kept for observability and the admin
/// worker-history view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTransition {
    pub from_state: WorkerState,
    pub to_state: WorkerState,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// A connected (or previously connected) remote execution agent and
/// its state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: ResourceId,
    pub name: String,
    pub runner_type: String,
    pub labels: Vec<String>,
    pub state: WorkerState,
    pub current_step_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub history: Vec<WorkerTransition>,
}

impl Worker {
    pub fn new(name: impl Into<String>, runner_type: impl Into<String>, labels: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ResourceId::new(),
            name: name.into(),
            runner_type: runner_type.into(),
            labels,
            state: WorkerState::Disconnected,
            current_step_id: None,
            last_heartbeat: now,
            history: Vec::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == WorkerState::Idle
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            WorkerState::Idle | WorkerState::Assigned | WorkerState::Busy
        )
    }

    pub fn is_alive(&self, timeout_seconds: i64, now: DateTime<Utc>) -> bool {
        (now - self.last_heartbeat).num_seconds() < timeout_seconds
    }

    /// Entering `Idle` or `Busy` refreshes the heartbeat, matching a
    /// state change doubling as a liveness signal.
    pub fn transition(&mut self, to: WorkerState, reason: Option<String>) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: format!("{:?}", self.state),
                to: format!("{to:?}"),
            });
        }
        let now = Utc::now();
        self.history.push(WorkerTransition {
            from_state: self.state,
            to_state: to,
            reason,
            at: now,
        });
        self.state = to;
        if matches!(to, WorkerState::Idle | WorkerState::Busy) {
            self.last_heartbeat = now;
        }
        if to == WorkerState::Idle {
            self.current_step_id = None;
        }
        Ok(())
    }

    /// Pushes a step to an idle worker (§4.5 dispatch). Leaves the
    /// step id in place through `Dead` so a crash can be detected as
    /// "this step needs requeueing", per the source's recovery note.
    pub fn assign_step(&mut self, step_id: impl Into<String>) -> Result<()> {
        self.transition(WorkerState::Assigned, None)?;
        self.current_step_id = Some(step_id.into());
        Ok(())
    }

    pub fn complete_step(&mut self) -> Result<()> {
        self.transition(WorkerState::Idle, None)
    }

    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_job_lifecycle() {
        let mut w = Worker::new("agent-1", "claude-code", vec![]);
        w.transition(WorkerState::Connecting, None).unwrap();
        w.transition(WorkerState::Idle, None).unwrap();
        w.assign_step("step-123").unwrap();
        assert_eq!(w.state, WorkerState::Assigned);
        assert_eq!(w.current_step_id.as_deref(), Some("step-123"));
        w.transition(WorkerState::Busy, None).unwrap();
        w.complete_step().unwrap();
        assert_eq!(w.state, WorkerState::Idle);
        assert!(w.current_step_id.is_none());
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut w = Worker::new("agent-1", "claude-code", vec![]);
        assert!(w.transition(WorkerState::Idle, None).is_err());
        w.transition(WorkerState::Connecting, None).unwrap();
        assert!(w.transition(WorkerState::Busy, None).is_err());
        w.transition(WorkerState::Idle, None).unwrap();
        assert!(w.transition(WorkerState::Busy, None).is_err());
    }

    #[test]
    fn death_preserves_step_for_recovery() {
        let mut w = Worker::new("agent-1", "claude-code", vec![]);
        w.transition(WorkerState::Connecting, None).unwrap();
        w.transition(WorkerState::Idle, None).unwrap();
        w.assign_step("step-123").unwrap();
        w.transition(WorkerState::Busy, None).unwrap();
        w.transition(WorkerState::Dead, Some("heartbeat timeout".into()))
            .unwrap();
        assert_eq!(w.current_step_id.as_deref(), Some("step-123"));
        assert!(!w.is_connected());
    }

    #[test]
    fn dead_must_reconnect_through_connecting() {
        let mut w = Worker::new("agent-1", "claude-code", vec![]);
        w.transition(WorkerState::Connecting, None).unwrap();
        w.transition(WorkerState::Idle, None).unwrap();
        w.assign_step("s").unwrap();
        w.transition(WorkerState::Dead, None).unwrap();
        assert!(w.transition(WorkerState::Idle, None).is_err());
        w.transition(WorkerState::Connecting, None).unwrap();
        w.transition(WorkerState::Idle, None).unwrap();
        assert_eq!(w.state, WorkerState::Idle);
    }
}
