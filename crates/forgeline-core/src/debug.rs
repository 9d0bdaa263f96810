//! Debug-rerun sessions (§4.9): pause a pipeline run at named
//! breakpoints and let an operator attach before resuming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, ResourceId, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugSessionState {
    Pending,
    WaitingAtBreakpoint,
    Connected,
    Ended,
    Timeout,
}

impl DebugSessionState {
    fn valid_targets(self) -> &'static [DebugSessionState] {
        use DebugSessionState::*;
        match self {
            Pending => &[WaitingAtBreakpoint, Ended, Timeout],
            WaitingAtBreakpoint => &[Connected, Ended, Timeout],
            Connected => &[Ended, Timeout],
            Ended | Timeout => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        self.valid_targets().is_empty()
    }

    pub fn can_transition_to(self, target: DebugSessionState) -> bool {
        self.valid_targets().contains(&target)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    Sidecar,
    Shell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugStateTransition {
    pub from_state: DebugSessionState,
    pub to_state: DebugSessionState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// A debug re-run of a previously failed/cancelled pipeline run,
/// paused before each breakpoint step index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugSession {
    pub id: ResourceId,
    pub pipeline_run_id: ResourceId,
    pub original_run_id: ResourceId,
    pub breakpoints: Vec<usize>,
    pub state: DebugSessionState,
    pub current_step_index: Option<usize>,
    pub current_step_name: Option<String>,
    pub connection_mode: Option<ConnectionMode>,
    pub sidecar_container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub breakpoint_hit_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub state_history: Vec<DebugStateTransition>,
}

pub const DEFAULT_SESSION_TIMEOUT_SECONDS: u64 = 1800;
pub const DEFAULT_MAX_TIMEOUT_SECONDS: u64 = 4 * 3600;

impl DebugSession {
    pub fn new(
        pipeline_run_id: ResourceId,
        original_run_id: ResourceId,
        breakpoints: Vec<usize>,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            pipeline_run_id,
            original_run_id,
            breakpoints,
            state: DebugSessionState::Pending,
            current_step_index: None,
            current_step_name: None,
            connection_mode: None,
            sidecar_container_id: None,
            created_at: Utc::now(),
            breakpoint_hit_at: None,
            connected_at: None,
            ended_at: None,
            expires_at: None,
            timeout_seconds: DEFAULT_SESSION_TIMEOUT_SECONDS,
            max_timeout_seconds: DEFAULT_MAX_TIMEOUT_SECONDS,
            state_history: Vec::new(),
        }
    }

    fn transition(&mut self, to: DebugSessionState, reason: Option<String>) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: format!("{:?}", self.state),
                to: format!("{to:?}"),
            });
        }
        self.state_history.push(DebugStateTransition {
            from_state: self.state,
            to_state: to,
            at: Utc::now(),
            reason,
        });
        self.state = to;
        Ok(())
    }

    pub fn on_breakpoint_hit(&mut self, step_index: usize, step_name: impl Into<String>) -> Result<()> {
        self.current_step_index = Some(step_index);
        self.current_step_name = Some(step_name.into());
        self.breakpoint_hit_at = Some(Utc::now());
        self.expires_at = Some(Utc::now() + chrono::Duration::seconds(self.timeout_seconds as i64));
        if self.state != DebugSessionState::WaitingAtBreakpoint {
            self.transition(
                DebugSessionState::WaitingAtBreakpoint,
                Some(format!("breakpoint at step {step_index}")),
            )?;
        }
        Ok(())
    }

    pub fn on_connect(&mut self, mode: ConnectionMode) -> Result<()> {
        if self.state != DebugSessionState::WaitingAtBreakpoint {
            return Err(Error::InvalidInput(format!(
                "cannot connect: session state is {:?}",
                self.state
            )));
        }
        self.connection_mode = Some(mode);
        self.connected_at = Some(Utc::now());
        self.transition(DebugSessionState::Connected, Some("client connected".into()))
    }

    pub fn resume(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            DebugSessionState::Connected | DebugSessionState::WaitingAtBreakpoint
        ) {
            return Err(Error::InvalidInput(format!(
                "can only resume from connected or waiting state, got {:?}",
                self.state
            )));
        }
        self.ended_at = Some(Utc::now());
        self.transition(DebugSessionState::Ended, Some("user resumed".into()))
    }

    pub fn abort(&mut self) -> Result<()> {
        self.ended_at = Some(Utc::now());
        self.end("user aborted")
    }

    pub fn end(&mut self, reason: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.ended_at = Some(Utc::now());
        self.transition(DebugSessionState::Ended, Some(reason.to_string()))
    }

    pub fn timeout(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.ended_at = Some(Utc::now());
        self.transition(DebugSessionState::Timeout, Some("session expired".into()))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }

    /// Extends `expires_at`, capped at `created_at + max_timeout_seconds`.
    pub fn extend_timeout(&mut self, additional_seconds: i64, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let current = self.expires_at.unwrap_or(now);
        let new_expiry = current + chrono::Duration::seconds(additional_seconds);
        let max_expiry = self.created_at + chrono::Duration::seconds(self.max_timeout_seconds as i64);
        if new_expiry > max_expiry {
            return Err(Error::InvalidInput(format!(
                "cannot extend beyond maximum timeout of {} hours",
                self.max_timeout_seconds / 3600
            )));
        }
        self.expires_at = Some(new_expiry);
        Ok(new_expiry)
    }
}

/// Resolves the circular-dependency note in §9 (the scheduler's
/// pipeline executor needs to ask "is there a debug session pausing
/// this run, and if so, should I stop before step N?" without
/// `forgeline-core` depending on `forgeline-scheduler`). Implemented
/// scheduler-side.
#[async_trait::async_trait]
pub trait BreakpointObserver: Send + Sync {
    /// Called before dispatching a step; returns the session id if
    /// the run should pause here instead of proceeding.
    async fn should_pause(&self, pipeline_run_id: ResourceId, step_index: usize) -> Option<ResourceId>;

    async fn notify_breakpoint_hit(
        &self,
        session_id: ResourceId,
        step_index: usize,
        step_name: &str,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> DebugSession {
        DebugSession::new(ResourceId::new(), ResourceId::new(), vec![2, 4])
    }

    #[test]
    fn full_pause_connect_resume_lifecycle() {
        let mut s = new_session();
        s.on_breakpoint_hit(2, "test").unwrap();
        assert_eq!(s.state, DebugSessionState::WaitingAtBreakpoint);
        s.on_connect(ConnectionMode::Shell).unwrap();
        assert_eq!(s.state, DebugSessionState::Connected);
        s.resume().unwrap();
        assert_eq!(s.state, DebugSessionState::Ended);
    }

    #[test]
    fn cannot_connect_before_breakpoint_hit() {
        let mut s = new_session();
        assert!(s.on_connect(ConnectionMode::Shell).is_err());
    }

    #[test]
    fn ended_sessions_ignore_further_end_calls() {
        let mut s = new_session();
        s.on_breakpoint_hit(2, "test").unwrap();
        s.abort().unwrap();
        assert_eq!(s.state, DebugSessionState::Ended);
        s.end("second end").unwrap();
        assert_eq!(s.state, DebugSessionState::Ended);
    }

    #[test]
    fn extend_timeout_rejects_past_max() {
        let mut s = new_session();
        s.timeout_seconds = 60;
        s.max_timeout_seconds = 120;
        s.on_breakpoint_hit(2, "test").unwrap();
        let now = Utc::now();
        assert!(s.extend_timeout(30, now).is_ok());
        assert!(s.extend_timeout(600, now).is_err());
    }
}
