//! Shared error taxonomy.
//!
//! Crate-local errors (db, executor, scheduler) wrap into this type at
//! their boundary rather than replacing it, so a `StepRun`'s recorded
//! error string always comes from one of these variants' `Display`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("container create failed: {0}")]
    ContainerCreateFailed(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("workspace creation failed: {0}")]
    WorkspaceCreationError(String),

    #[error("workspace acquisition failed: {0}")]
    WorkspaceAcquisitionError(String),

    #[error("runner not connected: {0}")]
    RunnerNotConnected(String),

    #[error("ack timeout waiting on worker {0}")]
    AckTimeout(String),

    #[error("remote execution is disabled")]
    RemoteDisabled,

    #[error("git error: {0}")]
    Git(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
