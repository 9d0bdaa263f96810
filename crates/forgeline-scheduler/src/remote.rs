//! Remote executor (§4.7): pushes steps to connected worker agents over
//! a duplex channel and tracks each worker's state machine.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use forgeline_core::worker::{Worker, WorkerState, ACK_TIMEOUT_SECONDS, DEATH_TIMEOUT_SECONDS};
use forgeline_core::{Error, ResourceId, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{info, warn};

use crate::router::WorkerLabels;

/// Duplex worker-protocol message, shared with the API layer's WS route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    ExecuteStep {
        step_id: String,
        execution_key: String,
        config: forgeline_core::step::ExecutionConfig,
    },
    Ack { step_id: String },
    Heartbeat,
    Log { step_id: String, lines: Vec<String> },
    StepComplete {
        step_id: String,
        exit_code: i32,
        error: Option<String>,
    },
}

/// One registered worker: its domain state machine plus the outbound
/// half of its duplex channel.
struct Connection {
    worker: Worker,
    labels: WorkerLabels,
    sender: mpsc::Sender<WorkerMessage>,
}

#[derive(Default)]
pub struct RemoteExecutor {
    connections: RwLock<HashMap<ResourceId, Connection>>,
    pending_acks: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl RemoteExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly connected worker and transitions it
    /// `connecting` → `idle`.
    pub async fn register(
        &self,
        name: impl Into<String>,
        runner_type: impl Into<String>,
        labels: Vec<String>,
        sender: mpsc::Sender<WorkerMessage>,
    ) -> Result<ResourceId> {
        let mut worker = Worker::new(name, runner_type, labels.clone());
        worker
            .transition(WorkerState::Connecting, None)
            .map_err(|e| Error::Internal(e.to_string()))?;
        worker
            .transition(WorkerState::Idle, None)
            .map_err(|e| Error::Internal(e.to_string()))?;

        let worker_labels = parse_labels(&labels);
        let id = worker.id;
        self.connections.write().await.insert(
            id,
            Connection {
                worker,
                labels: worker_labels,
                sender,
            },
        );
        Ok(id)
    }

    /// Finds a connected, idle worker whose type and labels satisfy the
    /// requirement predicate.
    pub async fn find_idle(
        &self,
        runner_type: &str,
        required_arch: &Option<String>,
        required_has: &[String],
    ) -> Option<ResourceId> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .find(|(_, conn)| {
                conn.worker.is_available()
                    && (runner_type == "any" || conn.worker.runner_type == runner_type || conn.worker.runner_type == "any")
                    && crate::router::labels_satisfy(&conn.labels, required_arch, required_has)
            })
            .map(|(id, _)| *id)
    }

    /// Push-step protocol (§4.7): pre-creates a pending ACK future, moves
    /// the worker idle → assigned, sends the execute message, and awaits
    /// the ACK within `ACK_TIMEOUT_SECONDS`. On timeout the worker is
    /// marked `dead` and an ack-timeout error is raised; on ACK the
    /// worker moves assigned → busy.
    pub async fn push_step(
        &self,
        worker_id: ResourceId,
        step_id: String,
        execution_key: String,
        config: forgeline_core::step::ExecutionConfig,
    ) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(step_id.clone(), ack_tx);

        let sender = {
            let mut connections = self.connections.write().await;
            let conn = connections
                .get_mut(&worker_id)
                .ok_or_else(|| Error::RunnerNotConnected(worker_id.to_string()))?;
            conn.worker
                .assign_step(step_id.clone())
                .map_err(|e| Error::Internal(e.to_string()))?;
            conn.sender.clone()
        };

        sender
            .send(WorkerMessage::ExecuteStep {
                step_id: step_id.clone(),
                execution_key,
                config,
            })
            .await
            .map_err(|_| Error::RunnerNotConnected(worker_id.to_string()))?;

        let ack_deadline = std::time::Duration::from_secs(ACK_TIMEOUT_SECONDS);
        match tokio::time::timeout(ack_deadline, ack_rx).await {
            Ok(Ok(())) => {
                let mut connections = self.connections.write().await;
                if let Some(conn) = connections.get_mut(&worker_id) {
                    conn.worker
                        .transition(WorkerState::Busy, None)
                        .map_err(|e| Error::Internal(e.to_string()))?;
                }
                Ok(())
            }
            _ => {
                self.pending_acks.lock().await.remove(&step_id);
                let mut connections = self.connections.write().await;
                if let Some(conn) = connections.get_mut(&worker_id) {
                    let _ = conn.worker.transition(WorkerState::Dead, Some("ack timeout".to_string()));
                }
                Err(Error::AckTimeout(worker_id.to_string()))
            }
        }
    }

    /// Resolves the pending ACK future for `step_id`, if any.
    pub async fn on_ack(&self, step_id: &str) {
        if let Some(tx) = self.pending_acks.lock().await.remove(step_id) {
            let _ = tx.send(());
        }
    }

    pub async fn on_heartbeat(&self, worker_id: ResourceId) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(&worker_id) {
            conn.worker.update_heartbeat();
        }
    }

    /// `step_complete`: busy → idle, clears the held step. Returns the
    /// cleared step id (if any) so the caller can forward completion to
    /// the pipeline executor.
    pub async fn on_step_complete(&self, worker_id: ResourceId) -> Option<String> {
        let mut connections = self.connections.write().await;
        let conn = connections.get_mut(&worker_id)?;
        let step_id = conn.worker.current_step_id.take();
        let _ = conn.worker.complete_step();
        step_id
    }

    /// Socket-close handler: removes the connection, transitions to
    /// `disconnected`; if the worker was holding a step, returns its id
    /// so the caller can requeue it.
    pub async fn on_disconnect(&self, worker_id: ResourceId) -> Option<String> {
        let mut connections = self.connections.write().await;
        let conn = connections.remove(&worker_id)?;
        let mut worker = conn.worker;
        let held_step = worker.current_step_id.clone();
        let _ = worker.transition(WorkerState::Disconnected, None);
        held_step
    }

    /// Timeout monitor: marks any
    /// `assigned`/`busy` worker whose heartbeat is stale as `dead`,
    /// returning the ids marked (and the step each was holding) so the
    /// caller can requeue.
    pub async fn sweep_dead_workers(&self) -> Vec<(ResourceId, Option<String>)> {
        let now = Utc::now();
        let mut connections = self.connections.write().await;
        let mut dead = Vec::new();
        for (id, conn) in connections.iter_mut() {
            if matches!(conn.worker.state, WorkerState::Assigned | WorkerState::Busy)
                && !conn.worker.is_alive(DEATH_TIMEOUT_SECONDS as i64, now)
            {
                let held_step = conn.worker.current_step_id.clone();
                let _ = conn.worker.transition(WorkerState::Dead, Some("heartbeat timeout".to_string()));
                warn!(worker = %id, step = ?held_step, "worker marked dead on heartbeat timeout");
                dead.push((*id, held_step));
            }
        }
        dead
    }

    pub async fn worker_state(&self, worker_id: ResourceId) -> Option<WorkerState> {
        self.connections.read().await.get(&worker_id).map(|c| c.worker.state)
    }

    /// Snapshot of every connected worker, for operational inspection.
    pub async fn list_workers(&self) -> Vec<WorkerSummary> {
        self.connections
            .read()
            .await
            .values()
            .map(|c| WorkerSummary {
                id: c.worker.id,
                name: c.worker.name.clone(),
                runner_type: c.worker.runner_type.clone(),
                labels: c.worker.labels.clone(),
                state: c.worker.state,
                current_step_id: c.worker.current_step_id.clone(),
            })
            .collect()
    }
}

/// Operational snapshot of a connected worker (§4.14 CLI/debugging).
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: ResourceId,
    pub name: String,
    pub runner_type: String,
    pub labels: Vec<String>,
    pub state: WorkerState,
    pub current_step_id: Option<String>,
}

fn parse_labels(labels: &[String]) -> WorkerLabels {
    let mut arch = None;
    let mut has = Vec::new();
    for label in labels {
        if let Some(value) = label.strip_prefix("arch:") {
            arch = Some(value.to_string());
        } else {
            has.push(label.clone());
        }
    }
    WorkerLabels { arch, has }
}

/// Periodic timeout-monitor loop (§4.7 "every 5s"), intended to be
/// spawned once per process.
pub async fn run_timeout_monitor(executor: Arc<RemoteExecutor>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
    loop {
        interval.tick().await;
        let dead = executor.sweep_dead_workers().await;
        for (worker_id, step_id) in dead {
            if let Some(step_id) = step_id {
                info!(worker = %worker_id, step = %step_id, "requeuing step held by dead worker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arch_label() {
        let labels = parse_labels(&["arch:arm64".to_string(), "gpu".to_string()]);
        assert_eq!(labels.arch, Some("arm64".to_string()));
        assert_eq!(labels.has, vec!["gpu".to_string()]);
    }

    #[tokio::test]
    async fn register_makes_worker_idle_and_findable() {
        let executor = RemoteExecutor::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = executor
            .register("runner-1", "claude-code", vec!["gpu".to_string()], tx)
            .await
            .unwrap();

        assert_eq!(executor.worker_state(id).await, Some(WorkerState::Idle));
        let found = executor.find_idle("claude-code", &None, &["gpu".to_string()]).await;
        assert_eq!(found, Some(id));
    }

    #[tokio::test]
    async fn disconnect_clears_held_step() {
        let executor = RemoteExecutor::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = executor.register("runner-1", "any", vec![], tx).await.unwrap();

        {
            let mut connections = executor.connections.write().await;
            let conn = connections.get_mut(&id).unwrap();
            conn.worker.assign_step("step-1").unwrap();
        }

        let held = executor.on_disconnect(id).await;
        assert_eq!(held, Some("step-1".to_string()));
    }
}
