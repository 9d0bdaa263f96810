//! Worker duplex-channel endpoint (§6 "Worker duplex-channel
//! protocol"): a connected worker sends exactly one `register` on
//! open, then any number of `ack`/`heartbeat`/`log`/`step_complete`
//! messages; the backend pushes `execute_step`/`ping`. On socket close
//! with an in-flight step, the held job is released back to the queue.
//!
//! `step_id` on the wire is the step run's `ResourceId` (the same
//! identifier `RemoteExecutor::push_step` assigns a worker to) —
//! distinct from the execution key carried inside `execute_step`.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use forgeline_core::ResourceId;
use forgeline_db::{LogRepo, StepRunRepo};
use forgeline_scheduler::WorkerSummary;
use forgeline_scheduler::queue::QueuedJob;
use forgeline_scheduler::remote::WorkerMessage;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::AppState;
use crate::completion::handle_step_completion;

/// Worker operational-state listing (§4.14 CLI "print worker state").
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_workers))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerSummary>> {
    Json(state.remote.list_workers().await)
}

/// Inbound half of the duplex protocol: everything a worker can send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
    Register {
        name: String,
        runner_type: String,
        #[serde(default)]
        labels: Vec<String>,
    },
    Ack {
        step_id: String,
    },
    Heartbeat,
    Log {
        step_id: String,
        lines: Vec<String>,
    },
    StepComplete {
        step_id: String,
        exit_code: i32,
        error: Option<String>,
    },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_worker_socket(socket, state))
}

async fn handle_worker_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<WorkerMessage>(64);

    let Some(worker_id) = await_registration(&mut receiver, &state, out_tx.clone()).await else {
        return;
    };

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(message) = outbound else { break };
                let Ok(json) = serde_json::to_string(&message) else { continue };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&state, worker_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(worker_id = %worker_id, error = %e, "worker socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(step_id) = state.remote.on_disconnect(worker_id).await {
        requeue_step(&state, &step_id).await;
    }
}

/// Blocks until the worker's first message arrives and is a valid
/// `register`; any other first message, or a closed socket, ends the
/// connection without registering a worker.
async fn await_registration(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    state: &AppState,
    out_tx: mpsc::Sender<WorkerMessage>,
) -> Option<ResourceId> {
    while let Some(msg) = receiver.next().await {
        let Ok(Message::Text(text)) = msg else { continue };
        let Ok(InboundMessage::Register { name, runner_type, labels }) =
            serde_json::from_str::<InboundMessage>(&text)
        else {
            warn!("worker socket's first message was not a valid register");
            return None;
        };

        return match state.remote.register(name, runner_type, labels, out_tx).await {
            Ok(id) => {
                info!(worker_id = %id, "worker registered");
                Some(id)
            }
            Err(e) => {
                warn!(error = %e, "worker registration failed");
                None
            }
        };
    }
    None
}

async fn handle_inbound(state: &AppState, worker_id: ResourceId, text: &str) {
    let Ok(message) = serde_json::from_str::<InboundMessage>(text) else {
        warn!(worker_id = %worker_id, "ignoring malformed worker message");
        return;
    };

    match message {
        InboundMessage::Register { .. } => {
            warn!(worker_id = %worker_id, "ignoring duplicate register on an already-registered socket");
        }
        InboundMessage::Ack { step_id } => state.remote.on_ack(&step_id).await,
        InboundMessage::Heartbeat => state.remote.on_heartbeat(worker_id).await,
        InboundMessage::Log { step_id, lines } => {
            let Some(job) = find_job_by_step_id(state, &step_id).await else {
                warn!(worker_id = %worker_id, step_id, "log for unknown step");
                return;
            };
            let entries: Vec<(String, String)> =
                lines.into_iter().map(|l| ("stdout".to_string(), l)).collect();
            if let Err(e) = state.log_repo.append_logs_batch(job.pipeline_run_id, &step_id, &entries).await {
                warn!(worker_id = %worker_id, step_id, error = %e, "failed to store worker log batch");
            }
        }
        InboundMessage::StepComplete { step_id, exit_code, error } => {
            if let Some(completed_step_id) = state.remote.on_step_complete(worker_id).await {
                if completed_step_id != step_id {
                    warn!(worker_id = %worker_id, expected = %completed_step_id, got = %step_id, "step_complete for unexpected step");
                }
            }
            complete_remote_step(state, &step_id, exit_code, error).await;
        }
    }
}

/// Feeds a worker's terminal result into the same completion path the
/// local dispatch loop uses, keyed off `step_id` (the step run id).
async fn complete_remote_step(state: &AppState, step_id: &str, exit_code: i32, error: Option<String>) {
    let Some(job) = find_job_by_step_id(state, step_id).await else {
        warn!(step_id, "step_complete for unknown step");
        return;
    };

    let result = forgeline_core::step::StepResult {
        success: exit_code == 0 && error.is_none(),
        exit_code,
        logs: String::new(),
        error,
        duration_ms: 0,
        container_id: None,
    };

    if result.success {
        state.queue.complete(job.id).await;
    } else {
        state
            .queue
            .fail(job.id, result.error.clone().unwrap_or_else(|| "step failed".to_string()))
            .await;
    }
    handle_step_completion(Arc::new(state.clone()), job, result).await;
}

/// The in-process queue has no secondary index on step run id; this
/// path and a disconnect-triggered requeue are the only callers, and
/// both are rare enough that a scan is the right tradeoff against
/// adding an index the queue's own tests never exercise.
async fn find_job_by_step_id(state: &AppState, step_id: &str) -> Option<QueuedJob> {
    let step_run_id: ResourceId = step_id.parse().ok()?;
    let step_run = state.step_run_repo.get(step_run_id).await.ok()?;
    state
        .queue
        .active_for_run(step_run.pipeline_run_id)
        .await
        .into_iter()
        .find(|job| job.step_run_id == step_run_id)
}

async fn requeue_step(state: &AppState, step_id: &str) {
    if let Some(job) = find_job_by_step_id(state, step_id).await {
        state.queue.release(job.id).await;
        info!(step_id, "requeued step after worker disconnect");
    }
}
