//! Observable event stream (§6 "Observable events"): every subscriber
//! sees the same per-run ordering; channel filtering works the same
//! way the teacher's dashboard broadcaster did, just over a different
//! event catalog.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use forgeline_core::ResourceId;
use forgeline_core::debug::DebugSessionState;
use forgeline_core::pipeline::RunStatus;
use forgeline_scheduler::orchestrator::{CardOutcome, PipelineEvent};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::AppState;

/// One entry of the observable event catalog (§6). Every variant
/// carries the run id its channel is keyed on.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    CardUpdated { card_id: ResourceId, outcome: String },
    CardDeleted { card_id: ResourceId },
    JobStatus { run_id: ResourceId, step_id: String, job_id: ResourceId },
    PipelineRunStatus { run_id: ResourceId, status: RunStatus },
    StepRunStatus { run_id: ResourceId, step_id: String, success: bool },
    DebugBreakpoint { session_id: ResourceId, run_id: ResourceId, step_index: usize, step_name: String },
    DebugStatus { session_id: ResourceId, state: DebugSessionState },
    DebugResume { session_id: ResourceId, run_id: ResourceId },
}

impl DomainEvent {
    /// The run id a subscriber's `run:<id>` channel filters on, where
    /// the event carries one.
    fn run_channel(&self) -> Option<ResourceId> {
        match self {
            DomainEvent::JobStatus { run_id, .. } => Some(*run_id),
            DomainEvent::PipelineRunStatus { run_id, .. } => Some(*run_id),
            DomainEvent::StepRunStatus { run_id, .. } => Some(*run_id),
            DomainEvent::DebugBreakpoint { run_id, .. } => Some(*run_id),
            DomainEvent::DebugResume { run_id, .. } => Some(*run_id),
            DomainEvent::CardUpdated { .. } | DomainEvent::CardDeleted { .. } | DomainEvent::DebugStatus { .. } => None,
        }
    }

    pub fn from_pipeline_event(event: PipelineEvent) -> Self {
        match event {
            PipelineEvent::JobQueued { run_id, step_id, job_id } => {
                DomainEvent::JobStatus { run_id, step_id, job_id }
            }
            PipelineEvent::StepCompleted { run_id, step_id, success } => {
                DomainEvent::StepRunStatus { run_id, step_id, success }
            }
            PipelineEvent::PipelineRunStatus { run_id, status } => {
                DomainEvent::PipelineRunStatus { run_id, status }
            }
            PipelineEvent::CardUpdated { card_id, outcome } => DomainEvent::CardUpdated {
                card_id,
                outcome: match outcome {
                    CardOutcome::Done => "done".to_string(),
                    CardOutcome::Todo => "todo".to_string(),
                    CardOutcome::Failed => "failed".to_string(),
                },
            },
            PipelineEvent::PipelineTriggered { pipeline_id } => DomainEvent::PipelineRunStatus {
                run_id: pipeline_id,
                status: RunStatus::Pending,
            },
        }
    }
}

/// Broadcaster for observable events.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<DomainEvent>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Send an event to all connected subscribers.
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket upgrade handler for observers subscribing to run/card
/// channels.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let broadcaster = state.broadcaster.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, broadcaster))
}

async fn handle_socket(socket: WebSocket, broadcaster: Arc<Broadcaster>) {
    info!("observer socket established");

    let (mut sender, mut receiver) = socket.split();
    let mut subscriptions: HashSet<String> = HashSet::new();
    let mut broadcast_rx = broadcaster.subscribe();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(cmd) = serde_json::from_str::<WsCommand>(&text) {
                            match cmd {
                                WsCommand::Subscribe { channel } => {
                                    info!(channel = %channel, "observer subscribed");
                                    subscriptions.insert(channel.clone());
                                    let response = WsResponse::Subscribed { channel };
                                    if let Ok(json) = serde_json::to_string(&response) {
                                        let _ = sender.send(Message::Text(json.into())).await;
                                    }
                                }
                                WsCommand::Unsubscribe { channel } => {
                                    info!(channel = %channel, "observer unsubscribed");
                                    subscriptions.remove(&channel);
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("observer socket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "observer socket error");
                        break;
                    }
                    _ => {}
                }
            }

            event = broadcast_rx.recv() => {
                match event {
                    Ok(event) => {
                        let channel = event.run_channel().map(|id| format!("run:{id}"));
                        let matches = subscriptions.contains("*")
                            || channel.as_ref().is_some_and(|c| subscriptions.contains(c))
                            || (channel.is_none() && subscriptions.contains("cards"));

                        if matches {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if sender.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        warn!("observer socket lagging, skipping messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsResponse {
    Subscribed { channel: String },
}
