//! Job scheduling and pipeline execution for the Forgeline pipeline
//! orchestrator.
//!
//! Ties together routing, the in-process job queue, local dispatch, and
//! the graph/legacy pipeline executor. Distributed job claiming
//! (`SKIP LOCKED`) is not needed here: the job queue, workers, and
//! debug sessions are in-process state (§5 "Shared-resource policy"),
//! not rows a second process could race to claim.

pub mod debug;
pub mod dispatcher;
pub mod idempotency;
pub mod orchestrator;
pub mod queue;
pub mod remote;
pub mod router;

pub use debug::DebugSessionRegistry;
pub use dispatcher::{run_dispatch_loop, run_job};
pub use idempotency::IdempotencyStore;
pub use orchestrator::{CardOutcome, PipelineEvent, PipelineExecutor};
pub use queue::{JobQueue, JobStatus, QueuedJob};
pub use remote::{RemoteExecutor, WorkerMessage, WorkerSummary};
pub use router::{labels_satisfy, ExecutionRouter, RouteDecision, RoutingError, RoutingRequirements, WorkerLabels};
