//! Repository traits and implementations.

pub mod debug;
pub mod logs;
pub mod pipeline;
pub mod repository;
pub mod step_run;

pub use debug::{DebugSessionRepo, PgDebugSessionRepo};
pub use logs::{LogRecord, LogRepo, PgLogRepo};
pub use pipeline::{PgPipelineRepo, PipelineRepo};
pub use repository::{PgRepositoryRepo, RepositoryRepo};
pub use step_run::{PgStepRunRepo, StepRunRepo};
