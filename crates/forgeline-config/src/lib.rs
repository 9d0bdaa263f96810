//! Configuration parsing for the Forgeline pipeline orchestrator.
//!
//! - `pipeline`: the §6 "Graph file format" JSON document into a
//!   `PipelineGraph`.
//! - `system`: process-wide settings (§4.13) from a KDL document.

pub mod error;
pub mod pipeline;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::parse_graph;
pub use system::ProcessConfig;
