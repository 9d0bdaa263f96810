//! The `Repository` entity (§3): a named source project with an
//! internal bare clone.

use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// A source repository. The internal bare clone hosted by the git
/// server (see `forgeline-git`) is the authoritative store; `remote_url`
/// is advisory only and never consulted by the pipeline executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: ResourceId,
    pub name: String,
    pub default_branch: String,
    pub remote_url: Option<String>,
    /// Only ingested repositories may be operated on (pipelines
    /// triggered, steps dispatched, merges performed).
    pub ingested: bool,
}

impl Repository {
    pub fn new(name: impl Into<String>, default_branch: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            name: name.into(),
            default_branch: default_branch.into(),
            remote_url: None,
            ingested: false,
        }
    }
}
