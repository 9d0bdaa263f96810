//! Execution router (§4.5): decides whether a step runs on the local
//! Docker executor or is pushed to a connected remote worker, and if
//! remote, which worker / label set it must satisfy.

use std::collections::HashMap;

use forgeline_core::ResourceId;
use serde::{Deserialize, Serialize};

/// Routing input carried alongside a step's resolved execution config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRequirements {
    pub arch: Option<String>,
    pub has: Vec<String>,
    pub runner_id: Option<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteDecision {
    Local,
    Remote {
        required_worker: Option<ResourceId>,
        required_arch: Option<String>,
        required_labels: Vec<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("step requires remote execution but remote execution is disabled")]
    RemoteDisabled,
}

pub struct ExecutionRouter {
    local_arch: String,
    remote_enabled: bool,
}

impl ExecutionRouter {
    pub fn new(local_arch: impl Into<String>, remote_enabled: bool) -> Self {
        Self {
            local_arch: local_arch.into(),
            remote_enabled,
        }
    }

    /// Applies the five routing rules in order; the first match wins.
    /// A remote decision when remote execution is disabled is a fatal
    /// routing error rather than a silent fallback to local.
    pub fn route(
        &self,
        requirements: &RoutingRequirements,
        previous_worker_id: Option<ResourceId>,
    ) -> Result<RouteDecision, RoutingError> {
        let decision = if let Some(worker_id) = previous_worker_id {
            RouteDecision::Remote {
                required_worker: Some(worker_id),
                required_arch: None,
                required_labels: vec![],
            }
        } else if let Some(runner_id) = requirements.runner_id {
            RouteDecision::Remote {
                required_worker: Some(runner_id),
                required_arch: None,
                required_labels: vec![],
            }
        } else if !requirements.has.is_empty() {
            RouteDecision::Remote {
                required_worker: None,
                required_arch: requirements.arch.clone(),
                required_labels: requirements.has.clone(),
            }
        } else if requirements
            .arch
            .as_ref()
            .is_some_and(|arch| arch != &self.local_arch)
        {
            RouteDecision::Remote {
                required_worker: None,
                required_arch: requirements.arch.clone(),
                required_labels: vec![],
            }
        } else {
            RouteDecision::Local
        };

        if matches!(decision, RouteDecision::Remote { .. }) && !self.remote_enabled {
            return Err(RoutingError::RemoteDisabled);
        }
        Ok(decision)
    }
}

/// A connected worker's capability advertisement, matched against a
/// remote route's label requirements by [`labels_satisfy`].
#[derive(Debug, Clone, Default)]
pub struct WorkerLabels {
    pub arch: Option<String>,
    pub has: Vec<String>,
}

/// Every requested label in `has` must be present on the worker, and
/// `arch` (if requested) must match exactly.
pub fn labels_satisfy(worker: &WorkerLabels, required_arch: &Option<String>, required_has: &[String]) -> bool {
    if let Some(arch) = required_arch {
        if worker.arch.as_deref() != Some(arch.as_str()) {
            return false;
        }
    }
    let worker_has: HashMap<&str, ()> = worker.has.iter().map(|h| (h.as_str(), ())).collect();
    required_has.iter().all(|h| worker_has.contains_key(h.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_local() {
        let router = ExecutionRouter::new("amd64", true);
        let decision = router.route(&RoutingRequirements::default(), None).unwrap();
        assert_eq!(decision, RouteDecision::Local);
    }

    #[test]
    fn previous_worker_wins_over_everything() {
        let router = ExecutionRouter::new("amd64", true);
        let worker_id = ResourceId::new();
        let reqs = RoutingRequirements {
            arch: Some("amd64".to_string()),
            ..Default::default()
        };
        let decision = router.route(&reqs, Some(worker_id)).unwrap();
        assert_eq!(
            decision,
            RouteDecision::Remote {
                required_worker: Some(worker_id),
                required_arch: None,
                required_labels: vec![],
            }
        );
    }

    #[test]
    fn mismatched_arch_routes_remote() {
        let router = ExecutionRouter::new("amd64", true);
        let reqs = RoutingRequirements {
            arch: Some("arm64".to_string()),
            ..Default::default()
        };
        let decision = router.route(&reqs, None).unwrap();
        assert!(matches!(decision, RouteDecision::Remote { .. }));
    }

    #[test]
    fn remote_route_fails_fatally_when_disabled() {
        let router = ExecutionRouter::new("amd64", false);
        let reqs = RoutingRequirements {
            has: vec!["gpu".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            router.route(&reqs, None),
            Err(RoutingError::RemoteDisabled)
        ));
    }

    #[test]
    fn labels_require_every_has_entry() {
        let worker = WorkerLabels {
            arch: Some("amd64".to_string()),
            has: vec!["gpu".to_string(), "avx512".to_string()],
        };
        assert!(labels_satisfy(&worker, &Some("amd64".to_string()), &["gpu".to_string()]));
        assert!(!labels_satisfy(&worker, &None, &["tpu".to_string()]));
    }
}
