//! Pipeline definitions (graph and legacy), pipeline runs, and step
//! runs (§3/§6 "Graph file format").

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::step::StepKind;
use crate::{Error, ResourceId, Result};

/// An edge fires after its source step reaches the named condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    Success,
    Failure,
    Always,
}

/// One node of a graph pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStep {
    pub id: String,
    pub name: String,
    pub kind: StepKind,
    pub timeout_seconds: Option<u64>,
    /// When true, this step's container reuses the previous step's
    /// workspace mount without a fresh checkout (continuation
    /// affinity, §4.5).
    pub continue_in_context: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from_step: String,
    pub to_step: String,
    pub condition: EdgeCondition,
}

/// A graph-form pipeline: steps keyed by id, directed edges between
/// them, and one or more entry points dispatched in parallel at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineGraph {
    /// Step insertion order, preserved so `step_index` assignment is
    /// stable and deterministic across runs of the same definition.
    pub order: Vec<String>,
    pub steps: HashMap<String, GraphStep>,
    pub edges: Vec<Edge>,
    pub entry_points: Vec<String>,
}

impl PipelineGraph {
    pub fn step(&self, id: &str) -> Option<&GraphStep> {
        self.steps.get(id)
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|s| s == id)
    }

    /// Edges leading out of `step_id` whose condition matches the
    /// step's outcome (`Always` edges fire regardless).
    pub fn downstream_edges(&self, step_id: &str, succeeded: bool) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| {
                e.from_step == step_id
                    && (e.condition == EdgeCondition::Always
                        || (succeeded && e.condition == EdgeCondition::Success)
                        || (!succeeded && e.condition == EdgeCondition::Failure))
            })
            .collect()
    }

    pub fn upstream_step_ids(&self, step_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to_step == step_id)
            .map(|e| e.from_step.as_str())
            .collect()
    }

    /// Every step referenced by an edge or entry point must exist,
    /// entry points must be non-empty, and the step id set must have
    /// no duplicates — violations here are defects in the stored
    /// definition, never surfaced as a runtime execution error.
    pub fn validate(&self) -> Result<()> {
        if self.entry_points.is_empty() {
            return Err(Error::InvalidInput(
                "pipeline graph has no entry points".into(),
            ));
        }
        let known: HashSet<&str> = self.steps.keys().map(String::as_str).collect();
        for id in &self.entry_points {
            if !known.contains(id.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "entry point {id} references unknown step"
                )));
            }
        }
        for edge in &self.edges {
            if !known.contains(edge.from_step.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "edge references unknown step {}",
                    edge.from_step
                )));
            }
            if !known.contains(edge.to_step.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "edge references unknown step {}",
                    edge.to_step
                )));
            }
        }
        Ok(())
    }
}

/// What to do when a legacy step finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LegacyAction {
    Next,
    Stop,
    Merge { target_branch: Option<String> },
    TriggerCard { card_id: ResourceId },
    TriggerPipeline { pipeline_id: ResourceId },
}

impl LegacyAction {
    /// Parses the source format's compact action strings
    /// (`"next"`, `"stop"`, `"merge:main"`, `"trigger:pipeline:<id>"`,
    /// `"trigger:<card-id>"`).
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "next" => Ok(LegacyAction::Next),
            "stop" => Ok(LegacyAction::Stop),
            _ if raw.starts_with("merge:") => {
                let branch = raw["merge:".len()..].to_string();
                let target_branch = if branch.is_empty() { None } else { Some(branch) };
                Ok(LegacyAction::Merge { target_branch })
            }
            _ if raw.starts_with("trigger:pipeline:") => {
                let id = raw["trigger:pipeline:".len()..]
                    .parse()
                    .map_err(|_| Error::InvalidInput(format!("bad pipeline id in {raw}")))?;
                Ok(LegacyAction::TriggerPipeline { pipeline_id: id })
            }
            _ if raw.starts_with("trigger:") => {
                let id = raw["trigger:".len()..]
                    .parse()
                    .map_err(|_| Error::InvalidInput(format!("bad card id in {raw}")))?;
                Ok(LegacyAction::TriggerCard { card_id: id })
            }
            other => Err(Error::InvalidInput(format!("unknown step action {other}"))),
        }
    }
}

/// A sequential, pre-graph-format step. Kept for backward
/// compatibility with pipelines stored before the graph format
/// existed; never produced by new callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyStep {
    pub name: String,
    pub kind: StepKind,
    pub timeout_seconds: Option<u64>,
    pub continue_in_context: bool,
    pub on_success: LegacyAction,
    pub on_failure: LegacyAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum PipelineDefinition {
    Graph(PipelineGraph),
    Legacy(Vec<LegacyStep>),
}

impl PipelineDefinition {
    pub fn step_count(&self) -> usize {
        match self {
            PipelineDefinition::Graph(g) => g.steps.len(),
            PipelineDefinition::Legacy(steps) => steps.len(),
        }
    }

    /// Converts a legacy linear definition into the graph form so the
    /// pipeline executor only ever has to implement the graph
    /// dispatch algorithm once. `on_success: Next` becomes a
    /// `Success` edge to the following step; `Stop` produces no edge.
    /// `Merge`/`TriggerCard`/`TriggerPipeline` are preserved as
    /// trailing actions on the synthesized final step rather than
    /// edges, since they are pipeline-completion side effects, not
    /// dispatch continuations.
    pub fn as_graph(&self) -> PipelineGraph {
        match self {
            PipelineDefinition::Graph(g) => g.clone(),
            PipelineDefinition::Legacy(steps) => {
                let order: Vec<String> = (0..steps.len()).map(|i| i.to_string()).collect();
                let mut graph_steps = HashMap::new();
                let mut edges = Vec::new();
                for (i, step) in steps.iter().enumerate() {
                    let id = i.to_string();
                    graph_steps.insert(
                        id.clone(),
                        GraphStep {
                            id: id.clone(),
                            name: step.name.clone(),
                            kind: step.kind.clone(),
                            timeout_seconds: step.timeout_seconds,
                            continue_in_context: step.continue_in_context,
                        },
                    );
                    if let LegacyAction::Next = step.on_success {
                        if i + 1 < steps.len() {
                            edges.push(Edge {
                                from_step: id.clone(),
                                to_step: (i + 1).to_string(),
                                condition: EdgeCondition::Success,
                            });
                        }
                    }
                }
                let entry_points = order.first().cloned().into_iter().collect();
                PipelineGraph {
                    order,
                    steps: graph_steps,
                    edges,
                    entry_points,
                }
            }
        }
    }
}

/// A stored pipeline definition, owned by a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: ResourceId,
    pub repository_id: ResourceId,
    pub name: String,
    pub definition: PipelineDefinition,
    pub created_at: DateTime<Utc>,
}

/// What the pipeline executor does to the triggering card once a run
/// reaches a terminal status (§4.8 "Trigger actions on terminal
/// pipeline"). Parsed from the same compact strings as `LegacyAction`'s
/// `merge`/`merge:BRANCH` forms, but scoped to run completion rather
/// than step completion, so it is kept as its own type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TriggerAction {
    Nothing,
    Merge { target_branch: Option<String> },
    Reject,
    Fail,
}

impl TriggerAction {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "merge" => TriggerAction::Merge { target_branch: None },
            _ if raw.starts_with("merge:") => TriggerAction::Merge {
                target_branch: Some(raw["merge:".len()..].to_string()),
            },
            "reject" => TriggerAction::Reject,
            "fail" => TriggerAction::Fail,
            _ => TriggerAction::Nothing,
        }
    }
}

impl Default for TriggerAction {
    fn default() -> Self {
        TriggerAction::Nothing
    }
}

/// Where a run's trigger-completion action applies (merge/reject/fail
/// a card) and the git coordinates the run executes against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerContext {
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub card_id: Option<ResourceId>,
    #[serde(default)]
    pub on_pass: TriggerAction,
    #[serde(default)]
    pub on_fail: TriggerAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Passed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// One execution of a `Pipeline` against a specific commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: ResourceId,
    pub pipeline_id: ResourceId,
    pub status: RunStatus,
    pub trigger: TriggerContext,
    /// Step ids currently dispatched but not yet terminal (graph
    /// runs only; always at most one entry for legacy runs).
    pub active_step_ids: Vec<String>,
    pub completed_step_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(pipeline_id: ResourceId, trigger: TriggerContext) -> Self {
        Self {
            id: ResourceId::new(),
            pipeline_id,
            status: RunStatus::Pending,
            trigger,
            active_step_ids: Vec::new(),
            completed_step_ids: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl StepRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepRunStatus::Passed | StepRunStatus::Failed | StepRunStatus::Cancelled
        )
    }
}

/// One dispatch of one graph/legacy step within a `PipelineRun`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: ResourceId,
    pub pipeline_run_id: ResourceId,
    pub step_id: String,
    pub step_index: usize,
    pub attempt: u32,
    pub status: StepRunStatus,
    pub job_id: Option<ResourceId>,
    pub logs: String,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRun {
    pub fn new(pipeline_run_id: ResourceId, step_id: impl Into<String>, step_index: usize) -> Self {
        Self {
            id: ResourceId::new(),
            pipeline_run_id,
            step_id: step_id.into(),
            step_index,
            attempt: 1,
            status: StepRunStatus::Pending,
            job_id: None,
            logs: String::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepKind;

    fn script(cmd: &str) -> StepKind {
        StepKind::Script {
            command: cmd.to_string(),
        }
    }

    fn legacy_step(name: &str, on_success: LegacyAction, on_failure: LegacyAction) -> LegacyStep {
        LegacyStep {
            name: name.to_string(),
            kind: script("true"),
            timeout_seconds: None,
            continue_in_context: false,
            on_success,
            on_failure,
        }
    }

    #[test]
    fn parses_compact_legacy_actions() {
        assert!(matches!(LegacyAction::parse("next").unwrap(), LegacyAction::Next));
        assert!(matches!(LegacyAction::parse("stop").unwrap(), LegacyAction::Stop));
        match LegacyAction::parse("merge:main").unwrap() {
            LegacyAction::Merge { target_branch } => assert_eq!(target_branch.as_deref(), Some("main")),
            _ => panic!("wrong variant"),
        }
        assert!(matches!(
            LegacyAction::parse("merge:"),
            Ok(LegacyAction::Merge { target_branch: None })
        ));
    }

    #[test]
    fn legacy_next_chain_becomes_success_edges() {
        let steps = vec![
            legacy_step("build", LegacyAction::Next, LegacyAction::Stop),
            legacy_step("test", LegacyAction::Next, LegacyAction::Stop),
            legacy_step("deploy", LegacyAction::Stop, LegacyAction::Stop),
        ];
        let graph = PipelineDefinition::Legacy(steps).as_graph();
        graph.validate().unwrap();
        assert_eq!(graph.entry_points, vec!["0".to_string()]);
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.downstream_edges("0", true).len(), 1);
        assert_eq!(graph.downstream_edges("1", false).len(), 0);
        assert_eq!(graph.downstream_edges("2", true).len(), 0);
    }

    #[test]
    fn graph_validate_rejects_dangling_edge() {
        let mut steps = HashMap::new();
        steps.insert(
            "a".to_string(),
            GraphStep {
                id: "a".to_string(),
                name: "a".to_string(),
                kind: script("true"),
                timeout_seconds: None,
                continue_in_context: false,
            },
        );
        let graph = PipelineGraph {
            order: vec!["a".to_string()],
            steps,
            edges: vec![Edge {
                from_step: "a".to_string(),
                to_step: "missing".to_string(),
                condition: EdgeCondition::Success,
            }],
            entry_points: vec!["a".to_string()],
        };
        assert!(graph.validate().is_err());
    }

    #[test]
    fn graph_validate_rejects_empty_entry_points() {
        let graph = PipelineGraph {
            order: vec![],
            steps: HashMap::new(),
            edges: vec![],
            entry_points: vec![],
        };
        assert!(graph.validate().is_err());
    }
}
