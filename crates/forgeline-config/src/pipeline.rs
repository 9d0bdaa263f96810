//! Pipeline definition file parsing (§3/§6 "Graph file format"): the
//! on-disk/API representation of a `PipelineDefinition::Graph`, kept as
//! plain JSON rather than KDL since it is also the shape persisted as
//! the `pipelines.definition` JSONB column — one format for both.

use std::collections::HashMap;

use forgeline_core::pipeline::{Edge, EdgeCondition, GraphStep, PipelineGraph};
use serde::Deserialize;

use crate::{ConfigError, ConfigResult};

#[derive(Debug, Deserialize)]
struct GraphFile {
    #[allow(dead_code)]
    version: u32,
    steps: serde_json::Map<String, serde_json::Value>,
    edges: Vec<EdgeFile>,
    entry_points: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EdgeFile {
    #[allow(dead_code)]
    id: Option<String>,
    from_step: String,
    to_step: String,
    condition: EdgeCondition,
}

#[derive(Debug, Deserialize)]
struct GraphFileStep {
    id: String,
    name: String,
    #[serde(rename = "type")]
    step_type: String,
    #[serde(default)]
    config: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "timeout")]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    continue_in_context: bool,
}

impl GraphFileStep {
    /// `StepKind` is internally tagged on `type` with its fields at the
    /// top level; the file format nests those same fields under
    /// `config` instead, so the tag is merged back in before decoding.
    fn into_step_kind(mut self) -> ConfigResult<forgeline_core::step::StepKind> {
        self.config
            .insert("type".to_string(), serde_json::Value::String(self.step_type));
        serde_json::from_value(serde_json::Value::Object(self.config)).map_err(ConfigError::from)
    }
}

/// Parses the §6 "Graph file format" JSON document into a
/// [`PipelineGraph`], validating edge/entry-point references.
pub fn parse_graph(json: &str) -> ConfigResult<PipelineGraph> {
    let file: GraphFile = serde_json::from_str(json)?;

    let mut order = Vec::with_capacity(file.steps.len());
    let mut steps = HashMap::with_capacity(file.steps.len());
    for (id, value) in file.steps.into_iter() {
        let parsed: GraphFileStep = serde_json::from_value(value)?;
        if parsed.id != id {
            return Err(ConfigError::InvalidValue {
                field: format!("steps.{id}.id"),
                message: format!("step key {id} does not match embedded id {}", parsed.id),
            });
        }
        let step_id = parsed.id.clone();
        let name = parsed.name.clone();
        let timeout_seconds = parsed.timeout_seconds;
        let continue_in_context = parsed.continue_in_context;
        let kind = parsed.into_step_kind()?;
        order.push(id.clone());
        steps.insert(
            id,
            GraphStep {
                id: step_id,
                name,
                kind,
                timeout_seconds,
                continue_in_context,
            },
        );
    }

    let edges = file
        .edges
        .into_iter()
        .map(|e| Edge {
            from_step: e.from_step,
            to_step: e.to_step,
            condition: e.condition,
        })
        .collect();

    let graph = PipelineGraph {
        order,
        steps,
        edges,
        entry_points: file.entry_points,
    };
    graph.validate().map_err(|e| ConfigError::InvalidReference(e.to_string()))?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_graph() {
        let json = r#"{
            "version": 2,
            "steps": {
                "build": {
                    "id": "build",
                    "name": "Build",
                    "type": "script",
                    "command": "cargo build"
                }
            },
            "edges": [],
            "entry_points": ["build"]
        }"#;
        let graph = parse_graph(json).unwrap();
        assert_eq!(graph.entry_points, vec!["build".to_string()]);
        assert_eq!(graph.step_index("build"), Some(0));
    }

    #[test]
    fn rejects_mismatched_step_key() {
        let json = r#"{
            "version": 2,
            "steps": { "build": { "id": "other", "name": "Build", "type": "script", "command": "x" } },
            "edges": [],
            "entry_points": ["build"]
        }"#;
        assert!(parse_graph(json).is_err());
    }

    #[test]
    fn rejects_unknown_entry_point() {
        let json = r#"{
            "version": 2,
            "steps": { "build": { "id": "build", "name": "Build", "type": "script", "command": "x" } },
            "edges": [],
            "entry_points": ["missing"]
        }"#;
        assert!(parse_graph(json).is_err());
    }
}
