//! Tagged step-kind types and the per-step-kind execution contract
//! (§9 "dynamic dispatch on step-type" design note; §4.4a config
//! resolution).

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{ResourceId, Result};

/// One node's behavior. Replaces runtime dispatch on a `type` string
/// plus a loosely-typed config map with a closed tagged union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// A shell script, wrapped in `bash -c` after line-ending
    /// normalization.
    Script { command: String },
    /// An explicit container image and command.
    Docker {
        image: String,
        command: DockerCommand,
    },
    /// An AI agent invocation (claude-code, gemini, ...).
    Agent {
        runner_type: String,
        title: String,
        description: String,
        agent_file_ids: Vec<ResourceId>,
        prompt_template: Option<String>,
    },
}

/// A docker step's command may arrive as a single shell string or an
/// already-tokenized argv list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DockerCommand {
    Shell(String),
    Argv(Vec<String>),
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Script { .. } => "script",
            StepKind::Docker { .. } => "docker",
            StepKind::Agent { .. } => "agent",
        }
    }

    /// §4.5 routing input: runner type used for worker-capability
    /// matching. Script/Docker steps have no runner-type preference.
    pub fn runner_type(&self) -> Option<&str> {
        match self {
            StepKind::Agent { runner_type, .. } => Some(runner_type),
            _ => None,
        }
    }
}

pub const DEFAULT_SCRIPT_IMAGE: &str = "forgeline-base:latest";

fn default_agent_image(runner_type: &str) -> &'static str {
    match runner_type {
        "claude-code" | "claude" | "any" => "forgeline-claude:latest",
        "gemini" => "forgeline-gemini:latest",
        _ => "forgeline-claude:latest",
    }
}

/// Line endings in a user-supplied script may arrive as `\r\n`, `\n`,
/// or bare `\r` (double-escaped from JSON transport). Normalize to
/// `\n` before the script is ever written to disk or executed — see
/// the §9 design note.
pub fn normalize_line_endings(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Resolved, executor-ready configuration for one step (§4.4a).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub image: String,
    pub command: Vec<String>,
    pub workspace_path: String,
    pub timeout_seconds: u64,
    pub environment: HashMap<String, String>,
    pub working_dir: String,
    pub use_control_layer: bool,
    pub backend_url: Option<String>,
    /// Bearer secret for the in-container control layer to authenticate
    /// callbacks with, minted by the caller (which owns the `StepRun` id
    /// and the token's persisted hash) before execution starts. `None`
    /// when `use_control_layer` is false.
    pub step_token: Option<String>,
}

/// Error raised while resolving a step's `StepKind` + user config into
/// an `ExecutionConfig`. Distinct from the runtime `Error` taxonomy
/// because it is always a configuration mistake, never an execution
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigBuildError {
    #[error("docker step must specify an image")]
    MissingDockerImage,
}

/// Build the `ExecutionConfig` the local/remote executor consumes from
/// a step's `StepKind` and its ambient execution parameters.
///
/// Grounded in the original config-builder's priority rules: an
/// explicit image always wins; otherwise the step kind picks a
/// sensible default. `HOME` is only injected when the control layer is
/// in play, and never overrides a user-supplied `HOME`.
pub fn build_execution_config(
    kind: &StepKind,
    user_env: &HashMap<String, String>,
    workspace_path: impl Into<String>,
    timeout_seconds: u64,
    working_dir: impl Into<String>,
    use_control_layer: bool,
    backend_url: Option<String>,
) -> std::result::Result<ExecutionConfig, ConfigBuildError> {
    let (image, command) = match kind {
        StepKind::Script { command } => (
            DEFAULT_SCRIPT_IMAGE.to_string(),
            vec![
                "bash".to_string(),
                "-c".to_string(),
                normalize_line_endings(command),
            ],
        ),
        StepKind::Docker { image, command } => {
            if image.is_empty() {
                return Err(ConfigBuildError::MissingDockerImage);
            }
            let argv = match command {
                DockerCommand::Argv(v) if !v.is_empty() => v.clone(),
                DockerCommand::Argv(_) => Vec::new(),
                DockerCommand::Shell(s) if s.is_empty() => Vec::new(),
                DockerCommand::Shell(s) => {
                    vec!["bash".to_string(), "-c".to_string(), normalize_line_endings(s)]
                }
            };
            (image.clone(), argv)
        }
        StepKind::Agent {
            runner_type,
            title,
            description,
            ..
        } => {
            let prompt = format!("{title}\n\n{description}").trim().to_string();
            let argv = match runner_type.as_str() {
                "claude-code" | "claude" | "any" => {
                    vec!["claude".to_string(), "-p".to_string(), prompt]
                }
                "gemini" => vec![
                    "python".to_string(),
                    "-m".to_string(),
                    "gemini_agent".to_string(),
                    prompt,
                ],
                _ => vec!["claude".to_string(), "-p".to_string(), prompt],
            };
            (default_agent_image(runner_type).to_string(), argv)
        }
    };

    let mut environment = user_env.clone();
    if use_control_layer {
        environment
            .entry("HOME".to_string())
            .or_insert_with(|| "/workspace/home".to_string());
    }

    Ok(ExecutionConfig {
        image,
        command,
        workspace_path: workspace_path.into(),
        timeout_seconds,
        environment,
        working_dir: working_dir.into(),
        use_control_layer,
        backend_url,
        step_token: None,
    })
}

/// One line of combined stdout/stderr output from a running step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub content: String,
}

/// Terminal outcome of one step execution (§6 executor job contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub exit_code: i32,
    pub logs: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub container_id: Option<String>,
}

/// An interactive attach session to a running step's container
/// (used by the debug-rerun sidecar/shell connect modes, §4.9).
pub struct TerminalSession {
    pub stdin: Box<dyn futures::Sink<Bytes, Error = std::io::Error> + Send + Unpin>,
    pub stdout: BoxStream<'static, std::result::Result<Bytes, std::io::Error>>,
}

/// Per-step-kind dispatch surface. The local executor (`forgeline-executor`)
/// and the remote worker-side agent runner both implement this so the
/// pipeline executor never matches on `StepKind` itself.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Idempotent on `execution_key`: a previously completed key
    /// returns the cached result without spawning anything new.
    async fn execute_step(
        &self,
        execution_key: &str,
        config: ExecutionConfig,
    ) -> Result<BoxStream<'static, StepOutput>>;

    async fn cancel(&self, execution_key: &str) -> Result<()>;

    async fn exec_interactive(
        &self,
        execution_key: &str,
        cmd: Vec<String>,
    ) -> Result<TerminalSession>;
}

/// One item of the executor job contract's output stream: either an
/// interleaved log line or the single terminal result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepOutput {
    Log(LogLine),
    Result(StepResult),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_crlf_and_bare_cr() {
        assert_eq!(normalize_line_endings("a\r\nb\rc\nd"), "a\nb\nc\nd");
    }

    #[test]
    fn script_step_wraps_in_bash_c() {
        let kind = StepKind::Script {
            command: "echo hi\r\n".to_string(),
        };
        let cfg = build_execution_config(
            &kind,
            &HashMap::new(),
            "/var/lib/forgeline/ws-1",
            3600,
            "/workspace/repo",
            false,
            None,
        )
        .unwrap();
        assert_eq!(cfg.image, DEFAULT_SCRIPT_IMAGE);
        assert_eq!(cfg.command, vec!["bash", "-c", "echo hi\n"]);
        assert!(!cfg.environment.contains_key("HOME"));
    }

    #[test]
    fn docker_step_without_image_is_a_config_error() {
        let kind = StepKind::Docker {
            image: String::new(),
            command: DockerCommand::Shell("true".to_string()),
        };
        let err = build_execution_config(
            &kind,
            &HashMap::new(),
            "/ws",
            60,
            "/workspace/repo",
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigBuildError::MissingDockerImage));
    }

    #[test]
    fn control_layer_sets_home_without_overriding_user_value() {
        let kind = StepKind::Script {
            command: "true".to_string(),
        };
        let mut env = HashMap::new();
        env.insert("HOME".to_string(), "/custom".to_string());
        let cfg = build_execution_config(
            &kind, &env, "/ws", 60, "/workspace/repo", true, None,
        )
        .unwrap();
        assert_eq!(cfg.environment.get("HOME").unwrap(), "/custom");

        let cfg2 =
            build_execution_config(&kind, &HashMap::new(), "/ws", 60, "/workspace/repo", true, None)
                .unwrap();
        assert_eq!(cfg2.environment.get("HOME").unwrap(), "/workspace/home");
    }

    #[test]
    fn agent_step_builds_claude_invocation() {
        let kind = StepKind::Agent {
            runner_type: "claude-code".to_string(),
            title: "Fix bug".to_string(),
            description: "details".to_string(),
            agent_file_ids: vec![],
            prompt_template: None,
        };
        let cfg = build_execution_config(
            &kind,
            &HashMap::new(),
            "/ws",
            60,
            "/workspace/repo",
            false,
            None,
        )
        .unwrap();
        assert_eq!(cfg.command[0], "claude");
        assert_eq!(cfg.command[1], "-p");
        assert!(cfg.command[2].contains("Fix bug"));
    }
}
