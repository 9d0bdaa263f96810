//! Local Docker step executor: runs one step's resolved
//! [`ExecutionConfig`] as a container mounting the step's workspace volume.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::Utc;
use forgeline_core::step::{ExecutionConfig, LogLine, StepExecutor, StepOutput, StepResult};
use forgeline_core::{Error, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Local Docker executor: one container per step execution, the
/// workspace volume mounted at `/workspace`.
pub struct LocalDockerExecutor {
    docker: Docker,
    cache: Arc<Mutex<HashMap<String, StepResult>>>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl LocalDockerExecutor {
    /// Create a new executor connecting to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    /// Create with a custom Docker client (used by tests against a mock
    /// daemon or an alternate connection).
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            cache: Arc::new(Mutex::new(HashMap::new())),
            cancel_flags: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying Docker client, for callers that need to inspect
    /// containers directly (startup orphan recovery).
    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    fn container_name(execution_key: &str) -> String {
        format!("forgeline-step-{}", execution_key.replace(':', "-"))
    }

    async fn pull_image(&self, image: &str) -> std::result::Result<(), Error> {
        info!(image = %image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        let mut last_error = None;
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        }
        if let Some(message) = last_error {
            let lowered = message.to_lowercase();
            if lowered.contains("not found") || lowered.contains("404") {
                return Err(Error::ImageNotFound(image.to_string()));
            }
            warn!(image = %image, error = %message, "pull finished with a warning");
        }
        Ok(())
    }
}

impl Default for LocalDockerExecutor {
    fn default() -> Self {
        Self::new().expect("failed to connect to Docker")
    }
}

#[async_trait]
impl StepExecutor for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "local-docker"
    }

    async fn execute_step(
        &self,
        execution_key: &str,
        config: ExecutionConfig,
    ) -> Result<BoxStream<'static, StepOutput>> {
        if let Some(cached) = self.cache.lock().await.get(execution_key).cloned() {
            let stream = futures::stream::once(async move { StepOutput::Result(cached) });
            return Ok(Box::pin(stream));
        }

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .await
            .insert(execution_key.to_string(), cancel_flag.clone());

        if let Err(e) = self.pull_image(&config.image).await {
            self.cancel_flags.lock().await.remove(execution_key);
            return Err(e);
        }

        if config.use_control_layer {
            if let Err(e) = write_control_directory(execution_key, &config) {
                self.cancel_flags.lock().await.remove(execution_key);
                return Err(Error::WorkspaceCreationError(e));
            }
        }

        let container_name = Self::container_name(execution_key);
        let env: Vec<String> = config
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let binds = vec![format!("{}:/workspace", config.workspace_path)];
        let host_config = HostConfig {
            binds: Some(binds),
            ..Default::default()
        };

        // When the control layer drives execution it reads the command
        // out of .control/step_config.json instead.
        let cmd = if config.use_control_layer || config.command.is_empty() {
            None
        } else {
            Some(config.command.clone())
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd,
            env: Some(env),
            working_dir: Some(config.working_dir.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        let create_result = self
            .docker
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| Error::ContainerCreateFailed(e.to_string()));

        let container = match create_result {
            Ok(c) => c,
            Err(e) => {
                self.cancel_flags.lock().await.remove(execution_key);
                return Err(e);
            }
        };

        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            self.cancel_flags.lock().await.remove(execution_key);
            return Err(Error::ExecutionFailed(format!(
                "failed to start container: {e}"
            )));
        }

        info!(container = %container_name, execution_key, "container started");

        let (tx, rx) = tokio::sync::mpsc::channel::<StepOutput>(256);
        let docker = self.docker.clone();
        let deadline = StdDuration::from_secs(config.timeout_seconds.max(1));
        let execution_key = execution_key.to_string();
        let container_id = container.id.clone();

        tokio::spawn(run_to_completion(
            docker,
            container_name,
            container_id,
            deadline,
            cancel_flag,
            tx,
        ));

        let cache = self.cache.clone();
        let execution_key_for_cache = execution_key.clone();
        let stream = ReceiverStream::new(rx).inspect(move |output| {
            if let StepOutput::Result(result) = output {
                let cache = cache.clone();
                let key = execution_key_for_cache.clone();
                let result = result.clone();
                tokio::spawn(async move {
                    cache.lock().await.insert(key, result);
                });
            }
        });

        Ok(Box::pin(stream))
    }

    async fn cancel(&self, execution_key: &str) -> Result<()> {
        if let Some(flag) = self.cancel_flags.lock().await.get(execution_key) {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(Error::NotFound(format!(
                "no running execution for key {execution_key}"
            )))
        }
    }

    async fn exec_interactive(
        &self,
        _execution_key: &str,
        _cmd: Vec<String>,
    ) -> Result<forgeline_core::step::TerminalSession> {
        Err(Error::Internal(
            "interactive exec is not implemented for the local Docker executor".to_string(),
        ))
    }
}

/// Payload written to `<workspace>/.control/step_config.json` for an
/// in-container control layer to pick up, mirroring the fields a control
/// layer needs to report step progress back over HTTP.
#[derive(serde::Serialize)]
struct StepConfigFile<'a> {
    step_id: &'a str,
    backend_url: &'a str,
    token: &'a str,
    command: &'a [String],
    working_dir: &'a str,
    environment: &'a HashMap<String, String>,
    timeout_seconds: u64,
}

fn write_control_directory(execution_key: &str, config: &ExecutionConfig) -> std::result::Result<(), String> {
    let Some(token) = config.step_token.as_deref() else {
        return Err("use_control_layer is set but no step_token was minted".to_string());
    };
    let control_dir = std::path::Path::new(&config.workspace_path).join(".control");
    std::fs::create_dir_all(&control_dir).map_err(|e| e.to_string())?;

    let payload = StepConfigFile {
        step_id: execution_key,
        backend_url: config.backend_url.as_deref().unwrap_or("http://host.docker.internal:8000"),
        token,
        command: &config.command,
        working_dir: &config.working_dir,
        environment: &config.environment,
        timeout_seconds: config.timeout_seconds,
    };
    let json = serde_json::to_string_pretty(&payload).map_err(|e| e.to_string())?;
    std::fs::write(control_dir.join("step_config.json"), json).map_err(|e| e.to_string())?;
    Ok(())
}

async fn run_to_completion(
    docker: Docker,
    container_name: String,
    container_id: String,
    deadline: StdDuration,
    cancel_flag: Arc<AtomicBool>,
    tx: tokio::sync::mpsc::Sender<StepOutput>,
) {
    let started_at = Utc::now();
    let log_options = LogsOptions::<String> {
        follow: true,
        stdout: true,
        stderr: true,
        timestamps: false,
        ..Default::default()
    };
    let mut logs = docker.logs(&container_name, Some(log_options));
    let mut wait_stream = docker.wait_container(&container_name, Some(WaitContainerOptions { condition: "not-running" }));

    let mut exit_code: Option<i64> = None;
    let mut error: Option<String> = None;
    let mut cancelled = false;
    let mut timed_out = false;

    loop {
        if cancel_flag.load(Ordering::SeqCst) {
            cancelled = true;
            break;
        }

        let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
        if elapsed >= deadline {
            timed_out = true;
            break;
        }

        tokio::select! {
            log_item = logs.next() => {
                match log_item {
                    Some(Ok(output)) => {
                        let content = match output {
                            LogOutput::StdOut { message } | LogOutput::Console { message } | LogOutput::StdIn { message } => {
                                String::from_utf8_lossy(&message).trim_end().to_string()
                            }
                            LogOutput::StdErr { message } => {
                                String::from_utf8_lossy(&message).trim_end().to_string()
                            }
                        };
                        if !content.is_empty() {
                            let _ = tx.send(StepOutput::Log(LogLine { content })).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(container = %container_name, error = %e, "log stream error");
                    }
                    None => {}
                }
            }
            wait_result = wait_stream.next() => {
                match wait_result {
                    Some(Ok(response)) => {
                        exit_code = Some(response.status_code);
                        break;
                    }
                    Some(Err(e)) => {
                        error = Some(e.to_string());
                        break;
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep(StdDuration::from_millis(200)) => {}
        }
    }

    let result = if cancelled {
        kill_and_remove(&docker, &container_name).await;
        StepResult {
            success: false,
            exit_code: -1,
            logs: String::new(),
            error: Some("cancelled".to_string()),
            duration_ms: elapsed_ms(started_at),
            container_id: Some(container_id),
        }
    } else if timed_out {
        kill_and_remove(&docker, &container_name).await;
        StepResult {
            success: false,
            exit_code: -1,
            logs: String::new(),
            error: Some("timeout".to_string()),
            duration_ms: elapsed_ms(started_at),
            container_id: Some(container_id),
        }
    } else if let Some(error) = error {
        StepResult {
            success: false,
            exit_code: -1,
            logs: String::new(),
            error: Some(error),
            duration_ms: elapsed_ms(started_at),
            container_id: Some(container_id),
        }
    } else {
        let code = exit_code.unwrap_or(-1);
        let _ = docker
            .remove_container(
                &container_name,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await;
        StepResult {
            success: code == 0,
            exit_code: code as i32,
            logs: String::new(),
            error: if code == 0 { None } else { Some(format!("exited with status {code}")) },
            duration_ms: elapsed_ms(started_at),
            container_id: Some(container_id),
        }
    };

    let _ = tx.send(StepOutput::Result(result)).await;
}

fn elapsed_ms(started_at: chrono::DateTime<Utc>) -> u64 {
    (Utc::now() - started_at).num_milliseconds().max(0) as u64
}

async fn kill_and_remove(docker: &Docker, container_name: &str) {
    let _ = docker
        .kill_container(container_name, Some(KillContainerOptions { signal: "SIGKILL" }))
        .await;
    let _ = docker
        .remove_container(
            container_name,
            Some(RemoveContainerOptions { force: true, ..Default::default() }),
        )
        .await;
}

/// Orphan recovery on restart: any execution key whose container is
/// missing, `exited`, or `dead` is recovered as a failed result with
/// reason "orphaned" rather than left dangling.
pub async fn recover_orphan(docker: &Docker, execution_key: &str) -> Option<StepResult> {
    let container_name = LocalDockerExecutor::container_name(execution_key);
    let inspect = docker.inspect_container(&container_name, None).await.ok()?;
    let state = inspect.state?;
    let status = state.status?;
    use bollard::models::ContainerStateStatusEnum::*;
    if matches!(status, EXITED | DEAD) || state.running == Some(false) {
        Some(StepResult {
            success: false,
            exit_code: state.exit_code.unwrap_or(-1) as i32,
            logs: String::new(),
            error: Some("orphaned".to_string()),
            duration_ms: 0,
            container_id: inspect.id,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_sanitizes_colons() {
        let name = LocalDockerExecutor::container_name("run-1:3:0");
        assert_eq!(name, "forgeline-step-run-1-3-0");
    }

    #[test]
    fn container_name_is_deterministic() {
        let a = LocalDockerExecutor::container_name("run-1:3:0");
        let b = LocalDockerExecutor::container_name("run-1:3:0");
        assert_eq!(a, b);
    }
}
