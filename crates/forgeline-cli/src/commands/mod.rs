//! CLI command implementations (§4.14).

use anyhow::{Context, Result};
use forgeline_config::ProcessConfig;

/// Reads `FORGELINE_CONFIG` the same way the server binary does, so the
/// CLI's `serve`/`migrate` commands see the same process configuration.
fn load_config() -> Result<ProcessConfig> {
    match std::env::var("FORGELINE_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file: {path}"))?;
            ProcessConfig::parse(&text).context("failed to parse config file")
        }
        Err(_) => Ok(ProcessConfig::default()),
    }
}

/// Runs the HTTP/duplex server in the foreground.
pub async fn serve() -> Result<()> {
    forgeline_api::serve::run(load_config()?).await
}

/// Applies pending database migrations and exits.
pub async fn migrate() -> Result<()> {
    let config = load_config()?;
    let pool = forgeline_db::create_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;
    forgeline_db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;
    println!("migrations applied");
    Ok(())
}

/// Triggers a pipeline run by id against a running server.
pub async fn trigger(api_url: &str, pipeline_id: &str, branch: Option<String>, commit_sha: Option<String>) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{api_url}/api/v1/pipelines/{pipeline_id}/runs");
    let body = serde_json::json!({ "branch": branch, "commit_sha": commit_sha });

    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;

    print_response("run triggered", response).await
}

/// Prints the state of every connected worker.
pub async fn workers(api_url: &str) -> Result<()> {
    let url = format!("{api_url}/api/v1/workers");
    let response = reqwest::get(&url).await.with_context(|| format!("failed to reach {url}"))?;
    print_response("workers", response).await
}

/// Prints the state of every tracked workspace.
pub async fn workspaces(api_url: &str) -> Result<()> {
    let url = format!("{api_url}/api/v1/workspaces");
    let response = reqwest::get(&url).await.with_context(|| format!("failed to reach {url}"))?;
    print_response("workspaces", response).await
}

async fn print_response(label: &str, response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let body: serde_json::Value = response.json().await.context("failed to parse server response")?;
    if !status.is_success() {
        anyhow::bail!("{label}: server returned {status}: {body}");
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
