//! Forgeline API server: HTTP REST surface, git smart-HTTP hosting, and
//! the worker duplex-channel endpoint, all sharing one [`AppState`].

use forgeline_config::ProcessConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::var("FORGELINE_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)?;
            ProcessConfig::parse(&text)?
        }
        Err(_) => ProcessConfig::default(),
    };

    forgeline_api::serve::run(config).await
}
