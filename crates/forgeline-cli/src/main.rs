//! Forgeline CLI.

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "forgeline")]
#[command(about = "Forgeline pipeline orchestrator CLI", long_about = None)]
struct Cli {
    /// Base URL of a running Forgeline server, for commands that talk
    /// to one over HTTP rather than the database/Docker directly.
    #[arg(long, env = "FORGELINE_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/duplex server.
    Serve,
    /// Apply pending database migrations.
    Migrate,
    /// Trigger a pipeline run by id.
    Trigger {
        /// Pipeline id
        pipeline_id: String,
        /// Branch to run
        #[arg(long)]
        branch: Option<String>,
        /// Commit sha to run
        #[arg(long)]
        commit_sha: Option<String>,
    },
    /// Print the state of connected workers.
    Workers,
    /// Print the state of tracked workspaces.
    Workspaces,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => commands::serve().await,
        Commands::Migrate => commands::migrate().await,
        Commands::Trigger { pipeline_id, branch, commit_sha } => {
            commands::trigger(&cli.api_url, &pipeline_id, branch, commit_sha).await
        }
        Commands::Workers => commands::workers(&cli.api_url).await,
        Commands::Workspaces => commands::workspaces(&cli.api_url).await,
    }
}
