//! Database layer for the Forgeline pipeline orchestrator.
//!
//! Provides repository traits and PostgreSQL implementations for the
//! entities that outlive a single process: repositories, pipelines,
//! pipeline/step runs, and debug sessions. Workers, workspaces, and
//! per-step tokens are in-process only and have no repository here.

pub mod error;
pub mod repo;

pub use error::{DbError, DbResult};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
