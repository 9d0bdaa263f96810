//! Repository (source project) persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgeline_core::repository::Repository;
use forgeline_core::ResourceId;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct RepositoryRow {
    id: Uuid,
    name: String,
    default_branch: String,
    remote_url: Option<String>,
    ingested: bool,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

impl From<RepositoryRow> for Repository {
    fn from(row: RepositoryRow) -> Self {
        Repository {
            id: ResourceId::from_uuid(row.id),
            name: row.name,
            default_branch: row.default_branch,
            remote_url: row.remote_url,
            ingested: row.ingested,
        }
    }
}

#[async_trait]
pub trait RepositoryRepo: Send + Sync {
    async fn create(&self, repository: &Repository) -> DbResult<Repository>;
    async fn get_by_id(&self, id: ResourceId) -> DbResult<Repository>;
    async fn get_by_name(&self, name: &str) -> DbResult<Option<Repository>>;
    async fn list(&self) -> DbResult<Vec<Repository>>;
    async fn mark_ingested(&self, id: ResourceId) -> DbResult<()>;
    async fn delete(&self, id: ResourceId) -> DbResult<()>;
}

pub struct PgRepositoryRepo {
    pool: PgPool,
}

impl PgRepositoryRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RepositoryRepo for PgRepositoryRepo {
    async fn create(&self, repository: &Repository) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            r#"
            INSERT INTO repositories (id, name, default_branch, remote_url, ingested, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING id, name, default_branch, remote_url, ingested, created_at
            "#,
        )
        .bind(repository.id.as_uuid())
        .bind(&repository.name)
        .bind(&repository.default_branch)
        .bind(&repository.remote_url)
        .bind(repository.ingested)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_by_id(&self, id: ResourceId) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, name, default_branch, remote_url, ingested, created_at FROM repositories WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("repository {id}")))?;
        Ok(row.into())
    }

    async fn get_by_name(&self, name: &str) -> DbResult<Option<Repository>> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, name, default_branch, remote_url, ingested, created_at FROM repositories WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list(&self) -> DbResult<Vec<Repository>> {
        let rows = sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, name, default_branch, remote_url, ingested, created_at FROM repositories ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_ingested(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("UPDATE repositories SET ingested = true WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM repositories WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
