//! Log repository for storing and retrieving per-step pipeline logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgeline_core::ResourceId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::DbResult;

/// A log line record from the database, keyed by the run and the step
/// that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LogRecord {
    pub id: uuid::Uuid,
    pub pipeline_run_id: uuid::Uuid,
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    pub stream: String,
    pub content: String,
}

#[async_trait]
pub trait LogRepo: Send + Sync {
    async fn append_log(&self, run_id: ResourceId, step_id: &str, stream: &str, content: &str) -> DbResult<()>;

    /// Append multiple log lines at once (batch insert).
    async fn append_logs_batch(
        &self,
        run_id: ResourceId,
        step_id: &str,
        logs: &[(String, String)], // (stream, content)
    ) -> DbResult<()>;

    async fn get_logs_for_run(&self, run_id: ResourceId) -> DbResult<Vec<LogRecord>>;

    async fn get_logs_for_step(&self, run_id: ResourceId, step_id: &str) -> DbResult<Vec<LogRecord>>;

    async fn get_logs_paginated(
        &self,
        run_id: ResourceId,
        step_id: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> DbResult<Vec<LogRecord>>;
}

pub struct PgLogRepo {
    pool: PgPool,
}

impl PgLogRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogRepo for PgLogRepo {
    async fn append_log(&self, run_id: ResourceId, step_id: &str, stream: &str, content: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO logs (id, pipeline_run_id, step_id, stream, content, timestamp)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(run_id.as_uuid())
        .bind(step_id)
        .bind(stream)
        .bind(content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_logs_batch(&self, run_id: ResourceId, step_id: &str, logs: &[(String, String)]) -> DbResult<()> {
        if logs.is_empty() {
            return Ok(());
        }

        let mut query_builder =
            sqlx::QueryBuilder::new("INSERT INTO logs (id, pipeline_run_id, step_id, stream, content, timestamp) ");

        query_builder.push_values(logs.iter(), |mut b, (stream, content)| {
            b.push_bind(uuid::Uuid::now_v7())
                .push_bind(run_id.as_uuid())
                .push_bind(step_id)
                .push_bind(stream)
                .push_bind(content)
                .push("NOW()");
        });

        query_builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn get_logs_for_run(&self, run_id: ResourceId) -> DbResult<Vec<LogRecord>> {
        let records = sqlx::query_as::<_, LogRecord>(
            r#"
            SELECT id, pipeline_run_id, step_id, timestamp, stream, content
            FROM logs
            WHERE pipeline_run_id = $1
            ORDER BY timestamp ASC
            "#,
        )
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get_logs_for_step(&self, run_id: ResourceId, step_id: &str) -> DbResult<Vec<LogRecord>> {
        let records = sqlx::query_as::<_, LogRecord>(
            r#"
            SELECT id, pipeline_run_id, step_id, timestamp, stream, content
            FROM logs
            WHERE pipeline_run_id = $1 AND step_id = $2
            ORDER BY timestamp ASC
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get_logs_paginated(
        &self,
        run_id: ResourceId,
        step_id: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> DbResult<Vec<LogRecord>> {
        let records = if let Some(step_id) = step_id {
            sqlx::query_as::<_, LogRecord>(
                r#"
                SELECT id, pipeline_run_id, step_id, timestamp, stream, content
                FROM logs
                WHERE pipeline_run_id = $1 AND step_id = $2
                ORDER BY timestamp ASC
                OFFSET $3 LIMIT $4
                "#,
            )
            .bind(run_id.as_uuid())
            .bind(step_id)
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, LogRecord>(
                r#"
                SELECT id, pipeline_run_id, step_id, timestamp, stream, content
                FROM logs
                WHERE pipeline_run_id = $1
                ORDER BY timestamp ASC
                OFFSET $2 LIMIT $3
                "#,
            )
            .bind(run_id.as_uuid())
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(records)
    }
}
