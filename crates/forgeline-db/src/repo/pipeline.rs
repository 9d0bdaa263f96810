//! Pipeline and pipeline-run persistence (§3, §4.11).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgeline_core::pipeline::{Pipeline, PipelineDefinition, PipelineRun, RunStatus, TriggerContext};
use forgeline_core::ResourceId;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct PipelineRow {
    id: Uuid,
    repository_id: Uuid,
    name: String,
    definition: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<PipelineRow> for Pipeline {
    type Error = DbError;

    fn try_from(row: PipelineRow) -> Result<Self, Self::Error> {
        let definition: PipelineDefinition =
            serde_json::from_value(row.definition).map_err(|e| DbError::InvalidData(e.to_string()))?;
        Ok(Pipeline {
            id: ResourceId::from_uuid(row.id),
            repository_id: ResourceId::from_uuid(row.repository_id),
            name: row.name,
            definition,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct PipelineRunRow {
    id: Uuid,
    pipeline_id: Uuid,
    status: String,
    trigger: serde_json::Value,
    active_step_ids: serde_json::Value,
    completed_step_ids: serde_json::Value,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

fn parse_run_status(s: &str) -> DbResult<RunStatus> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "passed" => Ok(RunStatus::Passed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(DbError::InvalidData(format!("unknown run status {other}"))),
    }
}

fn run_status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Passed => "passed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

impl TryFrom<PipelineRunRow> for PipelineRun {
    type Error = DbError;

    fn try_from(row: PipelineRunRow) -> Result<Self, Self::Error> {
        let trigger: TriggerContext =
            serde_json::from_value(row.trigger).map_err(|e| DbError::InvalidData(e.to_string()))?;
        let active_step_ids: Vec<String> = serde_json::from_value(row.active_step_ids)
            .map_err(|e| DbError::InvalidData(e.to_string()))?;
        let completed_step_ids: Vec<String> = serde_json::from_value(row.completed_step_ids)
            .map_err(|e| DbError::InvalidData(e.to_string()))?;
        Ok(PipelineRun {
            id: ResourceId::from_uuid(row.id),
            pipeline_id: ResourceId::from_uuid(row.pipeline_id),
            status: parse_run_status(&row.status)?,
            trigger,
            active_step_ids,
            completed_step_ids,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[async_trait]
pub trait PipelineRepo: Send + Sync {
    async fn create(&self, pipeline: &Pipeline) -> DbResult<Pipeline>;
    async fn get_by_id(&self, id: ResourceId) -> DbResult<Pipeline>;
    async fn list_by_repository(&self, repository_id: ResourceId) -> DbResult<Vec<Pipeline>>;

    async fn create_run(&self, run: &PipelineRun) -> DbResult<PipelineRun>;
    async fn get_run(&self, id: ResourceId) -> DbResult<PipelineRun>;
    async fn list_runs(&self, pipeline_id: ResourceId, limit: i64) -> DbResult<Vec<PipelineRun>>;
    async fn update_run(&self, run: &PipelineRun) -> DbResult<()>;
}

pub struct PgPipelineRepo {
    pool: PgPool,
}

impl PgPipelineRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineRepo for PgPipelineRepo {
    async fn create(&self, pipeline: &Pipeline) -> DbResult<Pipeline> {
        let definition = serde_json::to_value(&pipeline.definition).map_err(|e| DbError::InvalidData(e.to_string()))?;
        let row = sqlx::query_as::<_, PipelineRow>(
            r#"
            INSERT INTO pipelines (id, repository_id, name, definition, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING id, repository_id, name, definition, created_at
            "#,
        )
        .bind(pipeline.id.as_uuid())
        .bind(pipeline.repository_id.as_uuid())
        .bind(&pipeline.name)
        .bind(definition)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_by_id(&self, id: ResourceId) -> DbResult<Pipeline> {
        let row = sqlx::query_as::<_, PipelineRow>(
            "SELECT id, repository_id, name, definition, created_at FROM pipelines WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("pipeline {id}")))?;
        row.try_into()
    }

    async fn list_by_repository(&self, repository_id: ResourceId) -> DbResult<Vec<Pipeline>> {
        let rows = sqlx::query_as::<_, PipelineRow>(
            "SELECT id, repository_id, name, definition, created_at FROM pipelines WHERE repository_id = $1 ORDER BY name",
        )
        .bind(repository_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn create_run(&self, run: &PipelineRun) -> DbResult<PipelineRun> {
        let trigger = serde_json::to_value(&run.trigger).map_err(|e| DbError::InvalidData(e.to_string()))?;
        let row = sqlx::query_as::<_, PipelineRunRow>(
            r#"
            INSERT INTO pipeline_runs (
                id, pipeline_id, status, trigger, active_step_ids, completed_step_ids, created_at
            )
            VALUES ($1, $2, $3, $4, '[]'::jsonb, '[]'::jsonb, NOW())
            RETURNING id, pipeline_id, status, trigger, active_step_ids, completed_step_ids,
                      created_at, started_at, finished_at
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.pipeline_id.as_uuid())
        .bind(run_status_str(run.status))
        .bind(trigger)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_run(&self, id: ResourceId) -> DbResult<PipelineRun> {
        let row = sqlx::query_as::<_, PipelineRunRow>(
            r#"
            SELECT id, pipeline_id, status, trigger, active_step_ids, completed_step_ids,
                   created_at, started_at, finished_at
            FROM pipeline_runs WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("pipeline run {id}")))?;
        row.try_into()
    }

    async fn list_runs(&self, pipeline_id: ResourceId, limit: i64) -> DbResult<Vec<PipelineRun>> {
        let rows = sqlx::query_as::<_, PipelineRunRow>(
            r#"
            SELECT id, pipeline_id, status, trigger, active_step_ids, completed_step_ids,
                   created_at, started_at, finished_at
            FROM pipeline_runs WHERE pipeline_id = $1 ORDER BY created_at DESC LIMIT $2
            "#,
        )
        .bind(pipeline_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_run(&self, run: &PipelineRun) -> DbResult<()> {
        let active = serde_json::to_value(&run.active_step_ids).map_err(|e| DbError::InvalidData(e.to_string()))?;
        let completed = serde_json::to_value(&run.completed_step_ids).map_err(|e| DbError::InvalidData(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $2, active_step_ids = $3, completed_step_ids = $4,
                started_at = $5, finished_at = $6
            WHERE id = $1
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run_status_str(run.status))
        .bind(active)
        .bind(completed)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
