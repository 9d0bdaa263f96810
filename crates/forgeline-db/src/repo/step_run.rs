//! Step-run persistence (§3, §4.11).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgeline_core::pipeline::{StepRun, StepRunStatus};
use forgeline_core::ResourceId;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct StepRunRow {
    id: Uuid,
    pipeline_run_id: Uuid,
    step_id: String,
    step_index: i32,
    attempt: i32,
    status: String,
    job_id: Option<Uuid>,
    logs: String,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

fn parse_status(s: &str) -> DbResult<StepRunStatus> {
    match s {
        "pending" => Ok(StepRunStatus::Pending),
        "running" => Ok(StepRunStatus::Running),
        "passed" => Ok(StepRunStatus::Passed),
        "failed" => Ok(StepRunStatus::Failed),
        "cancelled" => Ok(StepRunStatus::Cancelled),
        other => Err(DbError::InvalidData(format!("unknown step run status {other}"))),
    }
}

fn status_str(status: StepRunStatus) -> &'static str {
    match status {
        StepRunStatus::Pending => "pending",
        StepRunStatus::Running => "running",
        StepRunStatus::Passed => "passed",
        StepRunStatus::Failed => "failed",
        StepRunStatus::Cancelled => "cancelled",
    }
}

impl TryFrom<StepRunRow> for StepRun {
    type Error = DbError;

    fn try_from(row: StepRunRow) -> Result<Self, Self::Error> {
        Ok(StepRun {
            id: ResourceId::from_uuid(row.id),
            pipeline_run_id: ResourceId::from_uuid(row.pipeline_run_id),
            step_id: row.step_id,
            step_index: row.step_index as usize,
            attempt: row.attempt as u32,
            status: parse_status(&row.status)?,
            job_id: row.job_id.map(ResourceId::from_uuid),
            logs: row.logs,
            error: row.error,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[async_trait]
pub trait StepRunRepo: Send + Sync {
    async fn create(&self, step_run: &StepRun) -> DbResult<StepRun>;
    async fn get(&self, id: ResourceId) -> DbResult<StepRun>;
    async fn list_for_run(&self, pipeline_run_id: ResourceId) -> DbResult<Vec<StepRun>>;
    async fn update(&self, step_run: &StepRun) -> DbResult<()>;
    /// Step runs left `running` by an unclean shutdown, across all pipeline runs.
    async fn list_running(&self) -> DbResult<Vec<StepRun>>;
}

pub struct PgStepRunRepo {
    pool: PgPool,
}

impl PgStepRunRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StepRunRepo for PgStepRunRepo {
    async fn create(&self, step_run: &StepRun) -> DbResult<StepRun> {
        let row = sqlx::query_as::<_, StepRunRow>(
            r#"
            INSERT INTO step_runs (
                id, pipeline_run_id, step_id, step_index, attempt, status,
                job_id, logs, error, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, '', NULL, NULL, NULL)
            RETURNING id, pipeline_run_id, step_id, step_index, attempt, status,
                      job_id, logs, error, started_at, finished_at
            "#,
        )
        .bind(step_run.id.as_uuid())
        .bind(step_run.pipeline_run_id.as_uuid())
        .bind(&step_run.step_id)
        .bind(step_run.step_index as i32)
        .bind(step_run.attempt as i32)
        .bind(status_str(step_run.status))
        .bind(step_run.job_id.map(|id| *id.as_uuid()))
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get(&self, id: ResourceId) -> DbResult<StepRun> {
        let row = sqlx::query_as::<_, StepRunRow>(
            r#"
            SELECT id, pipeline_run_id, step_id, step_index, attempt, status,
                   job_id, logs, error, started_at, finished_at
            FROM step_runs WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("step run {id}")))?;
        row.try_into()
    }

    async fn list_for_run(&self, pipeline_run_id: ResourceId) -> DbResult<Vec<StepRun>> {
        let rows = sqlx::query_as::<_, StepRunRow>(
            r#"
            SELECT id, pipeline_run_id, step_id, step_index, attempt, status,
                   job_id, logs, error, started_at, finished_at
            FROM step_runs WHERE pipeline_run_id = $1 ORDER BY step_index, attempt
            "#,
        )
        .bind(pipeline_run_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update(&self, step_run: &StepRun) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE step_runs
            SET status = $2, job_id = $3, logs = $4, error = $5,
                started_at = $6, finished_at = $7
            WHERE id = $1
            "#,
        )
        .bind(step_run.id.as_uuid())
        .bind(status_str(step_run.status))
        .bind(step_run.job_id.map(|id| *id.as_uuid()))
        .bind(&step_run.logs)
        .bind(&step_run.error)
        .bind(step_run.started_at)
        .bind(step_run.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_running(&self) -> DbResult<Vec<StepRun>> {
        let rows = sqlx::query_as::<_, StepRunRow>(
            r#"
            SELECT id, pipeline_run_id, step_id, step_index, attempt, status,
                   job_id, logs, error, started_at, finished_at
            FROM step_runs WHERE status = 'running'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
