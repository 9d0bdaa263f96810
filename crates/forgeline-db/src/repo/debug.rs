//! Debug-session persistence (§4.9): the `state_history` column lets a
//! session's transition log survive a process restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgeline_core::debug::DebugSession;
use forgeline_core::ResourceId;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct DebugSessionRow {
    id: Uuid,
    session: serde_json::Value,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

impl TryFrom<DebugSessionRow> for DebugSession {
    type Error = DbError;

    fn try_from(row: DebugSessionRow) -> Result<Self, Self::Error> {
        serde_json::from_value(row.session).map_err(|e| DbError::InvalidData(e.to_string()))
    }
}

#[async_trait]
pub trait DebugSessionRepo: Send + Sync {
    async fn upsert(&self, session: &DebugSession) -> DbResult<()>;
    async fn get(&self, id: ResourceId) -> DbResult<DebugSession>;
    async fn delete(&self, id: ResourceId) -> DbResult<()>;
}

pub struct PgDebugSessionRepo {
    pool: PgPool,
}

impl PgDebugSessionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DebugSessionRepo for PgDebugSessionRepo {
    async fn upsert(&self, session: &DebugSession) -> DbResult<()> {
        let snapshot = serde_json::to_value(session).map_err(|e| DbError::InvalidData(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO debug_sessions (id, session, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET session = EXCLUDED.session
            "#,
        )
        .bind(session.id.as_uuid())
        .bind(snapshot)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> DbResult<DebugSession> {
        let row = sqlx::query_as::<_, DebugSessionRow>(
            "SELECT id, session, created_at FROM debug_sessions WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("debug session {id}")))?;
        row.try_into()
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM debug_sessions WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
