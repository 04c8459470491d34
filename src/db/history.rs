use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use super::models::JobRecord;

/// Write side of the job history. The engine only ever writes.
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    /// Insert `record` and assign its `id`.
    async fn create(&self, record: &mut JobRecord) -> Result<()>;
    /// Persist the current state of an existing record.
    async fn save(&self, record: &JobRecord) -> Result<()>;
}

/// Read side used by the HTTP API.
#[async_trait]
pub trait HistoryQuery: Send + Sync {
    /// Most recent records first.
    async fn recent(&self, limit: i64) -> Result<Vec<JobRecord>>;
}

#[derive(Debug, Clone)]
pub struct PgHistoryRecorder {
    pool: PgPool,
}

impl PgHistoryRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryRecorder for PgHistoryRecorder {
    async fn create(&self, record: &mut JobRecord) -> Result<()> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO job_history
                (device_id, scheduled_at, started_at, ended_at, status, duration_secs, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&record.device_id)
        .bind(record.scheduled_at)
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.status)
        .bind(record.duration_secs)
        .bind(&record.notes)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert job history record")?;

        record.id = id;
        Ok(())
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_history
            SET started_at    = $2,
                ended_at      = $3,
                status        = $4,
                duration_secs = $5,
                notes         = $6
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.status)
        .bind(record.duration_secs)
        .bind(&record.notes)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update job history record {}", record.id))?;
        Ok(())
    }
}

#[async_trait]
impl HistoryQuery for PgHistoryRecorder {
    async fn recent(&self, limit: i64) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, device_id, scheduled_at, started_at, ended_at,
                   status, duration_secs, notes
            FROM job_history
            ORDER BY scheduled_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query job history")?;
        Ok(rows)
    }
}
