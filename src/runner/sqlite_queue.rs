//! SQLite implementation of the job queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::queue::{JobError, JobId, JobQueue, QueuedJob};

/// SQLite-backed job queue.
pub struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    /// Wrap an open connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the jobs table and its index if missing.
    pub async fn run_migrations(&self) -> Result<(), JobError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mf_jobs (
                id INTEGER PRIMARY KEY,
                pipeline TEXT NOT NULL,
                input TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                started_at TEXT,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| JobError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_mf_jobs_status
            ON mf_jobs(status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| JobError::Storage(e.to_string()))?;

        Ok(())
    }
}

fn job_from_row(row: (i64, String, String, String)) -> Result<QueuedJob, JobError> {
    let (id, pipeline, input, created_at) = row;
    let input = serde_json::from_str(&input).map_err(|e| JobError::Deserialization(e.to_string()))?;
    let created = DateTime::parse_from_rfc3339(&format!("{}Z", created_at.replace(' ', "T")))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(QueuedJob {
        id: JobId(id),
        pipeline,
        input,
        created_at: created,
    })
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, pipeline: &str, input: serde_json::Value) -> Result<JobId, JobError> {
        let input_str =
            serde_json::to_string(&input).map_err(|e| JobError::Serialization(e.to_string()))?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO mf_jobs (pipeline, input)
            VALUES (?, ?)
            RETURNING id
            "#,
        )
        .bind(pipeline)
        .bind(input_str)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| JobError::Storage(e.to_string()))?;

        Ok(JobId(id))
    }

    async fn claim(&self, limit: usize) -> Result<Vec<QueuedJob>, JobError> {
        // No UPDATE ... LIMIT ... RETURNING in SQLite; select the ids and
        // flip them inside one transaction instead
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| JobError::Storage(e.to_string()))?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM mf_jobs
            WHERE status = 'pending'
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| JobError::Storage(e.to_string()))?;

        if ids.is_empty() {
            tx.commit()
                .await
                .map_err(|e| JobError::Storage(e.to_string()))?;
            return Ok(vec![]);
        }

        let placeholders: Vec<String> = ids.iter().map(|_| "?".to_string()).collect();
        let in_clause = placeholders.join(",");

        let update_query = format!(
            "UPDATE mf_jobs SET status = 'running', started_at = datetime('now') WHERE id IN ({})",
            in_clause
        );
        let mut update = sqlx::query(&update_query);
        for id in &ids {
            update = update.bind(id);
        }
        update
            .execute(&mut *tx)
            .await
            .map_err(|e| JobError::Storage(e.to_string()))?;

        let select_query = format!(
            "SELECT id, pipeline, input, created_at FROM mf_jobs WHERE id IN ({})",
            in_clause
        );
        let mut select = sqlx::query_as::<_, (i64, String, String, String)>(&select_query);
        for id in &ids {
            select = select.bind(id);
        }
        let rows = select
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| JobError::Storage(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| JobError::Storage(e.to_string()))?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn recover_orphans(&self) -> Result<usize, JobError> {
        let result = sqlx::query(
            r#"
            UPDATE mf_jobs
            SET status = 'pending', started_at = NULL
            WHERE status = 'running'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| JobError::Storage(e.to_string()))?;

        Ok(result.rows_affected() as usize)
    }

    async fn complete(&self, id: JobId) -> Result<(), JobError> {
        sqlx::query(
            r#"
            UPDATE mf_jobs
            SET status = 'completed', completed_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| JobError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<(), JobError> {
        let truncated_error = crate::sqlite::clip_error(error, crate::sqlite::ERROR_LIMIT);

        sqlx::query(
            r#"
            UPDATE mf_jobs
            SET status = 'failed', completed_at = datetime('now'), error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(truncated_error)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| JobError::Storage(e.to_string()))?;

        Ok(())
    }
}
