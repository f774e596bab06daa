//! SQLite-backed step store.
//!
//! This is the durable backend: step payloads written here survive process
//! restarts, so a replayed run skips completed work even after a crash.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::store::{RunOutcome, RunRecord, RunStatus, StepRecord, StepStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mf_runs (
    run_id TEXT PRIMARY KEY,
    pipeline TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    current_step TEXT,
    result TEXT,
    failed_step TEXT,
    error_message TEXT,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    task_id TEXT
);

CREATE TABLE IF NOT EXISTS mf_steps (
    run_id TEXT NOT NULL REFERENCES mf_runs(run_id),
    step_name TEXT NOT NULL,
    step_index INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    payload TEXT,
    last_error TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (run_id, step_name)
);

CREATE INDEX IF NOT EXISTS idx_mf_runs_status ON mf_runs(status, started_at);
CREATE INDEX IF NOT EXISTS idx_mf_steps_run ON mf_steps(run_id);
"#;

/// Stored error messages are clipped to this many bytes.
pub(crate) const ERROR_LIMIT: usize = 2000;

/// Clip an error message to at most `limit` bytes without splitting a
/// multi-byte character.
pub(crate) fn clip_error(error: &str, limit: usize) -> &str {
    if error.len() <= limit {
        return error;
    }
    let mut end = limit;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Processing => "processing",
        RunStatus::Done => "done",
        RunStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> RunStatus {
    match s {
        "processing" => RunStatus::Processing,
        "done" => RunStatus::Done,
        "failed" => RunStatus::Failed,
        _ => RunStatus::Pending,
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&format!("{}Z", raw.replace(' ', "T")))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

type RunRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
);

fn run_from_row(row: RunRow) -> anyhow::Result<RunRecord> {
    let (run_id, pipeline, status, current_step, result, failed_step, error, started_at, task_id) =
        row;
    let result = match result {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };
    Ok(RunRecord {
        run_id,
        pipeline,
        status: parse_status(&status),
        current_step,
        result,
        failed_step,
        error,
        started_at: parse_timestamp(&started_at),
        task_id,
    })
}

/// SQLite-backed run and step records.
#[derive(Clone)]
pub struct SqliteStepStore {
    pool: SqlitePool,
}

impl SqliteStepStore {
    /// Create a new store with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StepStore for SqliteStepStore {
    async fn start_run(
        &self,
        run_id: &str,
        pipeline: &str,
        task_id: Option<&str>,
    ) -> anyhow::Result<RunRecord> {
        sqlx::query(
            "INSERT INTO mf_runs (run_id, pipeline, task_id) VALUES (?, ?, ?) \
             ON CONFLICT(run_id) DO NOTHING",
        )
        .bind(run_id)
        .bind(pipeline)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE mf_runs SET status = 'processing' WHERE run_id = ? AND status = 'pending'")
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        self.load_run(run_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("run '{run_id}' missing after insert"))
    }

    async fn load_run(&self, run_id: &str) -> anyhow::Result<Option<RunRecord>> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT run_id, pipeline, status, current_step, result, failed_step, \
             error_message, started_at, task_id FROM mf_runs WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(run_from_row).transpose()
    }

    async fn start_step(&self, run_id: &str, step: &str, index: u32) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO mf_steps (run_id, step_name, step_index) VALUES (?, ?, ?) \
             ON CONFLICT(run_id, step_name) DO NOTHING",
        )
        .bind(run_id)
        .bind(step)
        .bind(index as i64)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE mf_runs SET current_step = ? WHERE run_id = ?")
            .bind(step)
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_step(&self, run_id: &str, step: &str) -> anyhow::Result<Option<StepRecord>> {
        let row: Option<(String, i64, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT step_name, attempts, payload, last_error FROM mf_steps \
             WHERE run_id = ? AND step_name = ?",
        )
        .bind(run_id)
        .bind(step)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(step_name, attempts, payload, last_error)| -> anyhow::Result<StepRecord> {
            let payload = match payload {
                Some(raw) => Some(serde_json::from_str(&raw)?),
                None => None,
            };
            Ok(StepRecord {
                step_name,
                attempts: attempts as u32,
                payload,
                last_error,
            })
        })
        .transpose()
    }

    async fn record_attempt(
        &self,
        run_id: &str,
        step: &str,
        attempt: u32,
        error: &str,
    ) -> anyhow::Result<()> {
        let truncated = clip_error(error, ERROR_LIMIT);

        sqlx::query(
            "UPDATE mf_steps SET attempts = ?, last_error = ?, updated_at = datetime('now') \
             WHERE run_id = ? AND step_name = ?",
        )
        .bind(attempt as i64)
        .bind(truncated)
        .bind(run_id)
        .bind(step)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_success(
        &self,
        run_id: &str,
        step: &str,
        attempt: u32,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let payload_str = serde_json::to_string(payload)?;

        sqlx::query(
            "UPDATE mf_steps SET attempts = ?, payload = ?, updated_at = datetime('now') \
             WHERE run_id = ? AND step_name = ?",
        )
        .bind(attempt as i64)
        .bind(payload_str)
        .bind(run_id)
        .bind(step)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_run(&self, run_id: &str, outcome: RunOutcome) -> anyhow::Result<()> {
        match outcome {
            RunOutcome::Done { result } => {
                let result_str = serde_json::to_string(&result)?;
                sqlx::query(
                    "UPDATE mf_runs SET status = ?, result = ? WHERE run_id = ?",
                )
                .bind(status_str(RunStatus::Done))
                .bind(result_str)
                .bind(run_id)
                .execute(&self.pool)
                .await?;
            }
            RunOutcome::Failed { step, error } => {
                sqlx::query(
                    "UPDATE mf_runs SET status = ?, failed_step = ?, error_message = ? \
                     WHERE run_id = ?",
                )
                .bind(status_str(RunStatus::Failed))
                .bind(step)
                .bind(error)
                .bind(run_id)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::clip_error;

    #[test]
    fn clip_error_backs_off_to_a_char_boundary() {
        let long = format!("{}{}", "x".repeat(1999), "\u{e9}".repeat(200));
        let clipped = clip_error(&long, 2000);
        assert_eq!(clipped.len(), 1999);
        assert!(clipped.ends_with('x'));
    }

    #[test]
    fn clip_error_keeps_short_messages_intact() {
        assert_eq!(clip_error("backend unavailable", 2000), "backend unavailable");
    }
}
