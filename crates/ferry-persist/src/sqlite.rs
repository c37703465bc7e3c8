//! SQLite job store

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};

use ferry_queue::{Claim, JobRecord, JobStore, NewJobRecord, StoreError, EXPIRED_FINAL_ATTEMPT};

use crate::config::StoreConfig;
use crate::error::{backend, parse_count, parse_job_id, PersistError};

const RETURNING: &str = "id, job_id, queue_name, job_data, available_at, created_at, attempts, \
                         max_attempts, reserved_at, completed_at, error, failed_at";

/// Job store on a SQLite database.
///
/// SQLite allows one writer at a time, so the claim's single
/// `UPDATE … RETURNING` statement is atomic without explicit row locks.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Connect and run migrations
    pub async fn connect_with_config(config: &StoreConfig) -> Result<Self, PersistError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| PersistError::Connection(e.to_string()))?
            .create_if_missing(true);

        options = options.pragma("busy_timeout", (config.busy_timeout_secs * 1000).to_string());
        if config.wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| PersistError::Connection(e.to_string()))?;

        info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite");

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), PersistError> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| PersistError::Migration(e.to_string()))
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn record_from_row(row: &SqliteRow) -> Result<JobRecord, StoreError> {
    let job_id: String = row.try_get("job_id").map_err(backend)?;
    let attempts: i64 = row.try_get("attempts").map_err(backend)?;
    let max_attempts: i64 = row.try_get("max_attempts").map_err(backend)?;

    Ok(JobRecord {
        id: row.try_get("id").map_err(backend)?,
        job_id: parse_job_id(&job_id)?,
        queue_name: row.try_get("queue_name").map_err(backend)?,
        job_data: row.try_get("job_data").map_err(backend)?,
        available_at: row.try_get("available_at").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        attempts: parse_count("attempts", attempts)?,
        max_attempts: parse_count("max_attempts", max_attempts)?,
        reserved_at: row.try_get("reserved_at").map_err(backend)?,
        completed_at: row.try_get("completed_at").map_err(backend)?,
        error: row.try_get("error").map_err(backend)?,
        failed_at: row.try_get("failed_at").map_err(backend)?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, record: NewJobRecord) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO jobs (job_id, queue_name, job_data, available_at, created_at, attempts, max_attempts) \
             VALUES (?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(record.job_id.to_string())
        .bind(&record.queue_name)
        .bind(&record.job_data)
        .bind(record.available_at)
        .bind(record.created_at)
        .bind(i64::from(record.max_attempts))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.last_insert_rowid())
    }

    async fn claim_next(
        &self,
        queue_name: &str,
        now: i64,
        stale_before: i64,
    ) -> Result<Option<JobRecord>, StoreError> {
        let expired = sqlx::query(
            r#"
            UPDATE jobs
            SET error = ?1, failed_at = ?2, reserved_at = NULL
            WHERE queue_name = ?3
              AND completed_at IS NULL
              AND failed_at IS NULL
              AND attempts >= max_attempts
              AND reserved_at < ?4
            "#,
        )
        .bind(EXPIRED_FINAL_ATTEMPT)
        .bind(now)
        .bind(queue_name)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if expired.rows_affected() > 0 {
            warn!(queue = queue_name, rows = expired.rows_affected(), "Failed rows whose final attempt was abandoned");
        }

        let sql = format!(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                reserved_at = ?1
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue_name = ?2
                  AND completed_at IS NULL
                  AND failed_at IS NULL
                  AND available_at <= ?1
                  AND attempts < max_attempts
                  AND (reserved_at IS NULL OR reserved_at < ?3)
                ORDER BY available_at ASC, id ASC
                LIMIT 1
            )
            RETURNING {RETURNING}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(now)
            .bind(queue_name)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        let record = row.as_ref().map(record_from_row).transpose()?;
        if let Some(record) = &record {
            debug!(job_id = %record.job_id, attempts = record.attempts, queue = queue_name, "Claimed job row");
        }
        Ok(record)
    }

    async fn complete(&self, claim: &Claim, now: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET completed_at = ?1, reserved_at = NULL \
             WHERE job_id = ?2 AND attempts = ?3 AND reserved_at = ?4",
        )
        .bind(now)
        .bind(claim.job_id.to_string())
        .bind(i64::from(claim.attempts))
        .bind(claim.reserved_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, claim: &Claim, now: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET reserved_at = NULL, available_at = ?1 \
             WHERE job_id = ?2 AND attempts = ?3 AND reserved_at = ?4",
        )
        .bind(now)
        .bind(claim.job_id.to_string())
        .bind(i64::from(claim.attempts))
        .bind(claim.reserved_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_unattempted(&self, claim: &Claim) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET max_attempts = max_attempts + 1, reserved_at = NULL \
             WHERE job_id = ?1 AND attempts = ?2 AND reserved_at = ?3",
        )
        .bind(claim.job_id.to_string())
        .bind(i64::from(claim.attempts))
        .bind(claim.reserved_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail(&self, claim: &Claim, error: &str, now: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET error = ?1, failed_at = ?2, reserved_at = NULL \
             WHERE job_id = ?3 AND attempts = ?4 AND reserved_at = ?5",
        )
        .bind(error)
        .bind(now)
        .bind(claim.job_id.to_string())
        .bind(i64::from(claim.attempts))
        .bind(claim.reserved_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self, queue_name: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE queue_name = ? AND completed_at IS NULL AND failed_at IS NULL",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(count as u64)
    }

    async fn clear(&self, queue_name: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE queue_name = ?")
            .bind(queue_name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar("SELECT DISTINCT queue_name FROM jobs ORDER BY queue_name")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)
    }

    async fn prune_completed(&self, before: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE completed_at IS NOT NULL AND completed_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }
}
