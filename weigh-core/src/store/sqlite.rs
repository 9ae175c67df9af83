//! SQLite-backed outbox store, grounded on `store_postgres.rs`'s
//! query/transaction style. The single operator-supplied database file
//! (§6 "Persisted layout") replaces the teacher's Postgres cluster; a
//! pool capped at one connection gives the "single process-wide writer
//! lock, many concurrent readers" discipline of §4.3 without needing
//! Postgres's `FOR UPDATE SKIP LOCKED` — SQLite's own connection-level
//! locking already serializes writers.

use super::Store;
use crate::error::{Error, Result};
use crate::model::{
    BatchId, BatchRun, BatchState, BatchStatus, CompletionMode, DeviceId, ErpJob, EventId,
    JobKind, JobStatus, PauseReason, PrintJob, ProductId, Timestamp,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if absent) the single database file at `path`.
    /// `path` may also be `:memory:`, used by tests.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        Ok(SqliteStore { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn completion_mode_str(m: CompletionMode) -> &'static str {
    match m {
        CompletionMode::StatusQuery => "STATUS_QUERY",
        CompletionMode::ScanRecon => "SCAN_RECON",
    }
}

fn completion_mode_from_str(s: &str) -> CompletionMode {
    match s {
        "SCAN_RECON" => CompletionMode::ScanRecon,
        _ => CompletionMode::StatusQuery,
    }
}

fn row_to_print_job(row: &sqlx::sqlite::SqliteRow) -> Result<PrintJob> {
    Ok(PrintJob {
        job_id: row.try_get("job_id")?,
        event_id: row.try_get("event_id")?,
        device_id: row.try_get("device_id")?,
        batch_id: row.try_get("batch_id")?,
        seq: row.try_get::<i64, _>("seq")? as u64,
        status: JobStatus::from_str(row.try_get::<String, _>("status")?.as_str())
            .ok_or_else(|| Error::Fatal("unknown job status in print_outbox".into()))?,
        completion_mode: completion_mode_from_str(&row.try_get::<String, _>("completion_mode")?),
        payload_json: row.try_get("payload_json")?,
        payload_hash: row.try_get("payload_hash")?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        next_retry_at: row.try_get::<Option<i64>, _>("next_retry_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_erp_job(row: &sqlx::sqlite::SqliteRow) -> Result<ErpJob> {
    Ok(ErpJob {
        job_id: row.try_get("job_id")?,
        event_id: row.try_get("event_id")?,
        device_id: row.try_get("device_id")?,
        batch_id: row.try_get("batch_id")?,
        seq: row.try_get::<i64, _>("seq")? as u64,
        status: JobStatus::from_str(row.try_get::<String, _>("status")?.as_str())
            .ok_or_else(|| Error::Fatal("unknown job status in erp_outbox".into()))?,
        payload_json: row.try_get("payload_json")?,
        payload_hash: row.try_get("payload_hash")?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        wait_print_checks: row.try_get::<i64, _>("wait_print_checks")? as u32,
        next_retry_at: row.try_get::<Option<i64>, _>("next_retry_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn initialize(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        tracing::info!("outbox store migrations applied");
        Ok(())
    }

    async fn start_batch(
        &self,
        device_id: &DeviceId,
        batch_id: &BatchId,
        product_id: &ProductId,
        now: Timestamp,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO batch_state (device_id, batch_id, product_id, next_seq, status, updated_at)
            VALUES (?, ?, ?, 1, 'ACTIVE', ?)
            ON CONFLICT (device_id, batch_id) DO UPDATE SET
                product_id = excluded.product_id,
                next_seq = 1,
                status = 'ACTIVE',
                updated_at = excluded.updated_at
            "#,
        )
        .bind(device_id)
        .bind(batch_id)
        .bind(product_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO batch_runs (run_id, device_id, batch_id, product_id, started_at, stopped_at, stop_reason)
            VALUES (?, ?, ?, ?, ?, NULL, NULL)
            "#,
        )
        .bind(crate::model::new_opaque_id())
        .bind(device_id)
        .bind(batch_id)
        .bind(product_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn stop_batch(
        &self,
        device_id: &DeviceId,
        batch_id: &BatchId,
        reason: PauseReason,
        now: Timestamp,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE batch_state SET status = 'STOPPED', updated_at = ? WHERE device_id = ? AND batch_id = ?",
        )
        .bind(now)
        .bind(device_id)
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE batch_runs SET stopped_at = ?, stop_reason = ?
            WHERE run_id = (
                SELECT run_id FROM batch_runs
                WHERE device_id = ? AND batch_id = ? AND stopped_at IS NULL
                ORDER BY started_at DESC LIMIT 1
            )
            "#,
        )
        .bind(now)
        .bind(reason.to_string())
        .bind(device_id)
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn allocate_and_enqueue(
        &self,
        device_id: &DeviceId,
        batch_id: &BatchId,
        event_id: &EventId,
        payload_json: &str,
        payload_hash: &str,
        completion_mode: CompletionMode,
        now: Timestamp,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT next_seq FROM batch_state WHERE device_id = ? AND batch_id = ?")
            .bind(device_id)
            .bind(batch_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::Fatal(format!("missing batch_state for {device_id}/{batch_id}")))?;
        let seq: i64 = row.try_get("next_seq")?;

        sqlx::query("UPDATE batch_state SET next_seq = ?, updated_at = ? WHERE device_id = ? AND batch_id = ?")
            .bind(seq + 1)
            .bind(now)
            .bind(device_id)
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;

        let print_job_id = crate::model::new_opaque_id();
        sqlx::query(
            r#"
            INSERT INTO print_outbox (
                job_id, event_id, device_id, batch_id, seq, status, completion_mode,
                payload_json, payload_hash, attempts, next_retry_at, last_error,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 'NEW', ?, ?, ?, 0, NULL, NULL, ?, ?)
            "#,
        )
        .bind(&print_job_id)
        .bind(event_id)
        .bind(device_id)
        .bind(batch_id)
        .bind(seq)
        .bind(completion_mode_str(completion_mode))
        .bind(payload_json)
        .bind(payload_hash)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let erp_job_id = crate::model::new_opaque_id();
        sqlx::query(
            r#"
            INSERT INTO erp_outbox (
                job_id, event_id, device_id, batch_id, seq, status,
                payload_json, payload_hash, attempts, wait_print_checks,
                next_retry_at, last_error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 'NEW', ?, ?, 0, 0, NULL, NULL, ?, ?)
            "#,
        )
        .bind(&erp_job_id)
        .bind(event_id)
        .bind(device_id)
        .bind(batch_id)
        .bind(seq)
        .bind(payload_json)
        .bind(payload_hash)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(event_id = %event_id, seq, "allocated outbox seq");
        Ok(seq as u64)
    }

    async fn fetch_next_print(&self, now: Timestamp) -> Result<Option<PrintJob>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM print_outbox
            WHERE status IN ('NEW', 'RETRY') AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY created_at ASC LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_print_job).transpose()
    }

    async fn fetch_next_erp(&self, now: Timestamp) -> Result<Option<ErpJob>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM erp_outbox
            WHERE status IN ('NEW', 'RETRY') AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY created_at ASC LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_erp_job).transpose()
    }

    async fn mark_status(
        &self,
        kind: JobKind,
        event_id: &EventId,
        status: JobStatus,
        now: Timestamp,
    ) -> Result<()> {
        let table = match kind {
            JobKind::Print => "print_outbox",
            JobKind::Erp => "erp_outbox",
        };
        let sql = format!("UPDATE {table} SET status = ?, updated_at = ? WHERE event_id = ?");
        sqlx::query(&sql)
            .bind(status.as_str())
            .bind(now)
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        kind: JobKind,
        event_id: &EventId,
        next_retry_at: Timestamp,
        error: &str,
        now: Timestamp,
    ) -> Result<()> {
        let table = match kind {
            JobKind::Print => "print_outbox",
            JobKind::Erp => "erp_outbox",
        };
        let sql = format!(
            "UPDATE {table} SET status = 'RETRY', attempts = attempts + 1, next_retry_at = ?, last_error = ?, updated_at = ? WHERE event_id = ?"
        );
        sqlx::query(&sql)
            .bind(next_retry_at)
            .bind(error)
            .bind(now)
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_wait_print(
        &self,
        event_id: &EventId,
        next_retry_at: Timestamp,
        now: Timestamp,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE erp_outbox
            SET status = 'RETRY', wait_print_checks = wait_print_checks + 1,
                next_retry_at = ?, last_error = 'WAIT_PRINT', updated_at = ?
            WHERE event_id = ?
            "#,
        )
        .bind(next_retry_at)
        .bind(now)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_needs_operator(
        &self,
        kind: JobKind,
        event_id: &EventId,
        error: &str,
        now: Timestamp,
    ) -> Result<()> {
        let table = match kind {
            JobKind::Print => "print_outbox",
            JobKind::Erp => "erp_outbox",
        };
        let sql = format!(
            "UPDATE {table} SET status = 'NEEDS_OPERATOR', last_error = ?, updated_at = ? WHERE event_id = ?"
        );
        sqlx::query(&sql)
            .bind(error)
            .bind(now)
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_completion_mode(
        &self,
        event_id: &EventId,
        mode: CompletionMode,
        now: Timestamp,
    ) -> Result<()> {
        sqlx::query("UPDATE print_outbox SET completion_mode = ?, updated_at = ? WHERE event_id = ?")
            .bind(completion_mode_str(mode))
            .bind(now)
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_status(&self, kind: JobKind, event_id: &EventId) -> Result<Option<JobStatus>> {
        let table = match kind {
            JobKind::Print => "print_outbox",
            JobKind::Erp => "erp_outbox",
        };
        let sql = format!("SELECT status FROM {table} WHERE event_id = ?");
        let row = sqlx::query(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let s: String = row.try_get("status")?;
                Ok(JobStatus::from_str(&s))
            }
        }
    }

    async fn count_pending_erp(&self) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM erp_outbox WHERE status NOT IN ('DONE', 'FAIL', 'NEEDS_OPERATOR')",
        )
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn get_batch_state(
        &self,
        device_id: &DeviceId,
        batch_id: &BatchId,
    ) -> Result<Option<BatchState>> {
        let row = sqlx::query("SELECT * FROM batch_state WHERE device_id = ? AND batch_id = ?")
            .bind(device_id)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(BatchState {
                device_id: row.try_get("device_id")?,
                batch_id: row.try_get("batch_id")?,
                product_id: row.try_get("product_id")?,
                next_seq: row.try_get::<i64, _>("next_seq")? as u64,
                status: match row.try_get::<String, _>("status")?.as_str() {
                    "STOPPED" => BatchStatus::Stopped,
                    _ => BatchStatus::Active,
                },
                updated_at: row.try_get("updated_at")?,
            })),
        }
    }

    async fn list_open_runs(&self, device_id: &DeviceId) -> Result<Vec<BatchRun>> {
        let rows = sqlx::query(
            "SELECT * FROM batch_runs WHERE device_id = ? AND stopped_at IS NULL ORDER BY started_at ASC",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(BatchRun {
                    run_id: row.try_get("run_id")?,
                    device_id: row.try_get("device_id")?,
                    batch_id: row.try_get("batch_id")?,
                    product_id: row.try_get("product_id")?,
                    started_at: row.try_get("started_at")?,
                    stopped_at: row.try_get("stopped_at")?,
                    stop_reason: None,
                })
            })
            .collect()
    }

    async fn job_counts_by_status(&self, kind: JobKind) -> Result<HashMap<JobStatus, u64>> {
        let table = match kind {
            JobKind::Print => "print_outbox",
            JobKind::Erp => "erp_outbox",
        };
        let sql = format!("SELECT status, COUNT(*) AS n FROM {table} GROUP BY status");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut counts = HashMap::new();
        for row in rows {
            let status_str: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            if let Some(status) = JobStatus::from_str(&status_str) {
                counts.insert(status, n as u64);
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_placement_through_sqlite() {
        let store = SqliteStore::connect(":memory:").await.unwrap();
        store.initialize().await.unwrap();
        store
            .start_batch(&"dev-1".into(), &"batch-1".into(), &"prod-a".into(), 1)
            .await
            .unwrap();
        let seq = store
            .allocate_and_enqueue(
                &"dev-1".into(),
                &"batch-1".into(),
                &"event-1".into(),
                "{}",
                "hash",
                CompletionMode::StatusQuery,
                2,
            )
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let job = store.fetch_next_print(3).await.unwrap().unwrap();
        assert_eq!(job.event_id, "event-1");
        store
            .mark_status(JobKind::Print, &"event-1".into(), JobStatus::Done, 4)
            .await
            .unwrap();
        assert!(store.fetch_next_print(5).await.unwrap().is_none());

        let dup = store
            .allocate_and_enqueue(
                &"dev-1".into(),
                &"batch-1".into(),
                &"event-1".into(),
                "{}",
                "hash",
                CompletionMode::StatusQuery,
                6,
            )
            .await;
        assert!(matches!(dup, Err(Error::Duplicate(_))));
    }
}
