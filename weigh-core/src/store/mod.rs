//! Outbox store (§4.3): batch lifecycle plus the paired print/ERP outboxes.
//!
//! All operations are serialised by a single process-wide writer lock;
//! readers may run concurrently. Crash recovery relies on transactional
//! atomicity around `allocate_and_enqueue` — a crash before commit leaves
//! `next_seq` unchanged and no rows; a crash after commit persists both
//! rows and the increment together.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{
    BatchId, BatchRun, BatchState, CompletionMode, DeviceId, ErpJob, EventId, JobKind, JobStatus,
    PauseReason, PrintJob, ProductId, Timestamp,
};
use async_trait::async_trait;
use std::collections::HashMap;

/// Outbox persistence, implemented by [`MemoryStore`] (tests) and
/// [`SqliteStore`] (the real backend).
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent schema creation and forward-only migrations.
    async fn initialize(&self) -> Result<()>;

    async fn start_batch(
        &self,
        device_id: &DeviceId,
        batch_id: &BatchId,
        product_id: &ProductId,
        now: Timestamp,
    ) -> Result<()>;

    async fn stop_batch(
        &self,
        device_id: &DeviceId,
        batch_id: &BatchId,
        reason: PauseReason,
        now: Timestamp,
    ) -> Result<()>;

    /// Allocates the next `seq` for `(device_id, batch_id)` and inserts the
    /// paired `print_outbox`/`erp_outbox` rows in one transaction. Returns
    /// the allocated `seq`. A uniqueness violation on `event_id` or
    /// `(batch_id, seq)` fails with [`crate::error::Error::Duplicate`] and
    /// rolls back the whole transaction.
    #[allow(clippy::too_many_arguments)]
    async fn allocate_and_enqueue(
        &self,
        device_id: &DeviceId,
        batch_id: &BatchId,
        event_id: &EventId,
        payload_json: &str,
        payload_hash: &str,
        completion_mode: CompletionMode,
        now: Timestamp,
    ) -> Result<u64>;

    async fn fetch_next_print(&self, now: Timestamp) -> Result<Option<PrintJob>>;
    async fn fetch_next_erp(&self, now: Timestamp) -> Result<Option<ErpJob>>;

    async fn mark_status(
        &self,
        kind: JobKind,
        event_id: &EventId,
        status: JobStatus,
        now: Timestamp,
    ) -> Result<()>;

    async fn mark_retry(
        &self,
        kind: JobKind,
        event_id: &EventId,
        next_retry_at: Timestamp,
        error: &str,
        now: Timestamp,
    ) -> Result<()>;

    /// Increments `wait_print_checks` and records the gating backoff
    /// (ERP-only; §4.4 "ERP Worker" step 1).
    async fn mark_wait_print(
        &self,
        event_id: &EventId,
        next_retry_at: Timestamp,
        now: Timestamp,
    ) -> Result<()>;

    async fn mark_needs_operator(
        &self,
        kind: JobKind,
        event_id: &EventId,
        error: &str,
        now: Timestamp,
    ) -> Result<()>;

    /// Print-only: rewrites `completion_mode` once the print worker learns
    /// the printer has no status probe, or RFID resolution failed.
    async fn update_completion_mode(
        &self,
        event_id: &EventId,
        mode: CompletionMode,
        now: Timestamp,
    ) -> Result<()>;

    async fn get_status(&self, kind: JobKind, event_id: &EventId) -> Result<Option<JobStatus>>;

    async fn count_pending_erp(&self) -> Result<u64>;

    // --- Read surface (SPEC_FULL §10.6) ---

    async fn get_batch_state(
        &self,
        device_id: &DeviceId,
        batch_id: &BatchId,
    ) -> Result<Option<BatchState>>;

    async fn list_open_runs(&self, device_id: &DeviceId) -> Result<Vec<BatchRun>>;

    async fn job_counts_by_status(&self, kind: JobKind) -> Result<HashMap<JobStatus, u64>>;
}
