//! In-memory outbox store for tests, grounded on `store_memory.rs`'s
//! `RwLock<Inner>` + plain `HashMap`/`Vec` shape.

use super::Store;
use crate::error::{Error, Result};
use crate::model::{
    new_opaque_id, BatchId, BatchRun, BatchState, BatchStatus, CompletionMode, DeviceId, ErpJob,
    EventId, JobKind, JobStatus, PauseReason, PrintJob, ProductId, Timestamp,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

struct Inner {
    batch_states: HashMap<(DeviceId, BatchId), BatchState>,
    batch_runs: Vec<BatchRun>,
    print_jobs: HashMap<EventId, PrintJob>,
    print_order: Vec<EventId>,
    erp_jobs: HashMap<EventId, ErpJob>,
    erp_order: Vec<EventId>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            batch_states: HashMap::new(),
            batch_runs: Vec::new(),
            print_jobs: HashMap::new(),
            print_order: Vec::new(),
            erp_jobs: HashMap::new(),
            erp_order: Vec::new(),
        }
    }
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: RwLock::new(Inner::new()),
        }
    }
}

fn find_next(
    order: &[EventId],
    jobs: &HashMap<EventId, impl HasJobFields>,
    now: Timestamp,
) -> Option<EventId> {
    order
        .iter()
        .find(|id| {
            jobs.get(id.as_str()).is_some_and(|j| {
                matches!(j.status(), JobStatus::New | JobStatus::Retry)
                    && j.next_retry_at().map(|t| t <= now).unwrap_or(true)
            })
        })
        .cloned()
}

trait HasJobFields {
    fn status(&self) -> JobStatus;
    fn next_retry_at(&self) -> Option<Timestamp>;
}

impl HasJobFields for PrintJob {
    fn status(&self) -> JobStatus {
        self.status
    }
    fn next_retry_at(&self) -> Option<Timestamp> {
        self.next_retry_at
    }
}

impl HasJobFields for ErpJob {
    fn status(&self) -> JobStatus {
        self.status
    }
    fn next_retry_at(&self) -> Option<Timestamp> {
        self.next_retry_at
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn start_batch(
        &self,
        device_id: &DeviceId,
        batch_id: &BatchId,
        product_id: &ProductId,
        now: Timestamp,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.batch_states.insert(
            (device_id.clone(), batch_id.clone()),
            BatchState {
                device_id: device_id.clone(),
                batch_id: batch_id.clone(),
                product_id: product_id.clone(),
                next_seq: 1,
                status: BatchStatus::Active,
                updated_at: now,
            },
        );
        inner.batch_runs.push(BatchRun {
            run_id: new_opaque_id(),
            device_id: device_id.clone(),
            batch_id: batch_id.clone(),
            product_id: product_id.clone(),
            started_at: now,
            stopped_at: None,
            stop_reason: None,
        });
        Ok(())
    }

    async fn stop_batch(
        &self,
        device_id: &DeviceId,
        batch_id: &BatchId,
        reason: PauseReason,
        now: Timestamp,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(state) = inner
            .batch_states
            .get_mut(&(device_id.clone(), batch_id.clone()))
        {
            state.status = BatchStatus::Stopped;
            state.updated_at = now;
        }
        if let Some(run) = inner
            .batch_runs
            .iter_mut()
            .rev()
            .find(|r| r.device_id == *device_id && r.batch_id == *batch_id && r.stopped_at.is_none())
        {
            run.stopped_at = Some(now);
            run.stop_reason = Some(reason);
        }
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
        let mut inner = self.inner.write().await;
        if inner.print_jobs.contains_key(event_id) {
            return Err(Error::Duplicate(event_id.clone()));
        }
        let seq = {
            let state = inner
                .batch_states
                .get_mut(&(device_id.clone(), batch_id.clone()))
                .ok_or_else(|| Error::Fatal(format!("missing batch_state for {device_id}/{batch_id}")))?;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.updated_at = now;
            seq
        };

        let job_id = new_opaque_id();
        inner.print_jobs.insert(
            event_id.clone(),
            PrintJob {
                job_id: job_id.clone(),
                event_id: event_id.clone(),
                device_id: device_id.clone(),
                batch_id: batch_id.clone(),
                seq,
                status: JobStatus::New,
                completion_mode,
                payload_json: payload_json.to_string(),
                payload_hash: payload_hash.to_string(),
                attempts: 0,
                next_retry_at: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
        );
        inner.print_order.push(event_id.clone());

        inner.erp_jobs.insert(
            event_id.clone(),
            ErpJob {
                job_id: new_opaque_id(),
                event_id: event_id.clone(),
                device_id: device_id.clone(),
                batch_id: batch_id.clone(),
                seq,
                status: JobStatus::New,
                payload_json: payload_json.to_string(),
                payload_hash: payload_hash.to_string(),
                attempts: 0,
                wait_print_checks: 0,
                next_retry_at: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
        );
        inner.erp_order.push(event_id.clone());

        Ok(seq)
    }

    async fn fetch_next_print(&self, now: Timestamp) -> Result<Option<PrintJob>> {
        let inner = self.inner.read().await;
        Ok(find_next(&inner.print_order, &inner.print_jobs, now)
            .and_then(|id| inner.print_jobs.get(&id).cloned()))
    }

    async fn fetch_next_erp(&self, now: Timestamp) -> Result<Option<ErpJob>> {
        let inner = self.inner.read().await;
        Ok(find_next(&inner.erp_order, &inner.erp_jobs, now)
            .and_then(|id| inner.erp_jobs.get(&id).cloned()))
    }

    async fn mark_status(
        &self,
        kind: JobKind,
        event_id: &EventId,
        status: JobStatus,
        now: Timestamp,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        match kind {
            JobKind::Print => {
                let job = inner
                    .print_jobs
                    .get_mut(event_id)
                    .ok_or_else(|| Error::Fatal(format!("no print job for {event_id}")))?;
                job.status = status;
                job.updated_at = now;
            }
            JobKind::Erp => {
                let job = inner
                    .erp_jobs
                    .get_mut(event_id)
                    .ok_or_else(|| Error::Fatal(format!("no erp job for {event_id}")))?;
                job.status = status;
                job.updated_at = now;
            }
        }
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
        let mut inner = self.inner.write().await;
        match kind {
            JobKind::Print => {
                let job = inner
                    .print_jobs
                    .get_mut(event_id)
                    .ok_or_else(|| Error::Fatal(format!("no print job for {event_id}")))?;
                job.status = JobStatus::Retry;
                job.attempts += 1;
                job.next_retry_at = Some(next_retry_at);
                job.last_error = Some(error.to_string());
                job.updated_at = now;
            }
            JobKind::Erp => {
                let job = inner
                    .erp_jobs
                    .get_mut(event_id)
                    .ok_or_else(|| Error::Fatal(format!("no erp job for {event_id}")))?;
                job.status = JobStatus::Retry;
                job.attempts += 1;
                job.next_retry_at = Some(next_retry_at);
                job.last_error = Some(error.to_string());
                job.updated_at = now;
            }
        }
        Ok(())
    }

    async fn mark_wait_print(
        &self,
        event_id: &EventId,
        next_retry_at: Timestamp,
        now: Timestamp,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .erp_jobs
            .get_mut(event_id)
            .ok_or_else(|| Error::Fatal(format!("no erp job for {event_id}")))?;
        job.wait_print_checks += 1;
        job.status = JobStatus::Retry;
        job.next_retry_at = Some(next_retry_at);
        job.last_error = Some("WAIT_PRINT".to_string());
        job.updated_at = now;
        Ok(())
    }

    async fn mark_needs_operator(
        &self,
        kind: JobKind,
        event_id: &EventId,
        error: &str,
        now: Timestamp,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        match kind {
            JobKind::Print => {
                let job = inner
                    .print_jobs
                    .get_mut(event_id)
                    .ok_or_else(|| Error::Fatal(format!("no print job for {event_id}")))?;
                job.status = JobStatus::NeedsOperator;
                job.last_error = Some(error.to_string());
                job.updated_at = now;
            }
            JobKind::Erp => {
                let job = inner
                    .erp_jobs
                    .get_mut(event_id)
                    .ok_or_else(|| Error::Fatal(format!("no erp job for {event_id}")))?;
                job.status = JobStatus::NeedsOperator;
                job.last_error = Some(error.to_string());
                job.updated_at = now;
            }
        }
        Ok(())
    }

    async fn update_completion_mode(
        &self,
        event_id: &EventId,
        mode: CompletionMode,
        now: Timestamp,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .print_jobs
            .get_mut(event_id)
            .ok_or_else(|| Error::Fatal(format!("no print job for {event_id}")))?;
        job.completion_mode = mode;
        job.updated_at = now;
        Ok(())
    }

    async fn get_status(&self, kind: JobKind, event_id: &EventId) -> Result<Option<JobStatus>> {
        let inner = self.inner.read().await;
        Ok(match kind {
            JobKind::Print => inner.print_jobs.get(event_id).map(|j| j.status),
            JobKind::Erp => inner.erp_jobs.get(event_id).map(|j| j.status),
        })
    }

    async fn count_pending_erp(&self) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .erp_jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .count() as u64)
    }

    async fn get_batch_state(
        &self,
        device_id: &DeviceId,
        batch_id: &BatchId,
    ) -> Result<Option<BatchState>> {
        let inner = self.inner.read().await;
        Ok(inner
            .batch_states
            .get(&(device_id.clone(), batch_id.clone()))
            .cloned())
    }

    async fn list_open_runs(&self, device_id: &DeviceId) -> Result<Vec<BatchRun>> {
        let inner = self.inner.read().await;
        Ok(inner
            .batch_runs
            .iter()
            .filter(|r| r.device_id == *device_id && r.stopped_at.is_none())
            .cloned()
            .collect())
    }

    async fn job_counts_by_status(&self, kind: JobKind) -> Result<HashMap<JobStatus, u64>> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        match kind {
            JobKind::Print => {
                for job in inner.print_jobs.values() {
                    *counts.entry(job.status).or_insert(0) += 1;
                }
            }
            JobKind::Erp => {
                for job in inner.erp_jobs.values() {
                    *counts.entry(job.status).or_insert(0) += 1;
                }
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CompletionMode;

    #[tokio::test]
    async fn allocate_and_enqueue_inserts_both_outbox_rows() {
        let store = MemoryStore::new();
        store.start_batch(&"dev-1".into(), &"batch-1".into(), &"prod-a".into(), 1).await.unwrap();
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
        assert_eq!(
            store.get_status(JobKind::Print, &"event-1".into()).await.unwrap(),
            Some(JobStatus::New)
        );
        assert_eq!(
            store.get_status(JobKind::Erp, &"event-1".into()).await.unwrap(),
            Some(JobStatus::New)
        );
        assert_eq!(store.count_pending_erp().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reinserting_the_same_event_id_is_rejected_as_duplicate() {
        let store = MemoryStore::new();
        store.start_batch(&"dev-1".into(), &"batch-1".into(), &"prod-a".into(), 1).await.unwrap();
        store
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
        let err = store
            .allocate_and_enqueue(
                &"dev-1".into(),
                &"batch-1".into(),
                &"event-1".into(),
                "{}",
                "hash",
                CompletionMode::StatusQuery,
                3,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
        // next_seq must not have advanced on the rejected insert.
        let state = store.get_batch_state(&"dev-1".into(), &"batch-1".into()).await.unwrap().unwrap();
        assert_eq!(state.next_seq, 2);
    }

    #[tokio::test]
    async fn fetch_next_print_skips_future_retries() {
        let store = MemoryStore::new();
        store.start_batch(&"dev-1".into(), &"batch-1".into(), &"prod-a".into(), 1).await.unwrap();
        store
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
        store
            .mark_retry(JobKind::Print, &"event-1".into(), 1000, "boom", 5)
            .await
            .unwrap();
        assert!(store.fetch_next_print(500).await.unwrap().is_none());
        assert!(store.fetch_next_print(1000).await.unwrap().is_some());
    }
}
