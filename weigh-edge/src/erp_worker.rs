//! ERP worker (§4.4): posts events to the ERP only after the peer print
//! job has completed, gating on `COMPLETED`/`DONE` and backing off while
//! it waits.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use weigh_core::model::{ErpJob, JobKind, JobStatus};
use weigh_core::ports::{ErpClient, ErpOutcome};
use weigh_core::store::Store;

use crate::config::ErpConfig;

pub struct ErpWorker {
    store: Arc<dyn Store>,
    client: Arc<dyn ErpClient>,
    cfg: ErpConfig,
    poll_interval_ms: u64,
    shutdown: tokio::sync::watch::Receiver<bool>,
}

fn retry_backoff_secs(attempts: u32, cap_secs: u64) -> u64 {
    let exp = 1u64.checked_shl(attempts.saturating_sub(1)).unwrap_or(u64::MAX);
    exp.min(cap_secs)
}

fn wait_print_backoff_secs(wait_print_checks: u32, cap_secs: u64) -> u64 {
    (2u64.saturating_mul(1u64.checked_shl(wait_print_checks).unwrap_or(u64::MAX))).min(cap_secs)
}

impl ErpWorker {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn ErpClient>,
        cfg: ErpConfig,
        poll_interval_ms: u64,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        ErpWorker {
            store,
            client,
            cfg,
            poll_interval_ms,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.poll_interval_ms));
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    let now = chrono::Utc::now().timestamp_millis();
                    match self.store.fetch_next_erp(now).await {
                        Ok(Some(job)) => self.process(job).await,
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "fetch_next_erp failed"),
                    }
                }
            }
        }
    }

    async fn process(&self, job: ErpJob) {
        let now = chrono::Utc::now().timestamp_millis();

        let peer_ready = match self.store.get_status(JobKind::Print, &job.event_id).await {
            Ok(Some(status)) => status.gates_erp_send(),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, event_id = %job.event_id, "failed to read peer print status");
                false
            }
        };

        if !peer_ready {
            let age_secs = (now - job.created_at) / 1000;
            if age_secs >= self.cfg.needs_operator_after_secs {
                warn!(event_id = %job.event_id, "erp job exceeded wait-print timeout");
                let _ = self
                    .store
                    .mark_needs_operator(JobKind::Erp, &job.event_id, "WAIT_PRINT_TIMEOUT", now)
                    .await;
            } else {
                let backoff = wait_print_backoff_secs(job.wait_print_checks, self.cfg.wait_print_backoff_cap_secs);
                let _ = self
                    .store
                    .mark_wait_print(&job.event_id, now + (backoff as i64) * 1000, now)
                    .await;
            }
            return;
        }

        match self.client.post_event(&job.payload_json).await {
            ErpOutcome::Ok | ErpOutcome::Conflict => {
                let _ = self
                    .store
                    .mark_status(JobKind::Erp, &job.event_id, JobStatus::Done, now)
                    .await;
                info!(event_id = %job.event_id, "erp post complete");
            }
            ErpOutcome::Retryable => {
                let attempts = job.attempts + 1;
                let backoff = retry_backoff_secs(attempts, self.cfg.retry_backoff_cap_secs);
                let _ = self
                    .store
                    .mark_retry(JobKind::Erp, &job.event_id, now + (backoff as i64) * 1000, "RETRYABLE", now)
                    .await;
            }
            ErpOutcome::Failed => {
                if job.attempts + 1 >= self.cfg.max_attempts {
                    let _ = self
                        .store
                        .mark_status(JobKind::Erp, &job.event_id, JobStatus::Fail, now)
                        .await;
                    warn!(event_id = %job.event_id, "erp job exhausted retry policy");
                } else {
                    let attempts = job.attempts + 1;
                    let backoff = retry_backoff_secs(attempts, self.cfg.retry_backoff_cap_secs);
                    let _ = self
                        .store
                        .mark_retry(JobKind::Erp, &job.event_id, now + (backoff as i64) * 1000, "FAILED", now)
                        .await;
                }
            }
        }
    }
}
