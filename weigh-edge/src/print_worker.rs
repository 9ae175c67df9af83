//! Print worker (§4.4): drives the printer status-machine for each
//! `fetch_next_print` job — send, received probe, completed probe — and
//! reports pause conditions and completion back to the control loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use weigh_core::fsm::Event;
use weigh_core::model::{CompletionMode, JobKind, JobStatus, PauseReason, PrintJob};
use weigh_core::ports::{PrinterStatus, PrinterTransport};
use weigh_core::store::Store;

use crate::config::PrintWorkerConfig;
use crate::control_loop::ControlHandle;

pub struct PrintWorker {
    store: Arc<dyn Store>,
    transport: Arc<dyn PrinterTransport>,
    control: ControlHandle,
    cfg: PrintWorkerConfig,
    shutdown: tokio::sync::watch::Receiver<bool>,
}

fn backoff_secs(attempts: u32, cap_secs: u64) -> u64 {
    let exp = 1u64.checked_shl(attempts.saturating_sub(1)).unwrap_or(u64::MAX);
    exp.min(cap_secs)
}

fn status_pause_reason(status: &PrinterStatus) -> Option<PauseReason> {
    if status.offline {
        Some(PauseReason::PrinterOffline)
    } else if status.error {
        Some(PauseReason::PrinterError)
    } else if status.paused {
        Some(PauseReason::PrinterPaused)
    } else {
        None
    }
}

impl PrintWorker {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn PrinterTransport>,
        control: ControlHandle,
        cfg: PrintWorkerConfig,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        PrintWorker {
            store,
            transport,
            control,
            cfg,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.cfg.completed_probe_interval_ms));
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
                    match self.store.fetch_next_print(now).await {
                        Ok(Some(job)) => self.process(job).await,
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "fetch_next_print failed"),
                    }
                }
            }
        }
    }

    async fn process(&self, job: PrintJob) {
        let now = chrono::Utc::now().timestamp_millis();

        let send_result = tokio::time::timeout(
            Duration::from_millis(self.cfg.send_timeout_ms),
            self.transport.send(job.payload_json.as_bytes()),
        )
        .await;

        let send_outcome = match send_result {
            Ok(inner) => inner.map_err(|e| e.to_string()),
            Err(_) => Err("send timed out".to_string()),
        };

        if let Err(err) = send_outcome {
            warn!(error = %err, event_id = %job.event_id, "printer send failed");
            let next_attempt = job.attempts + 1;
            let backoff = backoff_secs(next_attempt, 60);
            let _ = self
                .store
                .mark_retry(JobKind::Print, &job.event_id, now + (backoff as i64) * 1000, &err, now)
                .await;
            return;
        }

        let _ = self
            .store
            .mark_status(JobKind::Print, &job.event_id, JobStatus::Sent, now)
            .await;

        if !self.transport.supports_status_probe() {
            let _ = self
                .store
                .update_completion_mode(&job.event_id, CompletionMode::ScanRecon, now)
                .await;
            info!(event_id = %job.event_id, "transport has no status probe; awaiting external ScanRecon");
            return;
        }

        if !self.received_probe(&job).await {
            return;
        }

        self.completed_probe(&job).await;
    }

    /// Up to `received_probe_attempts`, spaced `received_probe_interval_ms`
    /// apart. Returns `true` if the job reached `RECEIVED` and probing
    /// should continue to the completed phase.
    async fn received_probe(&self, job: &PrintJob) -> bool {
        for _ in 0..self.cfg.received_probe_attempts {
            match self.transport.probe_status().await {
                Ok(status) => {
                    if let Some(reason) = status_pause_reason(&status) {
                        self.pause_and_retry(job, reason).await;
                        return false;
                    }
                    if status.ready && !status.busy {
                        let now = chrono::Utc::now().timestamp_millis();
                        self.control.enqueue_control(Event::PrinterReceived);
                        let _ = self
                            .store
                            .mark_status(JobKind::Print, &job.event_id, JobStatus::Received, now)
                            .await;
                        return true;
                    }
                }
                Err(e) => warn!(error = %e, event_id = %job.event_id, "probe_status failed"),
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.received_probe_interval_ms)).await;
        }

        let now = chrono::Utc::now().timestamp_millis();
        let _ = self
            .store
            .mark_retry(JobKind::Print, &job.event_id, now, "SEND_TIMEOUT", now)
            .await;
        false
    }

    async fn completed_probe(&self, job: &PrintJob) {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.cfg.completed_timeout_ms);
        while tokio::time::Instant::now() < deadline {
            match self.transport.probe_status().await {
                Ok(status) => {
                    if let Some(reason) = status_pause_reason(&status) {
                        self.pause_and_retry(job, reason).await;
                        return;
                    }
                    if status.ready && status.job_buffer_empty && status.rfid_ok {
                        let now = chrono::Utc::now().timestamp_millis();
                        self.control.enqueue_control(Event::PrinterCompleted);
                        let _ = self
                            .store
                            .mark_status(JobKind::Print, &job.event_id, JobStatus::Completed, now)
                            .await;
                        let _ = self
                            .store
                            .mark_status(JobKind::Print, &job.event_id, JobStatus::Done, now)
                            .await;
                        return;
                    }
                    if status.ready && status.job_buffer_empty && status.rfid_unknown {
                        let now = chrono::Utc::now().timestamp_millis();
                        let _ = self
                            .store
                            .update_completion_mode(&job.event_id, CompletionMode::ScanRecon, now)
                            .await;
                        self.control.enqueue_control(Event::ScanRecon);
                        let _ = self
                            .store
                            .mark_status(JobKind::Print, &job.event_id, JobStatus::Completed, now)
                            .await;
                        return;
                    }
                }
                Err(e) => warn!(error = %e, event_id = %job.event_id, "probe_status failed"),
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.completed_probe_interval_ms)).await;
        }

        let now = chrono::Utc::now().timestamp_millis();
        warn!(event_id = %job.event_id, "completed probe timed out");
        self.control.enqueue_control(Event::Pause(PauseReason::PrintTimeout));
        let _ = self
            .store
            .mark_retry(JobKind::Print, &job.event_id, now, "PRINT_TIMEOUT", now)
            .await;
    }

    async fn pause_and_retry(&self, job: &PrintJob, reason: PauseReason) {
        let now = chrono::Utc::now().timestamp_millis();
        warn!(event_id = %job.event_id, ?reason, "printer soft fault");
        self.control.enqueue_control(Event::Pause(reason));
        let _ = self
            .store
            .mark_retry(JobKind::Print, &job.event_id, now + 5_000, &reason.to_string(), now)
            .await;
    }
}
