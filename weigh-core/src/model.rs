//! Shared identifiers and entity shapes (§3, §6).

use serde::{Deserialize, Serialize};

/// Epoch milliseconds (UTC). Wall-clock, used only for persisted timestamps.
pub type Timestamp = i64;

/// Monotonic seconds. Used only in-memory; never persisted as-is.
pub type MonoSeconds = f64;

/// Opaque 32-character hex string (128 bits of randomness), §6.
pub type EventId = String;
pub type JobId = String;

/// Operator-scoped, opaque strings.
pub type DeviceId = String;
pub type BatchId = String;
pub type ProductId = String;

/// Generate a fresh 128-bit event/job id as 32 lowercase hex characters.
pub fn new_opaque_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Active,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub device_id: DeviceId,
    pub batch_id: BatchId,
    pub product_id: ProductId,
    pub next_seq: u64,
    pub status: BatchStatus,
    pub updated_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRun {
    pub run_id: String,
    pub device_id: DeviceId,
    pub batch_id: BatchId,
    pub product_id: ProductId,
    pub started_at: Timestamp,
    pub stopped_at: Option<Timestamp>,
    pub stop_reason: Option<PauseReason>,
}

/// Pause reasons, §4.2. Also doubles as the stop reason recorded on a
/// `BatchRun` when the batch was halted by the same class of event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseReason {
    BatchStop,
    PrinterOffline,
    PrinterPaused,
    PrinterError,
    PrintTimeout,
    ReweighRequired,
    ErpBackpressure,
    ControlQueueOverflow,
    DbError,
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PauseReason::BatchStop => "BATCH_STOP",
            PauseReason::PrinterOffline => "PRINTER_OFFLINE",
            PauseReason::PrinterPaused => "PRINTER_PAUSED",
            PauseReason::PrinterError => "PRINTER_ERROR",
            PauseReason::PrintTimeout => "PRINT_TIMEOUT",
            PauseReason::ReweighRequired => "REWEIGH_REQUIRED",
            PauseReason::ErpBackpressure => "ERP_BACKPRESSURE",
            PauseReason::ControlQueueOverflow => "CONTROL_QUEUE_OVERFLOW",
            PauseReason::DbError => "DB_ERROR",
        };
        f.write_str(s)
    }
}

impl PauseReason {
    /// `REWEIGH_REQUIRED` and `BATCH_STOP` require the pan to clear before
    /// a matching `ReasonCleared` is honoured (§4.2, `PAUSED`).
    pub fn requires_clear_before_resume(&self) -> bool {
        matches!(self, PauseReason::ReweighRequired | PauseReason::BatchStop)
    }
}

/// Selects which of the two outbox tables an operation targets; `event_id`
/// is shared between the paired `PrintJob`/`ErpJob` rows, so store methods
/// that touch only one side take this instead of two near-identical methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    Print,
    Erp,
}

/// Completion mechanism for a print job (glossary: "Completion mode").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionMode {
    StatusQuery,
    ScanRecon,
}

/// Shared status vocabulary. `PrintJob` uses the full set; `ErpJob` never
/// reaches `Received`/`Completed` (print-only states), but sharing one enum
/// keeps `mark_status` a single store method for both tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    New,
    Sent,
    Received,
    Completed,
    Done,
    Retry,
    Fail,
    NeedsOperator,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "NEW",
            JobStatus::Sent => "SENT",
            JobStatus::Received => "RECEIVED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Done => "DONE",
            JobStatus::Retry => "RETRY",
            JobStatus::Fail => "FAIL",
            JobStatus::NeedsOperator => "NEEDS_OPERATOR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "NEW" => JobStatus::New,
            "SENT" => JobStatus::Sent,
            "RECEIVED" => JobStatus::Received,
            "COMPLETED" => JobStatus::Completed,
            "DONE" => JobStatus::Done,
            "RETRY" => JobStatus::Retry,
            "FAIL" => JobStatus::Fail,
            "NEEDS_OPERATOR" => JobStatus::NeedsOperator,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Fail | JobStatus::NeedsOperator
        )
    }

    /// Whether the peer print job has progressed far enough for the ERP
    /// job to advance past `wait-print` gating (§4.3 "ERP gated on Print").
    pub fn gates_erp_send(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Done)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    pub job_id: JobId,
    pub event_id: EventId,
    pub device_id: DeviceId,
    pub batch_id: BatchId,
    pub seq: u64,
    pub status: JobStatus,
    pub completion_mode: CompletionMode,
    pub payload_json: String,
    pub payload_hash: String,
    pub attempts: u32,
    pub next_retry_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErpJob {
    pub job_id: JobId,
    pub event_id: EventId,
    pub device_id: DeviceId,
    pub batch_id: BatchId,
    pub seq: u64,
    pub status: JobStatus,
    pub payload_json: String,
    pub payload_hash: String,
    pub attempts: u32,
    pub wait_print_checks: u32,
    pub next_retry_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// The domain fields that go into an ERP payload (§6 payload canonicalisation).
#[derive(Clone, Debug, PartialEq)]
pub struct WeighEvent {
    pub event_id: EventId,
    pub device_id: DeviceId,
    pub batch_id: BatchId,
    pub product_id: ProductId,
    pub seq: u64,
    /// Locked weight, kg.
    pub weight: f64,
    /// Monotonic seconds at lock time.
    pub ts: MonoSeconds,
}
