//! External capability interfaces (§6, §9 "Polymorphism").
//!
//! The printer transport and ERP client are capability sets consumed as
//! `Arc<dyn Trait>`, the same shape the teacher uses for `ProcessStore`:
//! construction-time injection, no hidden module-level singletons.

use async_trait::async_trait;

/// Snapshot of printer state returned by a status probe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrinterStatus {
    pub ready: bool,
    pub busy: bool,
    pub job_buffer_empty: bool,
    pub rfid_ok: bool,
    pub rfid_unknown: bool,
    pub paused: bool,
    pub error: bool,
    pub offline: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("printer transport I/O error: {0}")]
    Io(String),
    #[error("printer transport timed out")]
    Timeout,
}

/// Driver-provided capability consumed by the print worker (§6).
#[async_trait]
pub trait PrinterTransport: Send + Sync {
    /// Whether `probe_status` is meaningful. If false, the print worker
    /// falls back to `CompletionMode::ScanRecon` after send (§4.4 step 2).
    fn supports_status_probe(&self) -> bool;

    async fn send(&self, payload_bytes: &[u8]) -> Result<(), TransportError>;

    async fn probe_status(&self) -> Result<PrinterStatus, TransportError>;
}

/// Outcome of an ERP POST (§6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErpOutcome {
    Ok,
    /// Server reports the event was already recorded; treated as success.
    Conflict,
    Retryable,
    Failed,
}

/// Network-provided capability consumed by the ERP worker (§6).
#[async_trait]
pub trait ErpClient: Send + Sync {
    async fn post_event(&self, payload_json: &str) -> ErpOutcome;
}
