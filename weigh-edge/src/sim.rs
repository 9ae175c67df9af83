//! Simulated `PrinterTransport`/`ErpClient` (§6 interfaces). The real USB
//! driver and ERP HTTP client bodies are out of scope; this backs `main`
//! when no hardware/network collaborator is wired, mirroring the
//! teacher's `MemoryStore` fallback when no database is configured.

use async_trait::async_trait;
use weigh_core::ports::{ErpClient, ErpOutcome, PrinterStatus, PrinterTransport, TransportError};

pub struct SimulatedPrinter;

#[async_trait]
impl PrinterTransport for SimulatedPrinter {
    fn supports_status_probe(&self) -> bool {
        true
    }

    async fn send(&self, _payload_bytes: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    async fn probe_status(&self) -> Result<PrinterStatus, TransportError> {
        Ok(PrinterStatus {
            ready: true,
            busy: false,
            job_buffer_empty: true,
            rfid_ok: true,
            rfid_unknown: false,
            paused: false,
            error: false,
            offline: false,
        })
    }
}

pub struct SimulatedErp;

#[async_trait]
impl ErpClient for SimulatedErp {
    async fn post_event(&self, _payload_json: &str) -> ErpOutcome {
        ErpOutcome::Ok
    }
}
