//! Runtime configuration (§10.3): a TOML file plus `WEIGH__*` environment
//! overrides, generalizing the teacher's `--database-url` / `DATABASE_URL`
//! precedence pattern from one ad hoc flag into a full `serde`-deserialized
//! struct.

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_id: String,
    /// Path to the single SQLite database file (§6 "Persisted layout").
    pub database_path: String,
    /// Path to a JSON array of `[mono_seconds, raw_value]` pairs recorded
    /// from an empty pan at startup, used to derive the detector's
    /// calibration constants (§4.1).
    pub calibration_seed_path: String,
    pub fsm: FsmConfig,
    pub queues: QueueConfig,
    pub print_worker: PrintWorkerConfig,
    pub erp: ErpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FsmConfig {
    pub t_settle_secs: f64,
    pub t_clear_secs: f64,
    pub n_min: u64,
    /// Floor on `PLACEMENT_MIN`, combined with the calibration-derived
    /// `5*sigma`/`2*res` floors at startup (§4.1).
    pub placement_min_kg: f64,
}

impl Default for FsmConfig {
    fn default() -> Self {
        FsmConfig {
            t_settle_secs: 0.50,
            t_clear_secs: 0.70,
            n_min: 10,
            placement_min_kg: 0.05,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub control_queue_capacity: usize,
    pub max_erp_queue_depth: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            control_queue_capacity: 4096,
            max_erp_queue_depth: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrintWorkerConfig {
    pub send_timeout_ms: u64,
    pub received_probe_attempts: u32,
    pub received_probe_interval_ms: u64,
    pub completed_probe_interval_ms: u64,
    pub completed_timeout_ms: u64,
    /// Transport selection, carried for logging / diagnostics only; the
    /// concrete `PrinterTransport` is injected by the (out-of-scope) driver
    /// crate, not constructed here.
    pub transport: String,
}

impl Default for PrintWorkerConfig {
    fn default() -> Self {
        PrintWorkerConfig {
            send_timeout_ms: 1500,
            received_probe_attempts: 3,
            received_probe_interval_ms: 200,
            completed_probe_interval_ms: 250,
            completed_timeout_ms: 5000,
            transport: "simulated".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ErpConfig {
    pub endpoint: String,
    pub needs_operator_after_secs: i64,
    pub max_attempts: u32,
    pub retry_backoff_cap_secs: u64,
    pub wait_print_backoff_cap_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ErpConfig {
    fn default() -> Self {
        ErpConfig {
            endpoint: "http://localhost:8080/events".to_string(),
            needs_operator_after_secs: 1800,
            max_attempts: 8,
            retry_backoff_cap_secs: 60,
            wait_print_backoff_cap_secs: 30,
            poll_interval_ms: 200,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_id: "device-1".to_string(),
            database_path: "./weigh-edge.db".to_string(),
            calibration_seed_path: "./calibration-seed.json".to_string(),
            fsm: FsmConfig::default(),
            queues: QueueConfig::default(),
            print_worker: PrintWorkerConfig::default(),
            erp: ErpConfig::default(),
        }
    }
}

impl Config {
    /// Loads `path` (if present) layered under defaults, then applies
    /// `WEIGH__*` environment overrides (e.g. `WEIGH__ERP__ENDPOINT`),
    /// mirroring the teacher's CLI-arg-then-env precedence but generalized
    /// from one flag to the whole struct.
    pub fn load(path: &str) -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("WEIGH").separator("__"))
            .build()
            .with_context(|| format!("failed to build configuration from {path}"))?;

        raw.try_deserialize()
            .context("failed to deserialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_spec_literal_timing_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.fsm.t_settle_secs, 0.50);
        assert_eq!(cfg.fsm.t_clear_secs, 0.70);
        assert_eq!(cfg.fsm.n_min, 10);
    }

    #[test]
    fn loading_a_missing_file_falls_back_to_defaults() {
        let cfg = Config::load("/nonexistent/path/to/config").unwrap();
        assert_eq!(cfg.device_id, "device-1");
    }
}
