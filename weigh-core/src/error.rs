use thiserror::Error;

/// Closed sum of failure effects the core can produce.
///
/// Grouped by *effect* rather than by source, per §7: a printer send
/// failure and a scale-read failure are both `TransientIO` because the
/// recovery (bounded retry) is the same either way.
#[derive(Debug, Error)]
pub enum Error {
    /// Recoverable I/O: printer send, ERP POST, scale read. Retried locally
    /// with bounded exponential backoff; never surfaced to the operator.
    #[error("transient I/O failure: {0}")]
    TransientIO(String),

    /// Printer reports `paused`, `error`, or `offline`. Requires operator
    /// intervention; the FSM is pushed into `PAUSED[reason]`.
    #[error("printer soft fault: {0}")]
    PrinterSoftFault(crate::model::PauseReason),

    /// Unique-constraint violation on `event_id` or `(batch_id, seq)`.
    /// Treated as success with an idempotence flag; never retried.
    #[error("duplicate insert: {0}")]
    Duplicate(String),

    /// Control queue is full.
    #[error("control queue overflow")]
    Overflow,

    /// Generic store failure (disk full, corruption, connection loss).
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// `attempts` or `wait_print_checks` exhausted the retry policy.
    #[error("policy exhausted: {0}")]
    PolicyExhausted(String),

    /// Invariant violated (e.g. missing `batch_state` at allocation time).
    /// Unreachable in correct operation; logged and degraded to
    /// `PAUSED[DB_ERROR]` rather than panicking, per §7.
    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Duplicate(db.message().to_string())
            }
            _ => Error::StorageUnavailable(e.to_string()),
        }
    }
}
