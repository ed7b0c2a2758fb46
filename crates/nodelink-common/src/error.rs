//! Error types for the nodelink pipeline
//!
//! The taxonomy mirrors how failures are handled at runtime: configuration
//! errors fail fast before any I/O, per-record problems are rejections that
//! accumulate in the load result rather than errors, and everything in this
//! enum that reaches the pipeline boundary halts the run at the current
//! stage.

use thiserror::Error;

/// Result type alias for nodelink operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Main error type for the nodelink pipeline
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown SRID: {0}")]
    UnknownSrid(i32),

    #[error("Dataset '{dataset}': declared {declared} header row(s) but detected {detected}")]
    HeaderMismatch {
        dataset: String,
        declared: usize,
        detected: usize,
    },

    #[error("Failed to read source for dataset '{dataset}': {message}")]
    Source { dataset: String, message: String },

    #[error("Table '{table}' already contains {count} conflicting key(s), first: {sample:?}")]
    AppendConflict {
        table: String,
        count: usize,
        sample: Vec<String>,
    },

    #[error("Rejection rate {rate:.4} exceeded threshold {threshold:.4} ({rejected}/{read} records)")]
    RejectionRateExceeded {
        rate: f64,
        threshold: f64,
        rejected: u64,
        read: u64,
    },

    #[error("Index creation failed on table '{table}': {message}")]
    Index { table: String, message: String },

    #[error("Table '{table}' is claimed by another pipeline")]
    TableClaimed { table: String },

    #[error("Operation timed out after {0} attempt(s)")]
    RetriesExhausted(u32),

    #[error("Database error: {0}")]
    Database(String),
}

impl EtlError {
    /// Whether this error may succeed on retry (connectivity loss, timeout).
    ///
    /// Transient errors are eligible for the loader's bounded batch retry;
    /// everything else escalates immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            EtlError::Database(message) => {
                let m = message.to_lowercase();
                m.contains("timed out")
                    || m.contains("timeout")
                    || m.contains("connection")
                    || m.contains("broken pipe")
            }
            _ => false,
        }
    }
}
