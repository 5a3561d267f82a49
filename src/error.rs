//! Error types for batch-enrich
//!
//! Two families of errors exist and they never mix:
//! - [`Error`] is pipeline-fatal: it aborts a run (after a best-effort checkpoint)
//!   and reaches the top-level handler.
//! - [`EnrichError`] is row-level: it is caught at the enrichment boundary and
//!   recorded as data in the row's result.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for batch-enrich operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for batch-enrich
///
/// Each variant carries enough context to tell the operator what went wrong and,
/// for aborted runs, where the surviving checkpoint lives.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "workers.concurrency")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV reading or writing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The input could not be read as a row sequence (missing header, malformed
    /// record under the fail-fast policy)
    #[error("input error{}: {message}", at_line(.line))]
    Source {
        /// 1-based line number of the offending record, when known
        line: Option<u64>,
        /// Description of the problem
        message: String,
    },

    /// Checkpoint write or load failed
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Network error outside of a row call (client construction)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The run stopped before every row reached a terminal state
    #[error("run aborted after {completed}/{total} rows: {reason}")]
    Aborted {
        /// Why the run stopped (cancellation, timeout, or the fatal error text)
        reason: String,
        /// Rows that had reached a terminal state
        completed: usize,
        /// Total rows in the run
        total: usize,
        /// Checkpoint artifact left on disk for recovery, if any
        checkpoint: Option<PathBuf>,
    },

    /// One or more shards failed
    #[error("sharded run failed: {0}")]
    Shard(#[from] ShardError),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub(crate) fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

fn at_line(line: &Option<u64>) -> String {
    line.map(|l| format!(" at line {l}")).unwrap_or_default()
}

fn first_failure(failures: &[ShardFailure]) -> String {
    failures
        .first()
        .map(|f| format!("shard {}: {}", f.shard, f.message))
        .unwrap_or_else(|| "none".to_string())
}

/// Checkpoint-related errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Writing a checkpoint artifact failed
    #[error("failed to write checkpoint {path}: {reason}")]
    WriteFailed {
        /// The artifact being written
        path: PathBuf,
        /// The reason the write failed
        reason: String,
    },

    /// A checkpoint artifact could not be interpreted
    #[error("checkpoint {path} is corrupt: {reason}")]
    Corrupt {
        /// The artifact being loaded
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// A checkpoint does not belong to the input being resumed
    #[error("checkpoint {path} does not match the input: {reason}")]
    Mismatch {
        /// The artifact being loaded
        path: PathBuf,
        /// How it differs from the input
        reason: String,
    },
}

/// A single failed shard
#[derive(Debug, Clone)]
pub struct ShardFailure {
    /// Shard index (0-based, in input order)
    pub shard: usize,
    /// Error text reported by the shard
    pub message: String,
}

/// Sharding errors, reported once every shard has settled
#[derive(Debug, Error)]
pub enum ShardError {
    /// At least one shard failed; the remaining shards ran to completion or were cancelled
    #[error("{} of {total} shards failed (first: {})", .failures.len(), first_failure(.failures))]
    Failed {
        /// Failed shards in shard order
        failures: Vec<ShardFailure>,
        /// Number of shards that were started
        total: usize,
    },

    /// There were no credentials to shard over
    #[error("sharding requires at least one credential")]
    NoCredentials,
}

/// Row-level errors raised by an enrichment call
///
/// These never abort a run. The enrichment boundary converts them into an
/// `UnrecoverableError` row result labelled with the configured error label.
#[derive(Debug, Clone, Error)]
pub enum EnrichError {
    /// The call did not finish within the per-call timeout
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Transport failure (connection refused, reset, DNS, ...)
    #[error("network failure: {0}")]
    Network(String),

    /// The provider answered with a non-success status
    #[error("provider returned HTTP {status}: {message}")]
    Provider {
        /// HTTP status code
        status: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// The provider answered but the payload could not be interpreted
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The enricher panicked while handling the row
    #[error("enricher panicked: {0}")]
    Panicked(String),

    /// Any other row-level failure
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for EnrichError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EnrichError::Network(format!("request timed out: {e}"))
        } else if e.is_decode() {
            EnrichError::MalformedResponse(e.to_string())
        } else if let Some(status) = e.status() {
            EnrichError::Provider {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            EnrichError::Network(e.to_string())
        }
    }
}
