//! Core types for batch-enrich

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// Zero-based position of a data row in its input (header excluded)
///
/// Ordinals are assigned by the row source in read order and are never reused.
/// Results are placed by ordinal, so output order equals input order no matter
/// which worker finishes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ordinal(pub usize);

impl Ordinal {
    /// Create a new ordinal
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Get the underlying index
    pub fn get(self) -> usize {
        self.0
    }
}

impl From<usize> for Ordinal {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl From<Ordinal> for usize {
    fn from(ordinal: Ordinal) -> Self {
        ordinal.0
    }
}

impl std::fmt::Display for Ordinal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Ordinal {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<usize>().map(Self)
    }
}

/// Column names of an input, shared by every row read from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl Headers {
    /// Build headers from column names; the first occurrence of a duplicate name wins lookups
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            index.entry(name.clone()).or_insert(i);
        }
        Self { names, index }
    }

    /// Column names in input order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Position of a column
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether there are no columns
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One data record: an ordered mapping from column name to text value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    headers: Arc<Headers>,
    values: Vec<String>,
}

impl Row {
    /// Create a row; `values` is padded or truncated to the header width
    pub fn new(headers: Arc<Headers>, mut values: Vec<String>) -> Self {
        values.resize(headers.len(), String::new());
        Self { headers, values }
    }

    /// Value of a column, if the column exists
    pub fn get(&self, column: &str) -> Option<&str> {
        self.headers
            .position(column)
            .and_then(|i| self.values.get(i))
            .map(String::as_str)
    }

    /// Values in column order
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// The shared header set
    pub fn headers(&self) -> &Arc<Headers> {
        &self.headers
    }

    /// Whether every field is blank
    pub fn is_blank(&self) -> bool {
        self.values.iter().all(|v| v.trim().is_empty())
    }
}

/// Terminal outcome of a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    /// The provider confirmed the row
    Success,
    /// The row was classified as failing (locally or by the provider)
    ClassifiedFailure,
    /// The call failed (timeout, network, provider error, panic)
    UnrecoverableError,
}

impl TerminalState {
    /// Stable lowercase name, used in checkpoint artifacts
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalState::Success => "success",
            TerminalState::ClassifiedFailure => "classified_failure",
            TerminalState::UnrecoverableError => "unrecoverable_error",
        }
    }
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TerminalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(TerminalState::Success),
            "classified_failure" => Ok(TerminalState::ClassifiedFailure),
            "unrecoverable_error" => Ok(TerminalState::UnrecoverableError),
            other => Err(format!("unknown terminal state {other:?}")),
        }
    }
}

/// A row in a terminal state together with its augmentation
#[derive(Debug, Clone, PartialEq)]
pub struct RowResult {
    /// Position in the input
    pub ordinal: Ordinal,
    /// The original row, unchanged
    pub row: Row,
    /// How the row ended
    pub state: TerminalState,
    /// Value for the label column
    pub label: String,
    /// Additional augmentation columns
    pub fields: BTreeMap<String, String>,
    /// Number of enrichment calls made for this row (0 when classified locally)
    pub calls: u32,
    /// Error text for unrecoverable rows
    pub error: Option<String>,
}

/// Lifecycle of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Constructed, not yet started
    Idle,
    /// Rows are being dispatched and collected
    Streaming,
    /// Every row reached a terminal state and the output was written
    Completed,
    /// The run stopped early; a checkpoint may remain
    Aborted,
}

/// Progress events emitted by pipelines and the shard orchestrator
///
/// Delivered over a `tokio::sync::broadcast` channel. Slow subscribers may
/// observe `RecvError::Lagged`; events are informational and the run never
/// waits for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A run started
    Started {
        /// Rows in the run
        total: usize,
        /// Rows restored from a checkpoint
        resumed: usize,
        /// Shard index when running as a shard
        shard: Option<usize>,
    },
    /// A row reached a terminal state
    RowCompleted {
        /// The row
        ordinal: Ordinal,
        /// Rows completed so far (including restored rows)
        completed: usize,
        /// Rows in the run
        total: usize,
        /// Outcome of the row
        state: TerminalState,
        /// Shard index when running as a shard
        shard: Option<usize>,
    },
    /// A checkpoint became durable
    CheckpointWritten {
        /// Rows captured by the checkpoint
        completed: usize,
        /// Artifact location
        path: PathBuf,
        /// Shard index when running as a shard
        shard: Option<usize>,
    },
    /// A run finished and its output is written
    Completed {
        /// Rows in the run
        total: usize,
        /// Rows that ended in `Success`
        success: usize,
        /// Rows that ended in `ClassifiedFailure`
        classified_failure: usize,
        /// Rows that ended in `UnrecoverableError`
        error: usize,
        /// Shard index when running as a shard
        shard: Option<usize>,
    },
    /// A run stopped early
    Aborted {
        /// Rows completed before the stop
        completed: usize,
        /// Rows in the run
        total: usize,
        /// Surviving checkpoint, if one was written
        checkpoint: Option<PathBuf>,
        /// Shard index when running as a shard
        shard: Option<usize>,
    },
    /// The orchestrator launched a shard
    ShardStarted {
        /// Shard index
        shard: usize,
        /// Rows assigned to it
        rows: usize,
    },
    /// A shard settled
    ShardFinished {
        /// Shard index
        shard: usize,
        /// Whether it completed
        ok: bool,
    },
}

/// Summary of a completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Rows in the input
    pub total: usize,
    /// Rows restored from a checkpoint instead of being enriched again
    pub resumed: usize,
    /// Rows that ended in `Success`
    pub success: usize,
    /// Rows that ended in `ClassifiedFailure`
    pub classified_failure: usize,
    /// Rows that ended in `UnrecoverableError`
    pub error: usize,
    /// Enrichment calls made during this run
    pub calls: u64,
    /// Rows written after filtering
    pub rows_written: usize,
    /// Final output location
    pub output: PathBuf,
    /// Final state (always `Completed` for a returned summary)
    pub state: PipelineState,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the output became durable
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    /// Combine per-shard summaries into one
    pub fn merge(
        output: PathBuf,
        rows_written: usize,
        started_at: DateTime<Utc>,
        shards: &[RunSummary],
    ) -> Self {
        let mut merged = RunSummary {
            total: 0,
            resumed: 0,
            success: 0,
            classified_failure: 0,
            error: 0,
            calls: 0,
            rows_written,
            output,
            state: PipelineState::Completed,
            started_at,
            finished_at: Utc::now(),
        };
        for shard in shards {
            merged.total += shard.total;
            merged.resumed += shard.resumed;
            merged.success += shard.success;
            merged.classified_failure += shard.classified_failure;
            merged.error += shard.error;
            merged.calls += shard.calls;
        }
        merged
    }
}
