//! Checkpoint (backup) management
//!
//! While a run is in progress, a snapshot of every completed row is written
//! every `interval` completions as `<stem>_backup_<N>.csv`, where `N` is the
//! number of completed rows it captures. Snapshots are CSV files in the output
//! layout plus two bookkeeping columns, `_row` (ordinal) and `_state`
//! (terminal state), so a later run can restore them exactly.
//!
//! A new snapshot never replaces an older one in place: it is written to a
//! temporary file, synced and renamed to its own name. On success every
//! snapshot for the stem is deleted; on failure they stay behind for resume.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};

use crate::config::CheckpointConfig;
use crate::error::{CheckpointError, Error, Result};
use crate::output::OutputSchema;
use crate::types::{Headers, Ordinal, Row, RowResult, TerminalState};
use crate::utils::{remove_if_exists, write_atomically};

/// Bookkeeping column holding the row ordinal
pub const ROW_COLUMN: &str = "_row";

/// Bookkeeping column holding the terminal state
pub const STATE_COLUMN: &str = "_state";

/// Writes, finds, restores and removes checkpoints for one output stem
///
/// Snapshots are written on the blocking pool. At most one write is in
/// flight; [`CheckpointManager::begin`] settles the previous one first.
#[derive(Debug)]
pub struct CheckpointManager {
    enabled: bool,
    interval: usize,
    prune_superseded: bool,
    dir: PathBuf,
    stem: String,
    last_written: Option<(usize, PathBuf)>,
    in_flight: Option<PendingWrite>,
}

/// Outcome of a background snapshot write
#[derive(Debug)]
pub struct Settled {
    /// Completed rows the snapshot captures
    pub completed: usize,
    /// Path of the durable checkpoint, or why it could not be written
    pub outcome: Result<PathBuf>,
}

/// A snapshot being written on the blocking pool
#[derive(Debug)]
struct PendingWrite {
    completed: usize,
    path: PathBuf,
    task: JoinHandle<Result<usize>>,
}

impl CheckpointManager {
    /// Create a manager writing `<stem>_backup_<N>.csv` files into `dir`
    pub fn new(config: &CheckpointConfig, dir: PathBuf, stem: impl Into<String>) -> Self {
        Self {
            enabled: config.enabled,
            interval: config.interval.max(1),
            prune_superseded: config.prune_superseded,
            dir,
            stem: stem.into(),
            last_written: None,
            in_flight: None,
        }
    }

    /// Directory holding the checkpoints
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stem shared by this run's checkpoint names
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Location of the checkpoint for `completed` rows
    pub fn path_for(&self, completed: usize) -> PathBuf {
        self.dir.join(format!("{}_backup_{completed}.csv", self.stem))
    }

    /// The most recent checkpoint this manager made durable
    pub fn last_written(&self) -> Option<&Path> {
        self.last_written.as_ref().map(|(_, path)| path.as_path())
    }

    /// Whether a periodic checkpoint is due after `completed` rows
    pub fn is_due(&self, completed: usize) -> bool {
        self.enabled
            && completed > 0
            && completed % self.interval == 0
            && self.last_written.as_ref().map(|(n, _)| *n) != Some(completed)
    }

    /// Whether a snapshot is still being written
    pub fn is_writing(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Start writing `snapshot` (ordinal order) as the checkpoint for `completed` rows
    ///
    /// Returns immediately. A write still in flight is settled first and its
    /// outcome returned.
    pub async fn begin(
        &mut self,
        schema: &OutputSchema,
        snapshot: Vec<RowResult>,
        completed: usize,
    ) -> Option<Settled> {
        let previous = self.settle().await;
        self.in_flight = Some(self.spawn_write(schema, snapshot, completed));
        previous
    }

    /// Wait for the write in flight, if any
    ///
    /// Cancel safe: dropping the returned future leaves the write in flight.
    pub async fn settle(&mut self) -> Option<Settled> {
        let joined = (&mut self.in_flight.as_mut()?.task).await;
        let pending = self.in_flight.take()?;
        Some(Settled {
            completed: pending.completed,
            outcome: self.commit(pending.completed, pending.path, joined),
        })
    }

    /// Durably write `snapshot` as the checkpoint for `completed` rows
    pub async fn write(
        &mut self,
        schema: &OutputSchema,
        snapshot: Vec<RowResult>,
        completed: usize,
    ) -> Result<PathBuf> {
        if let Some(Settled { outcome: Err(e), .. }) = self.settle().await {
            tracing::warn!(error = %e, "earlier checkpoint write failed");
        }
        let pending = self.spawn_write(schema, snapshot, completed);
        let joined = pending.task.await;
        self.commit(pending.completed, pending.path, joined)
    }

    /// Best-effort checkpoint on abort
    ///
    /// Skips writing when a checkpoint for the same count already exists.
    /// Failures are logged and reported as `None` so they never mask the
    /// error that caused the abort.
    pub async fn write_final<'r, I>(
        &mut self,
        schema: &OutputSchema,
        results: I,
        completed: usize,
    ) -> Option<PathBuf>
    where
        I: IntoIterator<Item = &'r RowResult>,
    {
        if !self.enabled {
            return None;
        }
        if let Some(Settled { outcome: Err(e), .. }) = self.settle().await {
            tracing::warn!(error = %e, "periodic checkpoint write failed");
        }
        if let Some((n, path)) = &self.last_written
            && *n == completed
        {
            return Some(path.clone());
        }
        if completed == 0 {
            return None;
        }
        let snapshot = results.into_iter().cloned().collect();
        match self.write(schema, snapshot, completed).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(error = %e, "final checkpoint could not be written");
                self.last_written().map(Path::to_path_buf)
            }
        }
    }

    fn spawn_write(&self, schema: &OutputSchema, snapshot: Vec<RowResult>, completed: usize) -> PendingWrite {
        let path = self.path_for(completed);
        let superseded = self
            .last_written
            .as_ref()
            .filter(|_| self.prune_superseded)
            .map(|(_, old)| old.clone())
            .filter(|old| *old != path);

        let dir = self.dir.clone();
        let target = path.clone();
        let schema = schema.clone();
        let task = tokio::task::spawn_blocking(move || -> Result<usize> {
            std::fs::create_dir_all(&dir)?;
            let rows = write_snapshot(&target, &schema, &snapshot)?;
            if let Some(old) = superseded
                && let Err(e) = remove_if_exists(&old)
            {
                tracing::warn!(path = %old.display(), error = %e, "failed to prune superseded checkpoint");
            }
            Ok(rows)
        });
        PendingWrite { completed, path, task }
    }

    fn commit(
        &mut self,
        completed: usize,
        path: PathBuf,
        joined: std::result::Result<Result<usize>, JoinError>,
    ) -> Result<PathBuf> {
        let written = joined.unwrap_or_else(|e| Err(Error::Other(format!("checkpoint task panicked: {e}"))));
        let rows = written.map_err(|e| CheckpointError::WriteFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        tracing::info!(path = %path.display(), completed, rows, "checkpoint written");
        self.last_written = Some((completed, path.clone()));
        Ok(path)
    }

    /// Delete every checkpoint for this stem; returns how many were removed
    ///
    /// Deletion failures are logged, never returned.
    pub fn clear(&mut self) -> usize {
        self.last_written = None;
        let found = match list(&self.dir, &self.stem) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "cannot list checkpoints");
                return 0;
            }
        };

        let mut removed = 0;
        for (_, path) in found {
            match remove_if_exists(&path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete checkpoint");
                }
            }
        }
        if removed > 0 {
            tracing::debug!(removed, stem = %self.stem, "checkpoints deleted");
        }
        removed
    }

    /// Checkpoints for this stem that are still on disk
    pub fn remaining(&self) -> Vec<PathBuf> {
        list(&self.dir, &self.stem)
            .map(|found| found.into_iter().map(|(_, path)| path).collect())
            .unwrap_or_default()
    }
}

fn write_snapshot<'r, I>(path: &Path, schema: &OutputSchema, results: I) -> Result<usize>
where
    I: IntoIterator<Item = &'r RowResult>,
{
    write_atomically(path, |out| {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(schema.delimiter())
            .from_writer(out);

        let mut header: Vec<&str> = schema.columns().iter().map(String::as_str).collect();
        header.extend([ROW_COLUMN, STATE_COLUMN]);
        writer.write_record(&header)?;

        let mut rows = 0;
        for result in results {
            let mut record = schema.record(result);
            record.push(result.ordinal.to_string());
            record.push(result.state.as_str().to_string());
            writer.write_record(&record)?;
            rows += 1;
        }
        writer.flush()?;
        Ok(rows)
    })
}

/// Checkpoints for `stem` in `dir`, sorted by completed count (ascending)
pub fn list(dir: &Path, stem: &str) -> Result<Vec<(usize, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(count) = name.to_str().and_then(|n| parse_count(n, stem)) {
            found.push((count, entry.path()));
        }
    }
    found.sort_by_key(|(count, _)| *count);
    Ok(found)
}

/// The highest-count checkpoint for `stem` in `dir`
pub fn latest(dir: &Path, stem: &str) -> Result<Option<PathBuf>> {
    Ok(list(dir, stem)?.pop().map(|(_, path)| path))
}

/// Restore the results captured by a checkpoint
///
/// `headers` are the input's headers; the checkpoint must have been written
/// with the same output layout.
pub fn load(path: &Path, schema: &OutputSchema, headers: &Arc<Headers>) -> Result<Vec<RowResult>> {
    let corrupt = |reason: String| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(schema.delimiter())
        .from_path(path)
        .map_err(|e| corrupt(e.to_string()))?;

    let header = reader.headers().map_err(|e| corrupt(e.to_string()))?;
    let expected = schema
        .columns()
        .iter()
        .map(String::as_str)
        .chain([ROW_COLUMN, STATE_COLUMN]);
    if header.iter().ne(expected) {
        return Err(CheckpointError::Mismatch {
            path: path.to_path_buf(),
            reason: format!("columns {:?} differ from {:?}", header, schema.columns()),
        }
        .into());
    }

    let width = schema.columns().len();
    let mut seen = HashSet::new();
    let mut restored = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| corrupt(e.to_string()))?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();

        let ordinal: Ordinal = record
            .get(width)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| corrupt(format!("line {line}: bad {ROW_COLUMN} value")))?;
        let state: TerminalState = record
            .get(width + 1)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| corrupt(format!("line {line}: bad {STATE_COLUMN} value")))?;
        if !seen.insert(ordinal) {
            return Err(corrupt(format!("line {line}: row {ordinal} appears twice")).into());
        }

        let field = |i: usize| record.get(i).unwrap_or_default().to_string();
        let values = (0..schema.input_width()).map(field).collect();
        let fields = schema
            .extra_columns()
            .iter()
            .map(|(name, i)| (name.clone(), field(*i)))
            .collect();

        restored.push(RowResult {
            ordinal,
            row: Row::new(headers.clone(), values),
            state,
            label: field(schema.label_index()),
            fields,
            calls: 0,
            error: None,
        });
    }

    tracing::debug!(path = %path.display(), rows = restored.len(), "checkpoint loaded");
    Ok(restored)
}

fn parse_count(file_name: &str, stem: &str) -> Option<usize> {
    file_name
        .strip_prefix(stem)?
        .strip_prefix("_backup_")?
        .strip_suffix(".csv")?
        .parse()
        .ok()
}
