//! Streaming CSV row source
//!
//! [`RowSource`] reads an input file once, front to back, in fixed-size chunks.
//! It validates every record against the header row, assigns ordinals in read
//! order and hands rows out through [`Iterator`]. It is finite and cannot be
//! restarted: once it has returned `None` (or an error) it keeps returning
//! `None`, and a new source must be opened to read the input again.
//!
//! Only the current chunk is buffered, so memory stays proportional to
//! `chunk_size` rather than to the size of the input.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{MalformedPolicy, SourceConfig};
use crate::error::{Error, Result};
use crate::orchestrator::ShardPlan;
use crate::types::{Headers, Ordinal, Row};

/// Pull-based reader that yields `(Ordinal, Row)` pairs
pub struct RowSource<R = File> {
    reader: csv::Reader<R>,
    headers: Arc<Headers>,
    config: SourceConfig,
    record: csv::ByteRecord,
    buffer: VecDeque<(Ordinal, Row)>,
    next_ordinal: usize,
    skipped: usize,
    pending_error: Option<Error>,
    finished: bool,
}

impl RowSource<File> {
    /// Open a CSV file and read its header row
    pub fn open(path: &Path, config: &SourceConfig) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("cannot open input {}: {e}", path.display()),
            ))
        })?;
        Self::from_reader(file, config)
    }
}

impl<R: Read> RowSource<R> {
    /// Wrap any reader; the header row is read immediately
    pub fn from_reader(reader: R, config: &SourceConfig) -> Result<Self> {
        // Flexible mode: field-count mismatches are reported per record instead
        // of as reader errors, so the malformed policy can decide what happens.
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(config.delimiter as u8)
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let header_record = reader.headers().map_err(|e| Error::Source {
            line: Some(1),
            message: format!("unreadable header row: {e}"),
        })?;
        if header_record.is_empty() {
            return Err(Error::Source {
                line: None,
                message: "missing header row".to_string(),
            });
        }
        let headers = Arc::new(Headers::new(header_record.iter()));

        Ok(Self {
            reader,
            headers,
            config: config.clone(),
            record: csv::ByteRecord::new(),
            buffer: VecDeque::with_capacity(config.chunk_size.min(1024)),
            next_ordinal: 0,
            skipped: 0,
            pending_error: None,
            finished: false,
        })
    }

    /// Column names shared by every row
    pub fn headers(&self) -> &Arc<Headers> {
        &self.headers
    }

    /// Malformed records skipped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Return the next chunk of up to `chunk_size` rows
    ///
    /// An empty vector means the source is exhausted.
    pub fn next_chunk(&mut self) -> Result<Vec<(Ordinal, Row)>> {
        if self.buffer.is_empty() {
            if let Some(err) = self.pending_error.take() {
                self.finished = true;
                return Err(err);
            }
            if self.finished {
                return Ok(Vec::new());
            }
            if let Err(e) = self.fill() {
                self.finished = true;
                return Err(e);
            }
        }
        Ok(self.buffer.drain(..).collect())
    }

    /// Consume the source and count the rows it yields
    pub fn count_rows(self) -> Result<usize> {
        let mut total = 0;
        for item in self {
            item?;
            total += 1;
        }
        Ok(total)
    }

    fn fill(&mut self) -> Result<()> {
        while self.buffer.len() < self.config.chunk_size {
            match self.read_row() {
                Ok(Some(item)) => self.buffer.push_back(item),
                Ok(None) => {
                    self.finished = true;
                    break;
                }
                Err(e) if self.buffer.is_empty() => return Err(e),
                Err(e) => {
                    // Hand out the rows read so far; the error follows them.
                    self.pending_error = Some(e);
                    break;
                }
            }
        }
        Ok(())
    }

    fn read_row(&mut self) -> Result<Option<(Ordinal, Row)>> {
        loop {
            if !self.reader.read_byte_record(&mut self.record)? {
                return Ok(None);
            }
            let line = self.record.position().map(|p| p.line());

            if self.config.skip_empty_lines
                && self.record.iter().all(|f| f.trim_ascii().is_empty())
            {
                continue;
            }

            if self.record.len() != self.headers.len() {
                let message = format!(
                    "expected {} fields, found {}",
                    self.headers.len(),
                    self.record.len()
                );
                self.malformed(line, message)?;
                continue;
            }

            let decoded: std::result::Result<Vec<String>, _> = self
                .record
                .iter()
                .map(|f| std::str::from_utf8(f).map(str::to_string))
                .collect();
            let values = match decoded {
                Ok(values) => values,
                Err(e) => {
                    self.malformed(line, format!("invalid UTF-8: {e}"))?;
                    continue;
                }
            };

            let ordinal = Ordinal(self.next_ordinal);
            self.next_ordinal += 1;
            return Ok(Some((ordinal, Row::new(self.headers.clone(), values))));
        }
    }

    fn malformed(&mut self, line: Option<u64>, message: String) -> Result<()> {
        match self.config.malformed {
            MalformedPolicy::SkipAndWarn => {
                self.skipped += 1;
                tracing::warn!(line = ?line, reason = %message, "skipping malformed record");
                Ok(())
            }
            MalformedPolicy::FailFast => Err(Error::Source { line, message }),
        }
    }
}

impl<R: Read> Iterator for RowSource<R> {
    type Item = Result<(Ordinal, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.buffer.pop_front() {
            return Some(Ok(item));
        }
        if let Some(err) = self.pending_error.take() {
            self.finished = true;
            return Some(Err(err));
        }
        if self.finished {
            return None;
        }
        match self.fill() {
            Ok(()) => self.buffer.pop_front().map(Ok),
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: Read> FusedIterator for RowSource<R> {}

/// Stage contiguous slices of a source as separate CSV files
///
/// The source is streamed once, chunk by chunk; every slice file gets the
/// header row and is flushed after each chunk. Files are named
/// `slice_<index>.csv` inside `dir` and returned in plan order.
pub fn write_slices<R: Read>(
    mut source: RowSource<R>,
    plans: &[ShardPlan],
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    let delimiter = source.config.delimiter as u8;
    let headers = source.headers().clone();

    let mut paths = Vec::with_capacity(plans.len());
    let mut writers = Vec::with_capacity(plans.len());
    for plan in plans {
        let path = dir.join(format!("slice_{}.csv", plan.index));
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(&path)?;
        writer.write_record(headers.names())?;
        paths.push(path);
        writers.push(writer);
    }

    let mut current = 0;
    loop {
        let chunk = source.next_chunk()?;
        if chunk.is_empty() {
            break;
        }
        for (ordinal, row) in chunk {
            while current < plans.len() && ordinal.0 >= plans[current].end() {
                current += 1;
            }
            let writer = writers.get_mut(current).ok_or_else(|| {
                Error::Other(format!("row {ordinal} lies beyond every planned slice"))
            })?;
            writer.write_record(row.values())?;
        }
        for writer in &mut writers {
            writer.flush()?;
        }
    }

    for writer in &mut writers {
        writer.flush()?;
    }
    tracing::debug!(
        slices = paths.len(),
        skipped = source.skipped(),
        dir = %dir.display(),
        "staged input slices"
    );
    Ok(paths)
}
