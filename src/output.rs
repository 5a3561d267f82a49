//! Output schema, result writing and shard concatenation
//!
//! The output keeps every input column in its original order and appends the
//! label column and any extra augmentation columns. A column that already
//! exists in the input is overwritten in place instead of being duplicated.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::config::{OutputConfig, OutputFilter};
use crate::error::{Error, Result};
use crate::types::{Headers, RowResult};
use crate::utils::write_atomically;

/// Column layout of result files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSchema {
    columns: Vec<String>,
    input_width: usize,
    label_index: usize,
    extra: Vec<(String, usize)>,
    delimiter: u8,
}

impl OutputSchema {
    /// Derive the output layout from the input headers
    pub fn new(headers: &Headers, config: &OutputConfig) -> Self {
        let mut columns: Vec<String> = headers.names().to_vec();
        let input_width = columns.len();

        let label_index = position_or_push(&mut columns, &config.label_column);
        let mut extra: Vec<(String, usize)> = Vec::new();
        for name in &config.extra_columns {
            if *name == config.label_column || extra.iter().any(|(n, _)| n == name) {
                continue;
            }
            let index = position_or_push(&mut columns, name);
            extra.push((name.clone(), index));
        }

        Self {
            columns,
            input_width,
            label_index,
            extra,
            delimiter: b',',
        }
    }

    /// Use a different field delimiter for written files
    #[must_use]
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// All output columns in order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of leading columns that come from the input
    pub fn input_width(&self) -> usize {
        self.input_width
    }

    /// Name of the label column
    pub fn label_column(&self) -> &str {
        &self.columns[self.label_index]
    }

    /// Position of the label column
    pub fn label_index(&self) -> usize {
        self.label_index
    }

    /// Extra augmentation columns and their positions
    pub fn extra_columns(&self) -> &[(String, usize)] {
        &self.extra
    }

    /// Field delimiter for written files
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    /// Position of a column by name
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Output record for one result
    pub fn record(&self, result: &RowResult) -> Vec<String> {
        let mut record = result.row.values().to_vec();
        record.resize(self.columns.len(), String::new());
        record[self.label_index] = result.label.clone();
        for (name, index) in &self.extra {
            if let Some(value) = result.fields.get(name) {
                record[*index] = value.clone();
            }
        }
        record
    }

    /// Compile a post-hoc filter against this layout
    pub fn compile_filter(&self, filter: &OutputFilter) -> Result<RowFilter> {
        let column = filter.column.as_deref().unwrap_or(self.label_column());
        let index = self.position(column).ok_or_else(|| {
            Error::config(
                "output.filter.column",
                format!("column {column:?} is not part of the output"),
            )
        })?;
        Ok(RowFilter {
            index,
            keep: filter.keep.iter().cloned().collect(),
        })
    }

    fn writer<'a, 'f>(
        &self,
        out: &'a mut BufWriter<&'f File>,
    ) -> csv::Writer<&'a mut BufWriter<&'f File>> {
        csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(out)
    }
}

/// Keeps only records whose value in one column is in an allow-list
#[derive(Debug, Clone)]
pub struct RowFilter {
    index: usize,
    keep: HashSet<String>,
}

impl RowFilter {
    /// Whether a record, given as its fields in column order, passes the filter
    pub fn keeps<'a>(&self, mut fields: impl Iterator<Item = &'a str>) -> bool {
        fields
            .nth(self.index)
            .is_some_and(|value| self.keep.contains(value))
    }
}

fn position_or_push(columns: &mut Vec<String>, name: &str) -> usize {
    match columns.iter().position(|c| c == name) {
        Some(i) => i,
        None => {
            columns.push(name.to_string());
            columns.len() - 1
        }
    }
}

/// Counts from writing a result file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Records written
    pub written: usize,
    /// Records dropped by the filter
    pub filtered: usize,
}

/// Write results in the order given, replacing `path` atomically
pub fn write_results<'r, I>(
    path: &Path,
    schema: &OutputSchema,
    results: I,
    filter: Option<&RowFilter>,
) -> Result<WriteStats>
where
    I: IntoIterator<Item = &'r RowResult>,
{
    write_atomically(path, |out| {
        let mut writer = schema.writer(out);
        writer.write_record(schema.columns())?;

        let mut stats = WriteStats::default();
        for result in results {
            let record = schema.record(result);
            if filter.is_some_and(|f| !f.keeps(record.iter().map(String::as_str))) {
                stats.filtered += 1;
                continue;
            }
            writer.write_record(&record)?;
            stats.written += 1;
        }
        writer.flush()?;
        Ok(stats)
    })
}

/// Concatenate shard outputs in the order given, writing the header once
///
/// Each part must have the schema's header. The filter, if any, is applied
/// here so that it sees the complete result set.
pub fn concat_outputs(
    parts: &[PathBuf],
    dest: &Path,
    schema: &OutputSchema,
    filter: Option<&RowFilter>,
) -> Result<WriteStats> {
    write_atomically(dest, |out| {
        let mut writer = schema.writer(out);
        writer.write_record(schema.columns())?;

        let mut stats = WriteStats::default();
        let mut record = csv::StringRecord::new();
        for part in parts {
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(schema.delimiter())
                .from_path(part)?;
            let header = reader.headers()?;
            if header.iter().ne(schema.columns().iter().map(String::as_str)) {
                return Err(Error::Other(format!(
                    "{} has an unexpected header: {:?}",
                    part.display(),
                    header
                )));
            }
            while reader.read_record(&mut record)? {
                if filter.is_some_and(|f| !f.keeps(record.iter())) {
                    stats.filtered += 1;
                    continue;
                }
                writer.write_record(&record)?;
                stats.written += 1;
            }
        }
        writer.flush()?;
        Ok(stats)
    })
}
