//! Utility functions for file operations and path manipulation

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Directory containing `path`, or `.` for a bare file name
///
/// # Examples
///
/// ```
/// use batch_enrich::utils::parent_dir;
/// use std::path::Path;
///
/// assert_eq!(parent_dir(Path::new("/data/out.csv")), Path::new("/data"));
/// assert_eq!(parent_dir(Path::new("out.csv")), Path::new("."));
/// ```
pub fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// File name without its extension, used to name checkpoint artifacts
///
/// Falls back to `"output"` when the path has no usable file name.
///
/// # Examples
///
/// ```
/// use batch_enrich::utils::file_stem;
/// use std::path::Path;
///
/// assert_eq!(file_stem(Path::new("/data/leads.enriched.csv")), "leads.enriched");
/// assert_eq!(file_stem(Path::new("/")), "output");
/// ```
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "output".to_string())
}

/// Write a file so that readers only ever see the old or the complete new content
///
/// Content goes to a temporary file in the destination directory, is flushed
/// and synced to disk, then renamed over `path` in one step. If `write` fails
/// the temporary file is removed and `path` is untouched.
pub fn write_atomically<T, F>(path: &Path, write: F) -> Result<T>
where
    F: FnOnce(&mut BufWriter<&File>) -> Result<T>,
{
    let dir = parent_dir(path);
    let temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .suffix(".partial")
        .tempfile_in(&dir)?;

    let value = {
        let mut writer = BufWriter::new(temp.as_file());
        let value = write(&mut writer)?;
        writer.flush()?;
        value
    };
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(value)
}

/// Run synchronous file work on the blocking pool
///
/// Keeps runtime workers free to drive in-flight calls and limiter timers
/// while large files are read, written or synced.
pub async fn blocking_io<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Other(format!("file task panicked: {e}")))?
}

/// Remove a file, treating "already gone" as success
pub fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
