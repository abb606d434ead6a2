//! The shared policy table.
//!
//! One comma-separated line per kernel, read by every tuning worker and by
//! the external build. A line's position is its row handle and stays stable
//! for the whole session: rows are only ever appended or rewritten in place.

use std::fs;
use std::path::{Path, PathBuf};

use kt_types::{PolicyError, PolicyRecord};
use parking_lot::Mutex;
use tracing::{debug, info};

/// A located policy row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRow {
    pub row: usize,
    pub record: PolicyRecord,
}

/// Exact byte image of the table, taken before a session mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySnapshot {
    bytes: Vec<u8>,
}

impl PolicySnapshot {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// File-backed policy table with a single writer lock.
#[derive(Debug)]
pub struct PolicyStore {
    path: PathBuf,
    /// Expected number of setting tokens per row, if validated.
    columns: Option<usize>,
    /// Guards every write; `true` once the table is sealed.
    write_lock: Mutex<bool>,
}

impl PolicyStore {
    /// Open the table at `path`, creating an empty one if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P, columns: Option<usize>) -> Result<Self, PolicyError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_error(&path, e))?;
            }
            fs::write(&path, b"").map_err(|e| io_error(&path, e))?;
            info!(path = %path.display(), "created empty policy table");
        }

        Ok(Self {
            path,
            columns,
            write_lock: Mutex::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Locate the row of `kernel`.
    pub fn find(&self, kernel: &str) -> Result<PolicyRow, PolicyError> {
        let lines = self.read_lines()?;
        self.find_in(&lines, kernel)?
            .ok_or_else(|| PolicyError::NotFound {
                kernel: kernel.to_string(),
            })
    }

    /// Locate the row of `kernel`, appending `default` settings when the
    /// kernel has never been tuned. Returns whether a row was appended.
    pub fn find_or_append(
        &self,
        kernel: &str,
        default: &[String],
    ) -> Result<(PolicyRow, bool), PolicyError> {
        let sealed = self.write_lock.lock();
        self.check_open(*sealed)?;
        let lines = self.read_lines()?;
        if let Some(found) = self.find_in(&lines, kernel)? {
            return Ok((found, false));
        }

        let record = PolicyRecord::new(kernel, default.to_vec());
        let row = self.append_locked(lines, &record)?;
        info!(kernel, row, "new kernel found, appended default policy row");
        Ok((PolicyRow { row, record }, true))
    }

    /// Append a default row for a kernel that is not in the table yet.
    pub fn append_default(&self, kernel: &str, default: &[String]) -> Result<usize, PolicyError> {
        let sealed = self.write_lock.lock();
        self.check_open(*sealed)?;
        let lines = self.read_lines()?;
        if let Some(found) = self.find_in(&lines, kernel)? {
            return Ok(found.row);
        }
        self.append_locked(lines, &PolicyRecord::new(kernel, default.to_vec()))
    }

    /// Replace exactly one line. The row must still belong to the record's
    /// kernel.
    pub fn rewrite(&self, row: usize, record: &PolicyRecord) -> Result<(), PolicyError> {
        self.check_columns(row, record)?;
        let sealed = self.write_lock.lock();
        self.check_open(*sealed)?;
        let mut lines = self.read_lines()?;

        let rows = lines.len();
        let line = lines
            .get_mut(row)
            .ok_or(PolicyError::RowOutOfRange { row, rows })?;
        let found = PolicyRecord::kernel_of(line);
        if found != record.kernel {
            return Err(PolicyError::RowMismatch {
                row,
                expected: record.kernel.clone(),
                found: found.to_string(),
            });
        }

        *line = record.to_line();
        self.write_atomic(lines.concat().as_bytes())?;
        debug!(
            kernel = %record.kernel,
            row,
            settings = %record.settings_line(),
            "policy row rewritten"
        );
        Ok(())
    }

    /// All parseable records in row order.
    pub fn records(&self) -> Result<Vec<PolicyRow>, PolicyError> {
        let lines = self.read_lines()?;
        lines
            .iter()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(row, line)| {
                PolicyRecord::parse_line(row, line, self.columns)
                    .map(|record| PolicyRow { row, record })
            })
            .collect()
    }

    pub fn snapshot(&self) -> Result<PolicySnapshot, PolicyError> {
        let _guard = self.write_lock.lock();
        let bytes = fs::read(&self.path).map_err(|e| io_error(&self.path, e))?;
        Ok(PolicySnapshot { bytes })
    }

    /// Put the table back to the exact bytes of `snapshot`.
    pub fn restore(&self, snapshot: &PolicySnapshot) -> Result<(), PolicyError> {
        let sealed = self.write_lock.lock();
        self.check_open(*sealed)?;
        self.write_atomic(&snapshot.bytes)?;
        info!(path = %self.path.display(), "policy table restored from snapshot");
        Ok(())
    }

    /// Restore `snapshot` and refuse every later write, including writes
    /// already waiting on the lock. Used when the process is about to exit.
    pub fn restore_and_seal(&self, snapshot: &PolicySnapshot) -> Result<(), PolicyError> {
        let mut sealed = self.write_lock.lock();
        if *sealed {
            return Ok(());
        }
        *sealed = true;
        self.write_atomic(&snapshot.bytes)?;
        info!(path = %self.path.display(), "policy table restored and sealed");
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        *self.write_lock.lock()
    }

    // ---- internal ----

    /// Physical lines, each keeping its terminator so untouched rows are
    /// written back byte for byte.
    fn read_lines(&self) -> Result<Vec<String>, PolicyError> {
        let content = fs::read_to_string(&self.path).map_err(|e| io_error(&self.path, e))?;
        Ok(content.split_inclusive('\n').map(str::to_string).collect())
    }

    fn find_in(&self, lines: &[String], kernel: &str) -> Result<Option<PolicyRow>, PolicyError> {
        for (row, line) in lines.iter().enumerate() {
            if PolicyRecord::kernel_of(line) == kernel {
                let record = PolicyRecord::parse_line(row, line, self.columns)?;
                return Ok(Some(PolicyRow { row, record }));
            }
        }
        Ok(None)
    }

    fn append_locked(
        &self,
        mut lines: Vec<String>,
        record: &PolicyRecord,
    ) -> Result<usize, PolicyError> {
        self.check_columns(lines.len(), record)?;
        if let Some(last) = lines.last_mut() {
            if !last.ends_with('\n') {
                last.push('\n');
            }
        }
        let row = lines.len();
        lines.push(record.to_line());
        self.write_atomic(lines.concat().as_bytes())?;
        Ok(row)
    }

    fn check_open(&self, sealed: bool) -> Result<(), PolicyError> {
        if sealed {
            return Err(PolicyError::Sealed {
                path: self.path.display().to_string(),
            });
        }
        Ok(())
    }

    fn check_columns(&self, row: usize, record: &PolicyRecord) -> Result<(), PolicyError> {
        match self.columns {
            Some(expected) if record.settings.len() != expected => Err(PolicyError::MalformedRow {
                row,
                message: format!(
                    "{} has {} settings, expected {expected}",
                    record.kernel,
                    record.settings.len()
                ),
            }),
            _ => Ok(()),
        }
    }

    /// Write through a sibling temp file and rename it over the table, so a
    /// reader never observes a half-written table.
    fn write_atomic(&self, bytes: &[u8]) -> Result<(), PolicyError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> PolicyError {
    PolicyError::Io {
        path: path.display().to_string(),
        source,
    }
}
