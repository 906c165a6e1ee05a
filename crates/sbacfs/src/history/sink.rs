//! JSON-lines history file.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{AccessRecord, HistoryError};

/// Append-only writer for a history file.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: File,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed.
    ///
    /// A file whose last line was cut short gets a newline first, so the
    /// damaged line stays isolated and the next record starts a line of its
    /// own.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let io_err = |source| HistoryError::Io {
            path: path.display().to_string(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;

        if ends_mid_line(&mut file).map_err(io_err)? {
            tracing::warn!(path = %path.display(), "history file ends in a torn record");
            file.write_all(b"\n")
                .and_then(|()| file.flush())
                .map_err(io_err)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Write one record as a single line and flush it.
    pub fn write(&mut self, record: &AccessRecord) -> Result<(), HistoryError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .map_err(|source| HistoryError::Io {
                path: self.path.display().to_string(),
                source,
            })
    }
}

/// Whether a non-empty file lacks a final newline.
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Read every valid record from a history file.
///
/// Missing or empty files give an empty list. Lines that do not decode are
/// skipped with a warning.
pub fn load_records(path: &Path) -> Vec<AccessRecord> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "could not load history, starting empty"
            );
            return Vec::new();
        }
    };

    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "stopped reading history file"
                );
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AccessRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = idx + 1,
                error = %e,
                "skipping malformed history record"
            ),
        }
    }

    if records.is_empty() {
        tracing::warn!(path = %path.display(), "history file holds no records");
    }
    records
}
