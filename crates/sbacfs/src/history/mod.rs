//! Access history for state-based decisions.
//!
//! Every decision the engine takes is appended here as an [`AccessRecord`].
//! The history-sensitive rules query it ("was this path ever written?",
//! "was anything under this directory already selected?").
//!
//! # Persistence
//!
//! A log can be mirrored to a JSON-lines file, one record per line:
//!
//! ```text
//! {"Path":"/scratch/a","Prefix":"/scratch","Access":"open","Time":"2024-03-01T10:00:00Z","Success":true}
//! ```
//!
//! Each line is written and flushed on its own, so a torn write can only
//! damage the last line. On load, damaged lines are skipped and the rest of
//! the file is kept.
//!
//! # Concurrency
//!
//! Records and the file sink sit behind one mutex that is held only for a
//! single append or query.

mod sink;

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::Mode;

pub use sink::{JsonLinesSink, load_records};

/// Errors from the history file.
///
/// These never fail a filesystem request; they are logged and the in-memory
/// log carries on.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Opening or writing the history file failed
    #[error("history file {path}: {source}")]
    Io {
        /// The history file
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// A record could not be encoded
    #[error("failed to encode history record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One decision taken by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccessRecord {
    /// The accessed path
    pub path: String,
    /// Parent directory of the path at decision time
    pub prefix: String,
    /// The operation that was decided
    pub access: Mode,
    /// When the decision was taken
    #[serde(deserialize_with = "record_time::deserialize")]
    pub time: DateTime<Utc>,
    /// Whether access was granted
    pub success: bool,
}

/// Timestamps are written as RFC 3339. Older state files carry local
/// wall-clock time (`2024-03-01 10:00:00`), which is read as well.
mod record_time {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};

    const LOCAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if let Ok(time) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(time.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(&raw, LOCAL_FORMAT).map_err(D::Error::custom)?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|time| time.with_timezone(&Utc))
            .ok_or_else(|| D::Error::custom(format!("'{raw}' does not exist in local time")))
    }
}

/// Record field a query filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordField {
    /// [`AccessRecord::path`]
    Path,
    /// [`AccessRecord::prefix`]
    Prefix,
    /// [`AccessRecord::access`], compared by operation name
    Access,
}

impl RecordField {
    fn matches(&self, record: &AccessRecord, value: &str) -> bool {
        match self {
            RecordField::Path => record.path == value,
            RecordField::Prefix => record.prefix == value,
            RecordField::Access => record.access.as_str() == value,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<AccessRecord>,
    sink: Option<JsonLinesSink>,
}

/// Append-only, queryable log of access decisions.
#[derive(Debug, Default)]
pub struct HistoryLog {
    inner: Mutex<Inner>,
}

impl HistoryLog {
    /// A log that lives only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a persistent log: load the records already in `path`, then append
    /// new ones to it.
    ///
    /// A missing, empty or damaged file yields an empty (or partial) log and a
    /// warning. Only failing to open the file for appending is an error.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let records = load_records(path);
        let sink = JsonLinesSink::open(path)?;
        tracing::debug!(
            path = %path.display(),
            records = records.len(),
            "opened history file"
        );
        Ok(Self {
            inner: Mutex::new(Inner {
                records,
                sink: Some(sink),
            }),
        })
    }

    /// Start an empty log that is mirrored to `path` for auditing, without
    /// loading what the file already contains.
    pub fn audit_only(path: &Path) -> Result<Self, HistoryError> {
        let sink = JsonLinesSink::open(path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                records: Vec::new(),
                sink: Some(sink),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Records are only ever pushed, so a panic elsewhere cannot leave them
        // half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a decision.
    ///
    /// Returns `false` without recording when `path` or `prefix` is empty.
    /// The record is written to the history file before this returns; a
    /// write failure is logged and the record is kept in memory.
    pub fn append(&self, path: &str, prefix: &str, access: Mode, success: bool) -> bool {
        if path.is_empty() || prefix.is_empty() {
            tracing::debug!(path, prefix, "refusing history record with empty field");
            return false;
        }

        let record = AccessRecord {
            path: path.to_string(),
            prefix: prefix.to_string(),
            access,
            time: Utc::now(),
            success,
        };

        let mut inner = self.lock();
        if let Some(sink) = inner.sink.as_mut()
            && let Err(e) = sink.write(&record)
        {
            tracing::warn!(error = %e, "failed to persist history record");
        }
        tracing::trace!(?record, "added history record");
        inner.records.push(record);
        true
    }

    /// Successful records whose `field` equals `value`, most recent first.
    pub fn query(&self, field: RecordField, value: &str) -> Vec<AccessRecord> {
        let inner = self.lock();
        let mut matches: Vec<AccessRecord> = inner
            .records
            .iter()
            .rev()
            .filter(|r| r.success && field.matches(r, value))
            .cloned()
            .collect();
        drop(inner);

        // Stable: among equal timestamps the later insertion stays first.
        matches.sort_by(|a, b| b.time.cmp(&a.time));
        matches
    }

    /// Copy of every record, in insertion order.
    pub fn records(&self) -> Vec<AccessRecord> {
        self.lock().records.clone()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }
}
