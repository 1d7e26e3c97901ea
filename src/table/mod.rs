//! The table we publish data files into.
//!
//! The coordinator only needs a small slice of a snapshot-based
//! table format: read the current snapshot and walk its ancestry,
//! and append files plus summary properties as one atomic new
//! snapshot. Implementations must make [`AppendTransaction::commit`]
//! a compare-and-swap on the snapshot the transaction was started
//! from, reporting a lost race as [`TableError::Conflict`].
//!
//! [`sqlite::SqliteTable`] is a complete implementation backed by a
//! SQLite catalog.

use std::collections::BTreeMap;
use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::model::DataFileDescriptor;

pub mod sqlite;

pub use sqlite::SqliteTable;

/// Version of a table snapshot. Each commit produces the next one.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotVersion(pub u64);

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Metadata of one committed table snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub version: SnapshotVersion,
    pub parent: Option<SnapshotVersion>,
    pub committed_at: DateTime<Utc>,
    /// Free-form properties set by the committer.
    pub summary: BTreeMap<String, String>,
    pub added_data_files: usize,
    pub added_records: u64,
}

#[derive(Error, Debug)]
pub enum TableError {
    /// Someone else committed since this transaction was started.
    #[error("table moved from snapshot {expected:?} to {found:?} during commit")]
    Conflict {
        expected: Option<SnapshotVersion>,
        found: Option<SnapshotVersion>,
    },
    #[error("table storage error: {0}")]
    Storage(String),
    #[error("invalid table metadata: {0}")]
    Metadata(String),
}

impl TableError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, TableError::Conflict { .. })
    }
}

impl From<rusqlite::Error> for TableError {
    fn from(err: rusqlite::Error) -> Self {
        TableError::Storage(err.to_string())
    }
}

impl From<rusqlite_migration::Error> for TableError {
    fn from(err: rusqlite_migration::Error) -> Self {
        TableError::Storage(err.to_string())
    }
}

/// A table that can be appended to.
pub trait Table {
    /// Where the table lives, for logging.
    fn location(&self) -> &str;

    /// The latest committed snapshot, or [`None`] for a table nobody
    /// has committed to yet.
    fn current_snapshot(&self) -> Result<Option<SnapshotMeta>, TableError>;

    /// Look up a specific snapshot, e.g. to walk parents.
    fn snapshot(&self, version: SnapshotVersion) -> Result<Option<SnapshotMeta>, TableError>;

    /// Start an append based on the current snapshot.
    fn new_append(&self) -> Result<Box<dyn AppendTransaction + '_>, TableError>;
}

/// A pending append. Nothing is visible until [`Self::commit`].
pub trait AppendTransaction {
    fn append_file(&mut self, file: DataFileDescriptor);

    fn set_snapshot_property(&mut self, key: &str, value: String);

    /// The snapshot this transaction will be a child of.
    fn base(&self) -> Option<SnapshotVersion>;

    /// Atomically publish all appended files and properties as a new
    /// snapshot.
    fn commit(self: Box<Self>) -> Result<SnapshotMeta, TableError>;
}
