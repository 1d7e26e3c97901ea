//! A [`Table`] kept in a SQLite catalog.
//!
//! Snapshots are rows in `snapshots`, each pointing at its parent;
//! the files each snapshot added are rows in `data_files`. The table
//! is append-only: the live file set is every file of every
//! snapshot.
//!
//! Commits take SQLite's write lock up front (`BEGIN IMMEDIATE`),
//! check that the latest snapshot is still the one the append was
//! started from, and only then insert. Separate connections to the
//! same DB file, in this process or others, therefore get the
//! compare-and-swap behavior the coordinator relies on.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use chrono::TimeZone;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::TransactionBehavior;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::AppendTransaction;
use super::SnapshotMeta;
use super::SnapshotVersion;
use super::Table;
use super::TableError;
use crate::model::DataFileDescriptor;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE snapshots ( \
             version INTEGER NOT NULL PRIMARY KEY CHECK (version > 0), \
             parent_version INTEGER, \
             committed_at_ms INTEGER NOT NULL, \
             summary TEXT NOT NULL, \
             added_data_files INTEGER NOT NULL CHECK (added_data_files >= 0), \
             added_records INTEGER NOT NULL CHECK (added_records >= 0), \
             CHECK (parent_version IS NULL OR parent_version < version) \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE data_files ( \
             snapshot_version INTEGER NOT NULL REFERENCES snapshots (version), \
             path TEXT NOT NULL, \
             format TEXT NOT NULL, \
             file_size INTEGER NOT NULL, \
             record_count INTEGER NOT NULL, \
             descriptor TEXT NOT NULL, \
             PRIMARY KEY (snapshot_version, path) \
             ) STRICT",
        ),
    ])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection, in_mem: bool) -> Result<(), TableError> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    if !in_mem {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "busy_timeout", "5000")?;
    migrations().to_latest(conn)?;
    Ok(())
}

/// A table whose catalog is a SQLite DB.
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct SqliteTable {
    location: String,
    /// This is [`Rc<RefCell>`] so that in-flight transactions can hold
    /// on to the connection independently of the table handle.
    conn: Rc<RefCell<Connection>>,
}

impl SqliteTable {
    /// Create a new table catalog at `file`.
    pub fn init(file: &Path) -> Result<Self, TableError> {
        tracing::info!("Init table catalog at {file:?}");
        Self::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    /// Open an existing table catalog at `file`.
    pub fn open(file: &Path) -> Result<Self, TableError> {
        tracing::debug!("Opening table catalog at {file:?}");
        Self::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    fn open_with_flags(file: &Path, flags: OpenFlags) -> Result<Self, TableError> {
        let mut conn = Connection::open_with_flags(file, flags)?;
        setup_conn(&mut conn, false)?;
        Ok(Self {
            location: file.display().to_string(),
            conn: Rc::new(RefCell::new(conn)),
        })
    }

    /// A table that only lives as long as this handle and its
    /// clones.
    pub fn open_in_memory() -> Result<Self, TableError> {
        let mut conn = Connection::open_in_memory()?;
        setup_conn(&mut conn, true)?;
        Ok(Self {
            location: String::from(":memory:"),
            conn: Rc::new(RefCell::new(conn)),
        })
    }

    /// Every snapshot, oldest first.
    pub fn snapshots(&self) -> Result<Vec<SnapshotMeta>, TableError> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "SELECT version, parent_version, committed_at_ms, summary, \
             added_data_files, added_records \
             FROM snapshots \
             ORDER BY version",
        )?;
        let rows = stmt.query_map((), RawSnapshot::from_row)?;
        rows.map(|row| row?.into_meta()).collect()
    }

    /// Every data file in the table, in commit order.
    pub fn data_files(&self) -> Result<Vec<DataFileDescriptor>, TableError> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "SELECT descriptor \
             FROM data_files \
             ORDER BY snapshot_version, rowid",
        )?;
        let rows = stmt.query_map((), |row| row.get::<_, String>(0))?;
        rows.map(|row| decode_descriptor(&row?)).collect()
    }

    /// Data files added by one snapshot.
    pub fn data_files_in(
        &self,
        version: SnapshotVersion,
    ) -> Result<Vec<DataFileDescriptor>, TableError> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "SELECT descriptor \
             FROM data_files \
             WHERE snapshot_version = ?1 \
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map((version.0,), |row| row.get::<_, String>(0))?;
        rows.map(|row| decode_descriptor(&row?)).collect()
    }
}

impl Table for SqliteTable {
    fn location(&self) -> &str {
        &self.location
    }

    fn current_snapshot(&self) -> Result<Option<SnapshotMeta>, TableError> {
        let conn = self.conn.borrow();
        conn.query_row(
            "SELECT version, parent_version, committed_at_ms, summary, \
             added_data_files, added_records \
             FROM snapshots \
             ORDER BY version DESC \
             LIMIT 1",
            (),
            RawSnapshot::from_row,
        )
        .optional()?
        .map(RawSnapshot::into_meta)
        .transpose()
    }

    fn snapshot(&self, version: SnapshotVersion) -> Result<Option<SnapshotMeta>, TableError> {
        let conn = self.conn.borrow();
        conn.query_row(
            "SELECT version, parent_version, committed_at_ms, summary, \
             added_data_files, added_records \
             FROM snapshots \
             WHERE version = ?1",
            (version.0,),
            RawSnapshot::from_row,
        )
        .optional()?
        .map(RawSnapshot::into_meta)
        .transpose()
    }

    fn new_append(&self) -> Result<Box<dyn AppendTransaction + '_>, TableError> {
        let base = latest_version(&self.conn.borrow())?;
        Ok(Box::new(SqliteAppend {
            conn: self.conn.clone(),
            base,
            files: Vec::new(),
            summary: BTreeMap::new(),
        }))
    }
}

struct SqliteAppend {
    conn: Rc<RefCell<Connection>>,
    base: Option<SnapshotVersion>,
    files: Vec<DataFileDescriptor>,
    summary: BTreeMap<String, String>,
}

impl AppendTransaction for SqliteAppend {
    fn append_file(&mut self, file: DataFileDescriptor) {
        self.files.push(file);
    }

    fn set_snapshot_property(&mut self, key: &str, value: String) {
        self.summary.insert(key.to_string(), value);
    }

    fn base(&self) -> Option<SnapshotVersion> {
        self.base
    }

    fn commit(self: Box<Self>) -> Result<SnapshotMeta, TableError> {
        let mut conn = self.conn.borrow_mut();
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let found = latest_version(&txn)?;
        if found != self.base {
            tracing::debug!("Append based on {:?} lost race to {found:?}", self.base);
            return Err(TableError::Conflict {
                expected: self.base,
                found,
            });
        }

        let meta = SnapshotMeta {
            version: SnapshotVersion(self.base.map_or(1, |v| v.0 + 1)),
            parent: self.base,
            committed_at: Utc::now(),
            summary: self.summary.clone(),
            added_data_files: self.files.len(),
            added_records: self.files.iter().map(|f| f.record_count).sum(),
        };
        let summary =
            serde_json::to_string(&meta.summary).map_err(|err| TableError::Metadata(err.to_string()))?;
        txn.execute(
            "INSERT INTO snapshots \
             (version, parent_version, committed_at_ms, summary, added_data_files, added_records) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                meta.version.0,
                meta.parent.map(|v| v.0),
                meta.committed_at.timestamp_millis(),
                summary,
                meta.added_data_files,
                meta.added_records,
            ),
        )?;
        for file in &self.files {
            let descriptor =
                serde_json::to_string(file).map_err(|err| TableError::Metadata(err.to_string()))?;
            txn.execute(
                "INSERT INTO data_files \
                 (snapshot_version, path, format, file_size, record_count, descriptor) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (
                    meta.version.0,
                    &file.path,
                    file.format.extension(),
                    file.file_size_in_bytes,
                    file.record_count,
                    descriptor,
                ),
            )?;
        }
        txn.commit()?;

        tracing::trace!("Committed table snapshot {meta:?}");
        Ok(meta)
    }
}

fn latest_version(conn: &Connection) -> Result<Option<SnapshotVersion>, TableError> {
    let version: Option<u64> =
        conn.query_row("SELECT MAX(version) FROM snapshots", (), |row| row.get(0))?;
    Ok(version.map(SnapshotVersion))
}

fn decode_descriptor(json: &str) -> Result<DataFileDescriptor, TableError> {
    serde_json::from_str(json).map_err(|err| TableError::Metadata(err.to_string()))
}

/// A `snapshots` row before the JSON and timestamp are decoded.
struct RawSnapshot {
    version: u64,
    parent: Option<u64>,
    committed_at_ms: i64,
    summary: String,
    added_data_files: usize,
    added_records: u64,
}

impl RawSnapshot {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            version: row.get(0)?,
            parent: row.get(1)?,
            committed_at_ms: row.get(2)?,
            summary: row.get(3)?,
            added_data_files: row.get(4)?,
            added_records: row.get(5)?,
        })
    }

    fn into_meta(self) -> Result<SnapshotMeta, TableError> {
        let committed_at = Utc
            .timestamp_millis_opt(self.committed_at_ms)
            .single()
            .ok_or_else(|| {
                TableError::Metadata(format!(
                    "snapshot {} has invalid commit time {}",
                    self.version, self.committed_at_ms
                ))
            })?;
        let summary = serde_json::from_str(&self.summary)
            .map_err(|err| TableError::Metadata(err.to_string()))?;
        Ok(SnapshotMeta {
            version: SnapshotVersion(self.version),
            parent: self.parent.map(SnapshotVersion),
            committed_at,
            summary,
            added_data_files: self.added_data_files,
            added_records: self.added_records,
        })
    }
}

#[cfg(test)]
fn file(path: &str, records: u64) -> DataFileDescriptor {
    use crate::model::FileFormat;

    DataFileDescriptor::new(path, FileFormat::Parquet, 100, records)
}

#[test]
fn empty_table_has_no_snapshot() {
    let table = SqliteTable::open_in_memory().unwrap();
    assert_eq!(table.current_snapshot().unwrap(), None);
    assert!(table.snapshots().unwrap().is_empty());
    assert!(table.data_files().unwrap().is_empty());
}

#[test]
fn commits_chain_parents() {
    let table = SqliteTable::open_in_memory().unwrap();

    let mut txn = table.new_append().unwrap();
    txn.append_file(file("a", 1));
    txn.set_snapshot_property("k", String::from("v1"));
    let first = txn.commit().unwrap();
    assert_eq!(first.version, SnapshotVersion(1));
    assert_eq!(first.parent, None);

    let mut txn = table.new_append().unwrap();
    txn.append_file(file("b", 2));
    txn.append_file(file("c", 3));
    let second = txn.commit().unwrap();
    assert_eq!(second.parent, Some(SnapshotVersion(1)));
    assert_eq!(second.added_records, 5);

    let current = table.current_snapshot().unwrap().unwrap();
    assert_eq!(current.version, SnapshotVersion(2));
    assert_eq!(
        table.snapshot(SnapshotVersion(1)).unwrap().unwrap().summary["k"],
        "v1"
    );
    let paths: Vec<_> = table.data_files().unwrap().into_iter().map(|f| f.path).collect();
    assert_eq!(paths, vec!["a", "b", "c"]);
    assert_eq!(table.data_files_in(SnapshotVersion(2)).unwrap().len(), 2);
}

#[test]
fn stale_append_conflicts() {
    let table = SqliteTable::open_in_memory().unwrap();
    let mut stale = table.new_append().unwrap();
    stale.append_file(file("a", 1));

    let mut winner = table.new_append().unwrap();
    winner.append_file(file("b", 1));
    winner.commit().unwrap();

    match stale.commit() {
        Err(TableError::Conflict { expected, found }) => {
            assert_eq!(expected, None);
            assert_eq!(found, Some(SnapshotVersion(1)));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    // The losing files never became visible.
    assert_eq!(table.data_files().unwrap().len(), 1);
}

#[test]
fn separate_connections_see_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.sqlite3");
    let a = SqliteTable::init(&path).unwrap();
    let b = SqliteTable::open(&path).unwrap();

    let stale = b.new_append().unwrap();
    let mut txn = a.new_append().unwrap();
    txn.append_file(file("a", 1));
    txn.commit().unwrap();

    assert!(stale.commit().unwrap_err().is_conflict());
    assert_eq!(
        b.current_snapshot().unwrap().map(|s| s.version),
        Some(SnapshotVersion(1))
    );
}

#[test]
fn open_requires_existing_catalog() {
    let dir = tempfile::tempdir().unwrap();
    assert!(SqliteTable::open(&dir.path().join("missing.sqlite3")).is_err());
}
