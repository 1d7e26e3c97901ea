mod common;

use std::cell::Cell;
use std::time::Duration;

use common::*;
use tablecommit::model::Epoch;
use tablecommit::model::WriterIdentity;
use tablecommit::table::AppendTransaction;
use tablecommit::table::SnapshotMeta;
use tablecommit::table::SnapshotVersion;
use tablecommit::table::SqliteTable;
use tablecommit::table::Table;
use tablecommit::table::TableError;
use tablecommit::tracker;
use tablecommit::CommitCoordinator;
use tablecommit::CommitError;
use tablecommit::CoordinatorState;

/// Wraps a table so that another writer sneaks in a commit right
/// after each of the next `races` appends is started.
struct RacyTable {
    inner: SqliteTable,
    rival: WriterIdentity,
    races: Cell<u32>,
    rival_epoch: Cell<u64>,
}

impl RacyTable {
    fn new(inner: SqliteTable, rival: &str, races: u32) -> Self {
        Self {
            inner,
            rival: WriterIdentity::from(rival),
            races: Cell::new(races),
            rival_epoch: Cell::new(0),
        }
    }
}

impl Table for RacyTable {
    fn location(&self) -> &str {
        self.inner.location()
    }

    fn current_snapshot(&self) -> Result<Option<SnapshotMeta>, TableError> {
        self.inner.current_snapshot()
    }

    fn snapshot(&self, version: SnapshotVersion) -> Result<Option<SnapshotMeta>, TableError> {
        self.inner.snapshot(version)
    }

    fn new_append(&self) -> Result<Box<dyn AppendTransaction + '_>, TableError> {
        let txn = self.inner.new_append()?;
        if self.races.get() > 0 {
            self.races.set(self.races.get() - 1);
            self.rival_epoch.set(self.rival_epoch.get() + 1);
            let mut rival = self.inner.new_append()?;
            rival.append_file(file(&format!("rival-{}", self.rival_epoch.get())));
            tracker::record_commit(rival.as_mut(), &self.rival, Epoch(self.rival_epoch.get()));
            rival.commit()?;
        }
        Ok(txn)
    }
}

fn racy(dir: &std::path::Path, races: u32, retries: u32) -> CommitCoordinator<RacyTable> {
    let config = config(dir, "job")
        .with_max_commit_retries(retries)
        .with_commit_retry_backoff(Duration::from_millis(1));
    let table = RacyTable::new(table(dir), "rival", races);
    let mut coord = CommitCoordinator::new(config, table).unwrap();
    coord.restore(None).unwrap();
    coord
}

#[test]
fn lost_races_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = racy(dir.path(), 2, 4);

    coord.record(file("a")).unwrap();
    coord.snapshot(Epoch(1)).unwrap();
    coord.notify_complete(Epoch(1)).unwrap();

    let table = &coord.table().inner;
    assert_eq!(
        commit_log(table),
        vec![
            (String::from("rival"), String::from("1")),
            (String::from("rival"), String::from("2")),
            (String::from("job"), String::from("1")),
        ]
    );
    assert_eq!(committed_paths(table), vec!["rival-1", "rival-2", "a"]);
    assert_eq!(coord.max_committed(), Some(Epoch(1)));
    assert_eq!(coord.state(), CoordinatorState::Idle);
}

#[test]
fn exhausted_retries_leave_epoch_pending() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = racy(dir.path(), 10, 2);

    coord.record(file("a")).unwrap();
    coord.snapshot(Epoch(1)).unwrap();
    let err = coord.notify_complete(Epoch(1)).unwrap_err();
    assert!(
        matches!(
            err.root(),
            CommitError::RetriesExhausted {
                epoch: Epoch(1),
                attempts: 3
            }
        ),
        "{err:?}"
    );
    assert_eq!(coord.state(), CoordinatorState::AwaitingCompletion);
    assert_eq!(coord.max_committed(), None);
    assert!(!committed_paths(&coord.table().inner).contains(&String::from("a")));

    // Once the rival quiets down the next notification gets through.
    coord.table().races.set(0);
    coord.notify_complete(Epoch(1)).unwrap();
    assert_eq!(coord.max_committed(), Some(Epoch(1)));
    assert!(committed_paths(&coord.table().inner).contains(&String::from("a")));
}

#[test]
fn no_retries_means_first_conflict_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = racy(dir.path(), 1, 0);

    coord.record(file("a")).unwrap();
    coord.snapshot(Epoch(1)).unwrap();
    let err = coord.notify_complete(Epoch(1)).unwrap_err();
    assert!(matches!(
        err.root(),
        CommitError::RetriesExhausted { attempts: 1, .. }
    ));
}

/// A table where a zombie instance of the same writer commits our
/// epoch in between our append starting and committing.
struct ZombieTable {
    inner: SqliteTable,
    armed: Cell<bool>,
}

impl Table for ZombieTable {
    fn location(&self) -> &str {
        self.inner.location()
    }

    fn current_snapshot(&self) -> Result<Option<SnapshotMeta>, TableError> {
        self.inner.current_snapshot()
    }

    fn snapshot(&self, version: SnapshotVersion) -> Result<Option<SnapshotMeta>, TableError> {
        self.inner.snapshot(version)
    }

    fn new_append(&self) -> Result<Box<dyn AppendTransaction + '_>, TableError> {
        let txn = self.inner.new_append()?;
        if self.armed.replace(false) {
            let mut zombie = self.inner.new_append()?;
            zombie.append_file(file("a"));
            tracker::record_commit(zombie.as_mut(), &WriterIdentity::from("job"), Epoch(1));
            zombie.commit()?;
        }
        Ok(txn)
    }
}

#[test]
fn retry_revalidates_marker_before_appending_again() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "job").with_commit_retry_backoff(Duration::from_millis(1));
    let table = ZombieTable {
        inner: table(dir.path()),
        armed: Cell::new(true),
    };
    let mut coord = CommitCoordinator::new(config, table).unwrap();
    coord.restore(None).unwrap();

    coord.record(file("a")).unwrap();
    coord.snapshot(Epoch(1)).unwrap();
    coord.notify_complete(Epoch(1)).unwrap();

    // Only the zombie's copy is in the table.
    let table = &coord.table().inner;
    assert_eq!(commit_log(table), vec![(String::from("job"), String::from("1"))]);
    assert_eq!(committed_paths(table), vec!["a"]);
    assert_eq!(coord.max_committed(), Some(Epoch(1)));
    assert!(manifest_files(dir.path()).is_empty());
}
