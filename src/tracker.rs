//! Idempotency markers stored in table snapshot summaries.
//!
//! Every commit records the highest epoch its writer has published,
//! inside the same snapshot that publishes the files. Recovery only
//! ever trusts this marker: if the table says a writer reached epoch
//! `e`, every staged epoch `<= e` from that writer is already in.

use crate::errors::CommitResult;
use crate::model::Epoch;
use crate::model::WriterIdentity;
use crate::table::AppendTransaction;
use crate::table::SnapshotMeta;
use crate::table::Table;
use crate::table::TableError;

/// Prefix of the per-writer marker key.
pub const MAX_COMMITTED_EPOCH_PREFIX: &str = "flink.max-committed-checkpoint-id";

/// Which writer produced a snapshot.
pub const WRITER_ID_PROPERTY: &str = "flink.job-id";

/// The epoch a snapshot was committed for.
pub const COMMIT_EPOCH_PROPERTY: &str = "tablecommit.epoch";

/// Summary key of the marker for `writer`.
pub fn marker_key(writer: &WriterIdentity) -> String {
    format!("{MAX_COMMITTED_EPOCH_PREFIX}.{writer}")
}

/// Read a writer's marker from one snapshot, if it has one.
pub fn marker_in(snapshot: &SnapshotMeta, writer: &WriterIdentity) -> Result<Option<Epoch>, TableError> {
    snapshot
        .summary
        .get(&marker_key(writer))
        .map(|value| {
            value.parse().map(Epoch).map_err(|_| {
                TableError::Metadata(format!(
                    "snapshot {} has non-numeric marker {value:?} for writer {writer}",
                    snapshot.version
                ))
            })
        })
        .transpose()
}

/// The highest epoch `writer` has committed to `table`.
///
/// Other writers may have committed since, so this walks back from
/// the current snapshot through parents until it finds a snapshot
/// carrying this writer's marker. [`None`] means the writer has
/// never committed, which sorts below every real epoch.
pub fn last_committed(table: &dyn Table, writer: &WriterIdentity) -> CommitResult<Option<Epoch>> {
    let mut next = table.current_snapshot()?;
    while let Some(snapshot) = next {
        if let Some(epoch) = marker_in(&snapshot, writer)? {
            return Ok(Some(epoch));
        }
        next = match snapshot.parent {
            Some(parent) => Some(table.snapshot(parent)?.ok_or_else(|| {
                TableError::Metadata(format!(
                    "snapshot {} points at missing parent {parent}",
                    snapshot.version
                ))
            })?),
            None => None,
        };
    }
    Ok(None)
}

/// Mark `txn` as publishing `epoch` for `writer`.
///
/// Must be called on the same transaction that appends the epoch's
/// files so readers see both or neither.
pub fn record_commit(txn: &mut dyn AppendTransaction, writer: &WriterIdentity, epoch: Epoch) {
    txn.set_snapshot_property(&marker_key(writer), epoch.to_string());
    txn.set_snapshot_property(WRITER_ID_PROPERTY, writer.to_string());
    txn.set_snapshot_property(COMMIT_EPOCH_PROPERTY, epoch.to_string());
}

#[cfg(test)]
fn commit_marked(table: &dyn Table, writer: &str, epoch: u64) {
    let mut txn = table.new_append().unwrap();
    record_commit(txn.as_mut(), &WriterIdentity::from(writer), Epoch(epoch));
    txn.commit().unwrap();
}

#[test]
fn absent_marker_is_none() {
    use crate::table::SqliteTable;

    let table = SqliteTable::open_in_memory().unwrap();
    assert_eq!(last_committed(&table, &WriterIdentity::from("j")).unwrap(), None);
    commit_marked(&table, "other", 4);
    assert_eq!(last_committed(&table, &WriterIdentity::from("j")).unwrap(), None);
}

#[test]
fn marker_found_behind_other_writers() {
    use crate::table::SqliteTable;

    let table = SqliteTable::open_in_memory().unwrap();
    commit_marked(&table, "a", 1);
    commit_marked(&table, "a", 2);
    commit_marked(&table, "b", 1);
    commit_marked(&table, "c", 9);

    assert_eq!(
        last_committed(&table, &WriterIdentity::from("a")).unwrap(),
        Some(Epoch(2))
    );
    assert_eq!(
        last_committed(&table, &WriterIdentity::from("b")).unwrap(),
        Some(Epoch(1))
    );
    assert_eq!(
        last_committed(&table, &WriterIdentity::from("c")).unwrap(),
        Some(Epoch(9))
    );
}

#[test]
fn terminal_marker_round_trips() {
    use crate::table::SqliteTable;

    let table = SqliteTable::open_in_memory().unwrap();
    commit_marked(&table, "a", u64::MAX);
    let snap = table.current_snapshot().unwrap().unwrap();
    assert_eq!(snap.summary[WRITER_ID_PROPERTY], "a");
    assert_eq!(
        snap.summary[&marker_key(&WriterIdentity::from("a"))],
        "18446744073709551615"
    );
    assert_eq!(
        last_committed(&table, &WriterIdentity::from("a")).unwrap(),
        Some(Epoch::TERMINAL)
    );
}

#[test]
fn garbage_marker_is_an_error() {
    use crate::table::SqliteTable;

    let table = SqliteTable::open_in_memory().unwrap();
    let mut txn = table.new_append().unwrap();
    txn.set_snapshot_property(&marker_key(&WriterIdentity::from("a")), String::from("-1"));
    txn.commit().unwrap();
    assert!(last_committed(&table, &WriterIdentity::from("a")).is_err());
}
