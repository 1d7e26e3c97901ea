mod common;

use std::fs;

use common::*;
use tablecommit::manifest::ManifestStore;
use tablecommit::model::AttemptNumber;
use tablecommit::model::Epoch;
use tablecommit::model::PendingLocation;
use tablecommit::model::TaskIndex;
use tablecommit::model::WriterIdentity;
use tablecommit::table::Table;
use tablecommit::tracker;
use tablecommit::CheckpointedSink;
use tablecommit::CommitError;
use tablecommit::CoordinatorState;

fn s(epoch: u64) -> (String, String) {
    (String::from("job"), epoch.to_string())
}

#[test]
fn duplicate_notifications_commit_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = start(dir.path(), "job", None);

    coord.record(file("a")).unwrap();
    coord.record(file("b")).unwrap();
    coord.snapshot(Epoch(1)).unwrap();
    coord.notify_complete(Epoch(1)).unwrap();
    coord.notify_complete(Epoch(1)).unwrap();

    let table = coord.table();
    assert_eq!(commit_log(table), vec![s(1)]);
    assert_eq!(committed_paths(table), vec!["a", "b"]);
    assert_eq!(coord.max_committed(), Some(Epoch(1)));
    assert_eq!(coord.state(), CoordinatorState::Idle);
    // Committed manifests are cleaned up.
    assert!(manifest_files(dir.path()).is_empty());
}

#[test]
fn out_of_order_notifications_commit_in_epoch_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = start(dir.path(), "job", None);

    for (epoch, path) in [(1, "a"), (2, "b"), (3, "c")] {
        coord.record(file(path)).unwrap();
        coord.snapshot(Epoch(epoch)).unwrap();
    }

    // Completion of 2 implies 1; each gets its own snapshot.
    coord.notify_complete(Epoch(2)).unwrap();
    assert_eq!(commit_log(coord.table()), vec![s(1), s(2)]);
    assert_eq!(coord.commit_state().epochs_through(Epoch::TERMINAL), vec![Epoch(3)]);

    // A late notification for 1 finds nothing left to do.
    coord.notify_complete(Epoch(1)).unwrap();
    assert_eq!(commit_log(coord.table()).len(), 2);

    coord.notify_complete(Epoch(3)).unwrap();
    assert_eq!(commit_log(coord.table()), vec![s(1), s(2), s(3)]);
    assert_eq!(committed_paths(coord.table()), vec!["a", "b", "c"]);
}

#[test]
fn empty_epoch_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = start(dir.path(), "job", None);

    let blob = coord.snapshot(Epoch(1)).unwrap();
    assert!(manifest_files(dir.path()).is_empty());
    assert!(coord.commit_state().is_empty());

    coord.notify_complete(Epoch(1)).unwrap();
    assert!(coord.table().snapshots().unwrap().is_empty());
    assert_eq!(coord.max_committed(), None);

    // Restoring the empty state is just as uneventful.
    let coord = start(dir.path(), "job", Some(&blob[..]));
    assert!(coord.table().snapshots().unwrap().is_empty());
}

#[test]
fn manifest_name_encodes_writer_task_attempt_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = start(dir.path(), "3f2a", None);

    coord.record(file("a")).unwrap();
    coord.snapshot(Epoch(10)).unwrap();
    assert_eq!(
        manifest_files(dir.path()),
        vec!["3f2a-00000-0-10-00001.manifest"]
    );

    let config = config(dir.path(), "3f2a").with_task(TaskIndex(7), AttemptNumber(2));
    let mut coord = start_with(config, dir.path(), None);
    coord.record(file("b")).unwrap();
    coord.snapshot(Epoch(11)).unwrap();
    assert!(manifest_files(dir.path()).contains(&String::from("3f2a-00007-2-11-00001.manifest")));
}

#[test]
fn restore_commits_pending_epoch_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let blob = {
        let mut coord = start(dir.path(), "job", None);
        coord.record(file("a")).unwrap();
        coord.snapshot(Epoch(1)).unwrap()
        // Crash before the completion notification.
    };
    assert!(table(dir.path()).snapshots().unwrap().is_empty());

    let coord = start(dir.path(), "job", Some(&blob[..]));
    assert_eq!(commit_log(coord.table()), vec![s(1)]);
    assert_eq!(coord.max_committed(), Some(Epoch(1)));
    assert_eq!(coord.state(), CoordinatorState::Idle);
    assert!(manifest_files(dir.path()).is_empty());
    drop(coord);

    // Crashing again and restoring from the same checkpoint must not
    // append the files again, even though the manifest is gone.
    let coord = start(dir.path(), "job", Some(&blob[..]));
    assert_eq!(commit_log(coord.table()), vec![s(1)]);
    assert_eq!(committed_paths(coord.table()), vec!["a"]);
}

#[test]
fn restore_after_commit_skips_already_committed_epochs() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = start(dir.path(), "job", None);
    coord.record(file("a")).unwrap();
    let blob1 = coord.snapshot(Epoch(1)).unwrap();
    coord.notify_complete(Epoch(1)).unwrap();
    coord.record(file("b")).unwrap();
    let blob2 = coord.snapshot(Epoch(2)).unwrap();
    drop(coord);

    // Epoch 2 was snapshotted but never committed.
    let coord = start(dir.path(), "job", Some(&blob2[..]));
    assert_eq!(commit_log(coord.table()), vec![s(1), s(2)]);
    drop(coord);

    // Falling back to the older checkpoint only skips.
    let coord = start(dir.path(), "job", Some(&blob1[..]));
    assert_eq!(commit_log(coord.table()), vec![s(1), s(2)]);
    assert_eq!(coord.max_committed(), Some(Epoch(2)));
}

#[test]
fn restore_under_new_identity_finishes_old_epochs() {
    let dir = tempfile::tempdir().unwrap();
    let blob = {
        let mut coord = start(dir.path(), "old", None);
        coord.record(file("a")).unwrap();
        coord.snapshot(Epoch(4)).unwrap()
    };

    let mut coord = start(dir.path(), "new", Some(&blob[..]));
    assert_eq!(
        commit_log(coord.table()),
        vec![(String::from("old"), String::from("4"))]
    );
    assert_eq!(coord.writer(), &WriterIdentity::from("new"));
    assert_eq!(coord.commit_state().writer(), &WriterIdentity::from("new"));
    assert_eq!(coord.max_committed(), None);

    // The new identity counts from scratch without colliding with the
    // old marker.
    coord.record(file("b")).unwrap();
    coord.snapshot(Epoch(1)).unwrap();
    coord.notify_complete(Epoch(1)).unwrap();
    let table = coord.table();
    assert_eq!(
        tracker::last_committed(table, &WriterIdentity::from("old")).unwrap(),
        Some(Epoch(4))
    );
    assert_eq!(
        tracker::last_committed(table, &WriterIdentity::from("new")).unwrap(),
        Some(Epoch(1))
    );
}

#[test]
fn writers_sharing_a_table_and_manifest_dir_stay_independent() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = start(dir.path(), "a", None);
    let mut b = start(dir.path(), "b", None);

    a.record(file("a1")).unwrap();
    a.snapshot(Epoch(1)).unwrap();
    b.record(file("b1")).unwrap();
    b.snapshot(Epoch(1)).unwrap();
    b.record(file("b2")).unwrap();
    b.snapshot(Epoch(2)).unwrap();
    assert_eq!(manifest_files(dir.path()).len(), 3);

    b.notify_complete(Epoch(2)).unwrap();
    // Writer a's epoch 1 is not covered by writer b's marker.
    a.notify_complete(Epoch(1)).unwrap();

    let table = table(dir.path());
    assert_eq!(
        commit_log(&table),
        vec![
            (String::from("b"), String::from("1")),
            (String::from("b"), String::from("2")),
            (String::from("a"), String::from("1")),
        ]
    );
    assert_eq!(committed_paths(&table), vec!["b1", "b2", "a1"]);
    assert_eq!(a.max_committed(), Some(Epoch(1)));
    assert_eq!(b.max_committed(), Some(Epoch(2)));
    assert!(manifest_files(dir.path()).is_empty());
}

#[test]
fn bounded_input_commits_everything_at_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = start(dir.path(), "job", None);

    coord.record(file("a")).unwrap();
    coord.snapshot(Epoch(1)).unwrap();
    coord.record(file("b")).unwrap();
    coord.end_of_input().unwrap();

    assert_eq!(coord.state(), CoordinatorState::Closed);
    assert_eq!(
        commit_log(coord.table()),
        vec![s(1), (String::from("job"), u64::MAX.to_string())]
    );
    let current = coord.table().current_snapshot().unwrap().unwrap();
    assert_eq!(
        current.summary[&tracker::marker_key(&WriterIdentity::from("job"))],
        "18446744073709551615"
    );
    assert_eq!(coord.max_committed(), Some(Epoch::TERMINAL));

    // The runtime may still deliver the completion it owes us.
    coord.notify_complete(Epoch(1)).unwrap();
    assert_eq!(commit_log(coord.table()).len(), 2);
}

#[test]
fn delete_disabled_keeps_manifests() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "job").with_delete_manifests_on_commit(false);
    let mut coord = start_with(config, dir.path(), None);

    coord.record(file("a")).unwrap();
    coord.snapshot(Epoch(1)).unwrap();
    coord.notify_complete(Epoch(1)).unwrap();

    assert_eq!(commit_log(coord.table()), vec![s(1)]);
    assert_eq!(manifest_files(dir.path()), vec!["job-00000-0-1-00001.manifest"]);
}

#[test]
fn corrupt_manifest_fails_and_stays_pending() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = start(dir.path(), "job", None);
    coord.record(file("a")).unwrap();
    coord.snapshot(Epoch(1)).unwrap();

    let Some(PendingLocation::Reference(manifest)) = coord.commit_state().get(&Epoch(1)).cloned()
    else {
        panic!("epoch 1 should be staged in a manifest");
    };
    fs::write(&manifest.path, b"TCPM garbage").unwrap();

    let err = coord.notify_complete(Epoch(1)).unwrap_err();
    assert!(
        matches!(err.root(), CommitError::CorruptManifest { .. }),
        "{err:?}"
    );
    assert_eq!(coord.state(), CoordinatorState::AwaitingCompletion);
    assert!(coord.table().snapshots().unwrap().is_empty());

    // A manifest that vanished is just as unrecoverable.
    fs::remove_file(&manifest.path).unwrap();
    let err = coord.notify_complete(Epoch(1)).unwrap_err();
    assert!(matches!(err.root(), CommitError::CorruptManifest { .. }));
}

#[test]
fn failure_at_an_epoch_leaves_it_and_later_epochs_queued() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = start(dir.path(), "job", None);
    for (epoch, path) in [(1, "a"), (2, "b"), (3, "c")] {
        coord.record(file(path)).unwrap();
        coord.snapshot(Epoch(epoch)).unwrap();
    }
    let broken = coord
        .commit_state()
        .get(&Epoch(2))
        .and_then(|location| location.manifest())
        .cloned()
        .unwrap();
    fs::write(&broken.path, b"not a manifest").unwrap();

    assert!(coord.notify_complete(Epoch(3)).is_err());
    assert_eq!(commit_log(coord.table()), vec![s(1)]);
    assert_eq!(coord.max_committed(), Some(Epoch(1)));
    assert_eq!(
        coord.commit_state().epochs_through(Epoch::TERMINAL),
        vec![Epoch(2), Epoch(3)]
    );
    // Later snapshots still have to be above everything queued.
    assert!(coord.snapshot(Epoch(3)).is_err());
}

#[test]
fn undecodable_blob_is_a_state_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord =
        tablecommit::CommitCoordinator::new(config(dir.path(), "job"), table(dir.path())).unwrap();
    let err = coord.restore(Some(&b"{\"version\": 1"[..])).unwrap_err();
    assert!(matches!(err.root(), CommitError::State(_)), "{err:?}");
}

#[test]
fn default_manifest_dir_lives_under_table_location() {
    let dir = tempfile::tempdir().unwrap();
    let config = tablecommit::CommitterConfig::new(
        dir.path().display().to_string(),
        WriterIdentity::from("job"),
    );
    let mut coord = start_with(config, dir.path(), None);
    coord.record(file("a")).unwrap();
    coord.snapshot(Epoch(1)).unwrap();

    let listed = ManifestStore::open(
        dir.path().join("metadata/pending-manifests"),
        WriterIdentity::from("someone-else"),
        TaskIndex(0),
        AttemptNumber(0),
    )
    .unwrap()
    .list(Some(&WriterIdentity::from("job")))
    .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].epoch, Epoch(1));
}

#[test]
fn drivable_as_checkpointed_sink() {
    let dir = tempfile::tempdir().unwrap();
    let coord =
        tablecommit::CommitCoordinator::new(config(dir.path(), "job"), table(dir.path())).unwrap();
    let mut sink: Box<dyn CheckpointedSink> = Box::new(coord);

    sink.initialize_state(None).unwrap();
    sink.process_element(file("a")).unwrap();
    let blob = sink.snapshot_state(Epoch(1)).unwrap();
    sink.notify_checkpoint_complete(Epoch(1)).unwrap();
    sink.process_element(file("b")).unwrap();
    sink.end_input().unwrap();
    assert!(!blob.is_empty());

    assert_eq!(
        commit_log(&table(dir.path())),
        vec![s(1), (String::from("job"), u64::MAX.to_string())]
    );
}

#[test]
fn snapshot_at_or_below_table_marker_keeps_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = start(dir.path(), "job", None);
    coord.record(file("a")).unwrap();
    let blob1 = coord.snapshot(Epoch(1)).unwrap();
    coord.notify_complete(Epoch(1)).unwrap();
    coord.record(file("b")).unwrap();
    coord.snapshot(Epoch(2)).unwrap();
    coord.notify_complete(Epoch(2)).unwrap();
    drop(coord);

    // The host fell back to an older checkpoint and replays epoch 2.
    let mut coord = start(dir.path(), "job", Some(&blob1[..]));
    assert_eq!(coord.max_committed(), Some(Epoch(2)));
    coord.record(file("c")).unwrap();
    let err = coord.snapshot(Epoch(2)).unwrap_err();
    assert!(
        matches!(err, CommitError::InvalidTransition { .. }),
        "{err:?}"
    );
    assert_eq!(coord.state(), CoordinatorState::Accumulating);
    assert_eq!(manifest_files(dir.path()).len(), 0);

    // An empty replayed epoch is harmless.
    let mut empty = start(dir.path(), "job", Some(&blob1[..]));
    empty.snapshot(Epoch(2)).unwrap();

    coord.snapshot(Epoch(3)).unwrap();
    coord.notify_complete(Epoch(3)).unwrap();
    assert_eq!(committed_paths(coord.table()), vec!["a", "b", "c"]);
    assert_eq!(commit_log(coord.table()), vec![s(1), s(2), s(3)]);
}

#[test]
fn failed_manifest_write_keeps_files_for_retry() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = start(dir.path(), "job", None);
    let pending = manifest_dir(dir.path());
    fs::remove_dir(&pending).unwrap();
    fs::write(&pending, b"in the way").unwrap();

    coord.record(file("a")).unwrap();
    let err = coord.snapshot(Epoch(1)).unwrap_err();
    assert!(
        matches!(err.root(), CommitError::ManifestWrite { .. }),
        "{err:?}"
    );
    assert_eq!(coord.state(), CoordinatorState::Accumulating);
    assert!(coord.commit_state().is_empty());

    fs::remove_file(&pending).unwrap();
    fs::create_dir(&pending).unwrap();
    coord.snapshot(Epoch(1)).unwrap();
    coord.notify_complete(Epoch(1)).unwrap();
    assert_eq!(committed_paths(coord.table()), vec!["a"]);
    assert_eq!(commit_log(coord.table()), vec![s(1)]);
}

#[test]
fn skip_adopts_higher_table_marker() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = start(dir.path(), "job", None);
    coord.record(file("a")).unwrap();
    coord.snapshot(Epoch(1)).unwrap();

    // Another incarnation of the same writer got further.
    let other = table(dir.path());
    let mut txn = other.new_append().unwrap();
    txn.append_file(file("a"));
    tracker::record_commit(txn.as_mut(), &WriterIdentity::from("job"), Epoch(3));
    txn.commit().unwrap();

    coord.notify_complete(Epoch(1)).unwrap();
    assert_eq!(coord.max_committed(), Some(Epoch(3)));
    assert_eq!(coord.state(), CoordinatorState::Idle);
    assert_eq!(committed_paths(coord.table()), vec!["a"]);
}
