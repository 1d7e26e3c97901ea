//! Two-phase, epoch-based commit of data files into a table.
//!
//! Between checkpoints the coordinator just buffers descriptors. When
//! the host snapshots epoch `e`, the buffered files are written to a
//! durable pending manifest and a reference to it goes into the
//! checkpointed [`CommitState`]. Only once the host reports that
//! checkpoint `e` is complete are the files appended to the table,
//! one snapshot per epoch, in ascending order, together with this
//! writer's idempotency marker.
//!
//! Any of those steps can be interrupted. On restore the checkpointed
//! state is replayed; the marker in the table tells which of its
//! epochs already made it in.

use std::fmt;
use std::time::Duration;

use tracing::instrument;

use crate::accumulator::EpochAccumulator;
use crate::config::CommitterConfig;
use crate::errors::CommitError;
use crate::errors::CommitResult;
use crate::errors::ResultExt;
use crate::host::CheckpointedSink;
use crate::manifest::ManifestStore;
use crate::metrics::CommitMetrics;
use crate::model::*;
use crate::table::SnapshotMeta;
use crate::table::Table;
use crate::tracker;
use crate::with_timer;

/// Where a coordinator is in its lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Nothing buffered and nothing waiting to be committed.
    Idle,
    /// Descriptors have been recorded since the last snapshot.
    Accumulating,
    /// Snapshotted epochs are waiting for their completion
    /// notification.
    AwaitingCompletion,
    /// Input has ended and everything was committed.
    Closed,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Accumulating => "accumulating",
            CoordinatorState::AwaitingCompletion => "awaiting completion",
            CoordinatorState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What happened to one pending epoch.
#[derive(Debug)]
enum EpochOutcome {
    Committed(SnapshotMeta),
    /// The table already has this epoch for this writer.
    Skipped { marker: Epoch },
}

/// Commits data files for one writer task into `T`.
///
/// Drive it through [`CheckpointedSink`] or the equivalent inherent
/// methods. [`Self::restore`] must be called before anything else.
pub struct CommitCoordinator<T: Table> {
    config: CommitterConfig,
    table: T,
    store: ManifestStore,
    accumulator: EpochAccumulator,
    state: CommitState,
    /// Highest epoch this writer is known to have in the table.
    max_committed: Option<Epoch>,
    closed: bool,
    metrics: CommitMetrics,
}

impl<T: Table> CommitCoordinator<T> {
    /// Build a coordinator and create its manifest directory.
    ///
    /// Does not touch the table; that happens in [`Self::restore`].
    pub fn new(config: CommitterConfig, table: T) -> CommitResult<Self> {
        let store = ManifestStore::open(
            config.manifest_dir(),
            config.writer.clone(),
            config.task_index,
            config.attempt,
        )
        .reraise("error opening pending manifest store")?;
        let metrics = CommitMetrics::new(&config.writer, config.task_index);
        let state = CommitState::new(config.writer.clone());
        Ok(Self {
            config,
            table,
            store,
            accumulator: EpochAccumulator::new(),
            state,
            max_committed: None,
            closed: false,
            metrics,
        })
    }

    pub fn state(&self) -> CoordinatorState {
        if self.closed {
            CoordinatorState::Closed
        } else if !self.accumulator.is_empty() {
            CoordinatorState::Accumulating
        } else if !self.state.is_empty() {
            CoordinatorState::AwaitingCompletion
        } else {
            CoordinatorState::Idle
        }
    }

    /// Epochs snapshotted but not yet committed.
    pub fn commit_state(&self) -> &CommitState {
        &self.state
    }

    pub fn max_committed(&self) -> Option<Epoch> {
        self.max_committed
    }

    pub fn writer(&self) -> &WriterIdentity {
        &self.config.writer
    }

    pub fn config(&self) -> &CommitterConfig {
        &self.config
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn manifest_store(&self) -> &ManifestStore {
        &self.store
    }

    fn ensure_open(&self, op: &'static str) -> CommitResult<()> {
        if self.closed {
            Err(CommitError::InvalidTransition {
                op,
                state: CoordinatorState::Closed.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Borrow the pieces needed to commit separately from the
    /// pending state they commit out of.
    fn split(&mut self) -> (EpochCommitter<'_, T>, &mut CommitState, &mut Option<Epoch>) {
        (
            EpochCommitter {
                table: &self.table,
                store: &self.store,
                config: &self.config,
                metrics: &self.metrics,
            },
            &mut self.state,
            &mut self.max_committed,
        )
    }

    /// Start from scratch, or from the state of the last successful
    /// checkpoint.
    ///
    /// Every epoch in a restored state that the table doesn't have
    /// yet is committed now, under the writer identity it was staged
    /// with. The coordinator then continues with empty state under
    /// the configured identity, which may differ if the job was
    /// redeployed.
    #[instrument(name = "restore", skip_all)]
    pub fn restore(&mut self, blob: Option<&[u8]>) -> CommitResult<()> {
        self.ensure_open("restore")?;

        if let Some(bytes) = blob {
            let mut restored =
                CommitState::from_bytes(bytes).reraise("error decoding checkpointed commit state")?;
            let restored_writer = restored.writer().clone();
            let (committer, _, _) = self.split();
            let mut restored_marker = tracker::last_committed(committer.table, &restored_writer)
                .reraise_with(|| format!("error reading marker for writer {restored_writer}"))?;
            tracing::info!(
                "Restoring {} pending epochs for writer {restored_writer}; \
                 table has it through {restored_marker:?}",
                restored.len()
            );
            committer.commit_through(&mut restored, Epoch::TERMINAL, &mut restored_marker)?;
        }

        self.accumulator = EpochAccumulator::new();
        self.state = CommitState::new(self.config.writer.clone());
        self.max_committed = tracker::last_committed(&self.table, &self.config.writer)
            .reraise_with(|| format!("error reading marker for writer {}", self.config.writer))?;
        tracing::info!(
            "Coordinator for writer {} on {} ready; last committed epoch {:?}",
            self.config.writer,
            self.table.location(),
            self.max_committed
        );
        Ok(())
    }

    /// Buffer a data file for the current epoch.
    pub fn record(&mut self, file: DataFileDescriptor) -> CommitResult<()> {
        self.ensure_open("record")?;
        tracing::trace!("Recording data file {:?}", file.path);
        self.accumulator.add(file);
        Ok(())
    }

    /// Freeze everything recorded so far as `epoch` and return the
    /// state to checkpoint.
    ///
    /// An epoch without files leaves no manifest and will not
    /// produce a table snapshot.
    #[instrument(name = "snapshot", skip(self))]
    pub fn snapshot(&mut self, epoch: Epoch) -> CommitResult<Vec<u8>> {
        self.ensure_open("snapshot")?;
        if epoch.is_terminal() {
            return Err(CommitError::InvalidTransition {
                op: "snapshot the terminal epoch",
                state: self.state().to_string(),
            });
        }
        if let Some(max) = self.state.max_epoch() {
            if epoch <= max {
                return Err(CommitError::InvalidTransition {
                    op: "snapshot",
                    state: format!("{} with epoch {max} already pending, got {epoch}", self.state()),
                });
            }
        }

        if !self.accumulator.is_empty() {
            if let Some(committed) = self.max_committed.filter(|committed| epoch <= *committed) {
                return Err(CommitError::InvalidTransition {
                    op: "snapshot",
                    state: format!(
                        "{} with epoch {committed} already committed, got {epoch}",
                        self.state()
                    ),
                });
            }
        }

        tracing::debug!(
            "Snapshotting epoch {epoch}: {} data files, {} records buffered",
            self.accumulator.len(),
            self.accumulator.record_count()
        );
        let files = self.accumulator.drain_and_reset();
        if files.is_empty() {
            tracing::debug!("No data files in epoch {epoch}; nothing to stage");
        } else {
            let written = with_timer!(
                self.metrics.manifest_write_duration,
                self.metrics.labels,
                self.store.write(epoch, &files)
            );
            let manifest = match written {
                Ok(manifest) => manifest,
                Err(err) => {
                    // Keep the files so a retried snapshot still has them.
                    for file in files {
                        self.accumulator.add(file);
                    }
                    return Err(err).reraise_with(|| {
                        format!("error staging pending manifest for epoch {epoch}")
                    });
                }
            };
            tracing::info!(
                "Staged epoch {epoch}: {} data files, {} records in {:?}",
                manifest.data_file_count,
                manifest.record_count,
                manifest.path
            );
            self.state.push(epoch, PendingLocation::Reference(manifest))?;
        }

        self.state.to_bytes()
    }

    /// Checkpoint `epoch` is durable: commit every pending epoch up to
    /// and including it.
    ///
    /// Stops at the first epoch that fails; it and every later epoch
    /// stay pending for the next notification or restore.
    #[instrument(name = "notify_complete", skip(self))]
    pub fn notify_complete(&mut self, epoch: Epoch) -> CommitResult<()> {
        if self.closed {
            tracing::debug!("Ignoring completion of epoch {epoch} after end of input");
            return Ok(());
        }
        if self.state.epochs_through(epoch).is_empty() {
            tracing::debug!("Completion of epoch {epoch} has nothing pending to commit");
            return Ok(());
        }

        let (committer, state, max_committed) = self.split();
        committer.commit_through(state, epoch, max_committed)?;
        Ok(())
    }

    /// The input is exhausted: commit everything, including files
    /// recorded since the last snapshot, and close.
    ///
    /// Trailing files are committed as [`Epoch::TERMINAL`].
    #[instrument(name = "end_of_input", skip_all)]
    pub fn end_of_input(&mut self) -> CommitResult<()> {
        self.ensure_open("end input")?;

        {
            let (committer, state, max_committed) = self.split();
            committer.commit_through(state, Epoch::TERMINAL, max_committed)?;
        }

        let files = self.accumulator.drain_and_reset();
        if !files.is_empty() {
            let (committer, state, max_committed) = self.split();
            tracing::info!(
                "Committing {} trailing data files at end of input",
                files.len()
            );
            state.push(Epoch::TERMINAL, PendingLocation::Inline(files))?;
            committer.commit_through(state, Epoch::TERMINAL, max_committed)?;
        }

        self.closed = true;
        tracing::info!(
            "Writer {} closed; last committed epoch {:?}",
            self.config.writer,
            self.max_committed
        );
        Ok(())
    }
}

impl<T: Table> CheckpointedSink for CommitCoordinator<T> {
    fn initialize_state(&mut self, state: Option<&[u8]>) -> CommitResult<()> {
        self.restore(state)
    }

    fn process_element(&mut self, file: DataFileDescriptor) -> CommitResult<()> {
        self.record(file)
    }

    fn snapshot_state(&mut self, epoch: Epoch) -> CommitResult<Vec<u8>> {
        self.snapshot(epoch)
    }

    fn notify_checkpoint_complete(&mut self, epoch: Epoch) -> CommitResult<()> {
        self.notify_complete(epoch)
    }

    fn end_input(&mut self) -> CommitResult<()> {
        self.end_of_input()
    }
}

/// The parts of a coordinator needed to move pending epochs into the
/// table.
struct EpochCommitter<'a, T: Table> {
    table: &'a T,
    store: &'a ManifestStore,
    config: &'a CommitterConfig,
    metrics: &'a CommitMetrics,
}

impl<'a, T: Table> EpochCommitter<'a, T> {
    /// Commit every epoch in `pending` up to `up_to`, oldest first.
    ///
    /// `marker` tracks the highest epoch known committed for the
    /// pending state's writer and is advanced as epochs go in.
    fn commit_through(
        &self,
        pending: &mut CommitState,
        up_to: Epoch,
        marker: &mut Option<Epoch>,
    ) -> CommitResult<()> {
        let writer = pending.writer().clone();
        for epoch in pending.epochs_through(up_to) {
            let Some(location) = pending.get(&epoch) else {
                continue;
            };
            let outcome = with_timer!(
                self.metrics.epoch_commit_duration,
                self.metrics.labels,
                self.commit_epoch(&writer, epoch, location)
            )
            .reraise_with(|| format!("error committing epoch {epoch} for writer {writer}"))?;

            let reached = match outcome {
                EpochOutcome::Committed(snapshot) => {
                    self.metrics.committed(snapshot.added_data_files);
                    tracing::info!(
                        "Committed epoch {epoch} for writer {writer} as snapshot {}: \
                         {} data files, {} records",
                        snapshot.version,
                        snapshot.added_data_files,
                        snapshot.added_records
                    );
                    epoch
                }
                EpochOutcome::Skipped { marker: observed } => {
                    self.metrics.skipped();
                    tracing::debug!(
                        "Epoch {epoch} for writer {writer} already committed \
                         (table marker {observed}); skipping"
                    );
                    observed
                }
            };

            if self.config.delete_manifests_on_commit {
                if let Some(manifest) = location.manifest() {
                    if !self.store.delete(manifest) {
                        self.metrics.delete_failed();
                    }
                }
            }
            pending.remove(&epoch);
            *marker = (*marker).max(Some(reached));
        }
        Ok(())
    }

    /// Make sure `epoch` is in the table, retrying lost races.
    ///
    /// The marker is checked before every attempt, so an epoch that
    /// some earlier incarnation already committed is never appended
    /// twice, and its manifest is never read.
    fn commit_epoch(
        &self,
        writer: &WriterIdentity,
        epoch: Epoch,
        location: &PendingLocation,
    ) -> CommitResult<EpochOutcome> {
        if let Some(marker) = self.committed_marker(writer, epoch)? {
            return Ok(EpochOutcome::Skipped { marker });
        }

        let files = match location {
            PendingLocation::Inline(files) => files.clone(),
            PendingLocation::Reference(manifest) => self.store.read(manifest)?,
        };

        let mut attempt: u32 = 1;
        loop {
            match self.try_commit(writer, epoch, &files) {
                Ok(snapshot) => return Ok(EpochOutcome::Committed(snapshot)),
                Err(err) if err.is_conflict() => {
                    self.metrics.conflict();
                    if attempt > self.config.max_commit_retries {
                        return Err(CommitError::RetriesExhausted {
                            epoch,
                            attempts: attempt,
                        });
                    }
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        "Commit of epoch {epoch} lost a race on attempt {attempt}; \
                         retrying in {backoff:?}"
                    );
                    std::thread::sleep(backoff);
                    attempt += 1;

                    if let Some(marker) = self.committed_marker(writer, epoch)? {
                        return Ok(EpochOutcome::Skipped { marker });
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The table's marker for `writer`, if it already covers `epoch`.
    fn committed_marker(&self, writer: &WriterIdentity, epoch: Epoch) -> CommitResult<Option<Epoch>> {
        let marker = tracker::last_committed(self.table, writer)?;
        Ok(marker.filter(|marker| *marker >= epoch))
    }

    /// One append-and-mark transaction.
    fn try_commit(
        &self,
        writer: &WriterIdentity,
        epoch: Epoch,
        files: &[DataFileDescriptor],
    ) -> CommitResult<SnapshotMeta> {
        let mut txn = self.table.new_append()?;
        for file in files {
            txn.append_file(file.clone());
        }
        tracker::record_commit(txn.as_mut(), writer, epoch);
        txn.commit().map_err(|err| {
            if err.is_conflict() {
                tracing::debug!("Conflict committing epoch {epoch}: {err}");
                CommitError::TableCommitConflict(epoch)
            } else {
                CommitError::Table(err)
            }
        })
    }

    /// Random sleep of up to `commit_retry_backoff * attempt`.
    fn backoff(&self, attempt: u32) -> Duration {
        let max = self.config.commit_retry_backoff.saturating_mul(attempt);
        max.mul_f64(fastrand::f64())
    }
}

#[cfg(test)]
fn setup() -> (tempfile::TempDir, CommitCoordinator<crate::table::SqliteTable>) {
    use crate::table::SqliteTable;

    let dir = tempfile::tempdir().unwrap();
    let config = CommitterConfig::new("mem", WriterIdentity::from("job"))
        .with_manifest_dir(dir.path().join("pending"));
    let mut coord = CommitCoordinator::new(config, SqliteTable::open_in_memory().unwrap()).unwrap();
    coord.restore(None).unwrap();
    (dir, coord)
}

#[cfg(test)]
fn file(path: &str) -> DataFileDescriptor {
    DataFileDescriptor::new(path, FileFormat::Parquet, 10, 1)
}

#[test]
fn state_follows_lifecycle() {
    let (_dir, mut coord) = setup();
    assert_eq!(coord.state(), CoordinatorState::Idle);

    coord.record(file("a")).unwrap();
    assert_eq!(coord.state(), CoordinatorState::Accumulating);

    coord.snapshot(Epoch(1)).unwrap();
    assert_eq!(coord.state(), CoordinatorState::AwaitingCompletion);

    coord.record(file("b")).unwrap();
    assert_eq!(coord.state(), CoordinatorState::Accumulating);

    coord.notify_complete(Epoch(1)).unwrap();
    assert_eq!(coord.max_committed(), Some(Epoch(1)));
    assert_eq!(coord.state(), CoordinatorState::Accumulating);

    coord.end_of_input().unwrap();
    assert_eq!(coord.state(), CoordinatorState::Closed);
    assert_eq!(coord.max_committed(), Some(Epoch::TERMINAL));
}

#[test]
fn snapshot_rejects_stale_epochs() {
    let (_dir, mut coord) = setup();
    coord.record(file("a")).unwrap();
    coord.snapshot(Epoch(5)).unwrap();

    coord.record(file("b")).unwrap();
    assert!(matches!(
        coord.snapshot(Epoch(5)),
        Err(CommitError::InvalidTransition { .. })
    ));
    assert!(matches!(
        coord.snapshot(Epoch::TERMINAL),
        Err(CommitError::InvalidTransition { .. })
    ));
    // The rejected snapshot didn't lose the buffered file.
    assert_eq!(coord.state(), CoordinatorState::Accumulating);
    coord.snapshot(Epoch(6)).unwrap();
    assert_eq!(coord.commit_state().len(), 2);
}

#[test]
fn closed_rejects_everything_but_late_notifications() {
    let (_dir, mut coord) = setup();
    coord.end_of_input().unwrap();
    // Nothing was recorded so nothing was committed.
    assert_eq!(coord.max_committed(), None);

    assert!(matches!(
        coord.record(file("a")),
        Err(CommitError::InvalidTransition { .. })
    ));
    assert!(matches!(
        coord.snapshot(Epoch(1)),
        Err(CommitError::InvalidTransition { .. })
    ));
    assert!(matches!(
        coord.end_of_input(),
        Err(CommitError::InvalidTransition { .. })
    ));
    assert!(matches!(
        coord.restore(None),
        Err(CommitError::InvalidTransition { .. })
    ));
    coord.notify_complete(Epoch(1)).unwrap();
}

#[test]
fn notification_without_pending_is_noop() {
    let (_dir, mut coord) = setup();
    coord.notify_complete(Epoch(3)).unwrap();
    assert_eq!(coord.max_committed(), None);
    assert_eq!(coord.state(), CoordinatorState::Idle);
}
