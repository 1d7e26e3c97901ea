//! Checkpointed state of the commit coordinator.
//!
//! This is what the host persists for us on every checkpoint and
//! hands back on restore. It has to be enough to finish every epoch
//! that was snapshotted but never confirmed committed.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use super::data_file::DataFileDescriptor;
use super::epoch::Epoch;
use super::epoch::WriterIdentity;
use crate::errors::CommitError;
use crate::errors::CommitResult;

/// Version tag written into every serialized [`CommitState`].
const STATE_FORMAT_VERSION: u32 = 1;

/// Pointer to a durable pending manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRef {
    pub path: PathBuf,
    pub data_file_count: usize,
    pub record_count: u64,
}

/// Where the files of a pending epoch can be found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingLocation {
    /// Files carried in the state itself.
    ///
    /// Only used for the terminal flush at end of input, which is
    /// committed immediately and never needs recovering from disk.
    Inline(Vec<DataFileDescriptor>),
    /// Files listed in a pending manifest.
    Reference(ManifestRef),
}

impl PendingLocation {
    pub fn manifest(&self) -> Option<&ManifestRef> {
        match self {
            PendingLocation::Inline(_) => None,
            PendingLocation::Reference(manifest) => Some(manifest),
        }
    }
}

/// An epoch that has been staged but not yet confirmed committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommit {
    pub epoch: Epoch,
    pub location: PendingLocation,
}

/// The durable state of one coordinator.
///
/// Pending epochs are kept in a map keyed by epoch so iteration is
/// always ascending. New epochs can only be added above the current
/// maximum; entries leave only when their commit (or skip) has
/// succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitState {
    writer: WriterIdentity,
    pending: BTreeMap<Epoch, PendingLocation>,
}

/// On-the-wire shape of [`CommitState`].
#[derive(Serialize, Deserialize)]
struct SerializedState {
    version: u32,
    writer: WriterIdentity,
    pending: Vec<PendingCommit>,
}

impl CommitState {
    pub fn new(writer: WriterIdentity) -> Self {
        Self {
            writer,
            pending: BTreeMap::new(),
        }
    }

    pub fn writer(&self) -> &WriterIdentity {
        &self.writer
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Highest staged epoch, if any.
    pub fn max_epoch(&self) -> Option<Epoch> {
        self.pending.keys().next_back().copied()
    }

    /// Stage a new epoch.
    ///
    /// Fails if `epoch` is not above every epoch already staged.
    pub fn push(&mut self, epoch: Epoch, location: PendingLocation) -> CommitResult<()> {
        if let Some(max) = self.max_epoch() {
            if epoch <= max {
                return Err(CommitError::InvalidTransition {
                    op: "stage epoch",
                    state: format!("already holding epoch {max}, got {epoch}"),
                });
            }
        }
        self.pending.insert(epoch, location);
        Ok(())
    }

    pub fn get(&self, epoch: &Epoch) -> Option<&PendingLocation> {
        self.pending.get(epoch)
    }

    pub fn remove(&mut self, epoch: &Epoch) -> Option<PendingLocation> {
        self.pending.remove(epoch)
    }

    /// All staged epochs `<= up_to`, ascending.
    pub fn epochs_through(&self, up_to: Epoch) -> Vec<Epoch> {
        self.pending.range(..=up_to).map(|(epoch, _)| *epoch).collect()
    }

    /// Serialize into the opaque blob the host checkpoints.
    pub fn to_bytes(&self) -> CommitResult<Vec<u8>> {
        let ser = SerializedState {
            version: STATE_FORMAT_VERSION,
            writer: self.writer.clone(),
            pending: self
                .pending
                .iter()
                .map(|(epoch, location)| PendingCommit {
                    epoch: *epoch,
                    location: location.clone(),
                })
                .collect(),
        };
        serde_json::to_vec(&ser).map_err(|err| CommitError::State(err.to_string()))
    }

    /// Inverse of [`Self::to_bytes`].
    ///
    /// Rejects unknown versions and blobs whose epochs are not
    /// strictly increasing.
    pub fn from_bytes(bytes: &[u8]) -> CommitResult<Self> {
        let ser: SerializedState =
            serde_json::from_slice(bytes).map_err(|err| CommitError::State(err.to_string()))?;
        if ser.version != STATE_FORMAT_VERSION {
            return Err(CommitError::State(format!(
                "unsupported commit state version {}",
                ser.version
            )));
        }

        let mut state = Self::new(ser.writer);
        for PendingCommit { epoch, location } in ser.pending {
            state
                .push(epoch, location)
                .map_err(|err| CommitError::State(err.to_string()))?;
        }
        Ok(state)
    }
}

#[cfg(test)]
fn manifest(name: &str) -> PendingLocation {
    PendingLocation::Reference(ManifestRef {
        path: PathBuf::from(name),
        data_file_count: 1,
        record_count: 3,
    })
}

#[test]
fn push_rejects_non_increasing_epochs() {
    let mut state = CommitState::new(WriterIdentity::from("job"));
    state.push(Epoch(2), manifest("a")).unwrap();
    assert!(state.push(Epoch(2), manifest("b")).is_err());
    assert!(state.push(Epoch(1), manifest("b")).is_err());
    state.push(Epoch(5), manifest("c")).unwrap();
    assert_eq!(state.max_epoch(), Some(Epoch(5)));
}

#[test]
fn epochs_through_is_inclusive_and_ordered() {
    let mut state = CommitState::new(WriterIdentity::from("job"));
    state.push(Epoch(1), manifest("a")).unwrap();
    state.push(Epoch(3), manifest("b")).unwrap();
    state.push(Epoch(4), manifest("c")).unwrap();
    assert_eq!(state.epochs_through(Epoch(3)), vec![Epoch(1), Epoch(3)]);
    assert!(state.epochs_through(Epoch(0)).is_empty());
}

#[test]
fn bytes_restore_verbatim() {
    let mut state = CommitState::new(WriterIdentity::from("job"));
    state.push(Epoch(1), manifest("a")).unwrap();
    state
        .push(Epoch::TERMINAL, PendingLocation::Inline(Vec::new()))
        .unwrap();
    let restored = CommitState::from_bytes(&state.to_bytes().unwrap()).unwrap();
    assert_eq!(restored, state);
}

#[test]
fn from_bytes_rejects_out_of_order_blob() {
    let blob = br#"{"version":1,"writer":"job","pending":[
        {"epoch":2,"location":{"Inline":[]}},
        {"epoch":1,"location":{"Inline":[]}}]}"#;
    assert!(matches!(
        CommitState::from_bytes(blob),
        Err(CommitError::State(_))
    ));
}

#[test]
fn from_bytes_rejects_unknown_version() {
    let blob = br#"{"version":9,"writer":"job","pending":[]}"#;
    assert!(matches!(
        CommitState::from_bytes(blob),
        Err(CommitError::State(_))
    ));
}
