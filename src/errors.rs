//! Error types for the commit coordinator.
//!
//! Everything a host can see comes out as a [`CommitError`]. The
//! taxonomy follows what the host is expected to do about it:
//! manifest write failures and corrupt manifests fail the current
//! checkpoint, table conflicts are retried locally until the retry
//! budget runs out, and manifest delete failures never surface at
//! all (they are logged where they happen).

use std::panic::Location;
use std::path::PathBuf;

use thiserror::Error;

use crate::manifest::codec::CodecError;
use crate::model::Epoch;
use crate::table::TableError;

/// Result type used throughout the crate.
pub type CommitResult<T> = Result<T, CommitError>;

#[derive(Error, Debug)]
pub enum CommitError {
    /// The pending manifest for an epoch could not be made durable.
    ///
    /// The epoch's files are still in the caller's hands; the host
    /// must fail the checkpoint rather than acknowledge it.
    #[error("error writing pending manifest {path:?}: {source}")]
    ManifestWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A pending manifest exists (or should exist) but its contents
    /// can't be turned back into a file list.
    #[error("pending manifest {path:?} is unreadable: {reason}")]
    CorruptManifest { path: PathBuf, reason: String },

    /// The table moved on underneath an append.
    ///
    /// Only used as a retry signal inside the coordinator.
    #[error("concurrent table modification while committing epoch {0}")]
    TableCommitConflict(Epoch),

    #[error("gave up committing epoch {epoch} after {attempts} conflicting attempts")]
    RetriesExhausted { epoch: Epoch, attempts: u32 },

    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// A checkpointed commit state blob could not be decoded.
    #[error("invalid commit state: {0}")]
    State(String),

    #[error("invalid committer config: {0}")]
    Config(String),

    #[error("metrics setup failed: {0}")]
    Metrics(String),

    #[error("can't {op} while coordinator is {state}")]
    InvalidTransition { op: &'static str, state: String },

    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<CommitError>,
    },
}

impl CommitError {
    /// Is this a retryable concurrent-modification failure?
    pub fn is_conflict(&self) -> bool {
        match self {
            CommitError::TableCommitConflict(_) => true,
            CommitError::Table(err) => err.is_conflict(),
            CommitError::Context { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// Strip off any [`CommitError::Context`] wrappers.
    pub fn root(&self) -> &CommitError {
        match self {
            CommitError::Context { source, .. } => source.root(),
            err => err,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, err: CodecError) -> Self {
        CommitError::CorruptManifest {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

/// Add call-site context to a failing [`CommitResult`].
///
/// Example:
///     store.read(&manifest).reraise("error reading pending manifest")?;
pub trait ResultExt<T> {
    #[track_caller]
    fn reraise(self, msg: &str) -> CommitResult<T>;

    #[track_caller]
    fn reraise_with(self, msg: impl FnOnce() -> String) -> CommitResult<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<CommitError>,
{
    #[track_caller]
    fn reraise(self, msg: &str) -> CommitResult<T> {
        let caller = Location::caller();
        self.map_err(|err| CommitError::Context {
            context: prepend_caller(caller, msg),
            source: Box::new(err.into()),
        })
    }

    #[track_caller]
    fn reraise_with(self, msg: impl FnOnce() -> String) -> CommitResult<T> {
        let caller = Location::caller();
        self.map_err(|err| CommitError::Context {
            context: prepend_caller(caller, &msg()),
            source: Box::new(err.into()),
        })
    }
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

#[test]
fn reraise_keeps_root_and_location() {
    let res: Result<(), TableError> = Err(TableError::Conflict {
        expected: None,
        found: None,
    });
    let err = res.reraise("committing").unwrap_err();
    assert!(err.is_conflict());
    assert!(matches!(err.root(), CommitError::Table(_)));
    let msg = err.to_string();
    assert!(msg.contains("errors.rs"), "{msg}");
    assert!(msg.ends_with("committing"), "{msg}");
}
