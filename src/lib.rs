//! Exactly-once commit of streaming writer output into a snapshot
//! table.
//!
//! A streaming job writes immutable data files and needs them to show
//! up in a table exactly once, even though the job may crash between
//! any two steps and be restored from an older checkpoint. The
//! [`coordinator::CommitCoordinator`] does this with a two-phase,
//! epoch-based protocol:
//!
//! 1. Descriptors of written files are buffered per epoch.
//! 2. At a checkpoint barrier the epoch's files are made durable in a
//!    pending manifest, and a reference to it goes into the state the
//!    host checkpoints.
//! 3. When the host reports the checkpoint complete, the epoch is
//!    appended to the table as one snapshot that also records the
//!    writer's highest committed epoch. That marker is what makes
//!    replaying an epoch after a restore a no-op.
//!
//! Hosts drive a coordinator through [`host::CheckpointedSink`]. The
//! table is anything implementing [`table::Table`];
//! [`table::SqliteTable`] is a complete implementation.

pub mod accumulator;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod host;
pub mod manifest;
pub mod metrics;
pub mod model;
pub mod table;
pub mod tracing;
pub mod tracker;

pub use crate::config::CommitterConfig;
pub use crate::coordinator::CommitCoordinator;
pub use crate::coordinator::CoordinatorState;
pub use crate::errors::CommitError;
pub use crate::errors::CommitResult;
pub use crate::host::CheckpointedSink;
