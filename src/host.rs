//! The callbacks a stream runtime drives a sink with.
//!
//! The runtime guarantees these are called from one thread, that
//! [`CheckpointedSink::initialize_state`] comes first, and that the
//! bytes returned by [`CheckpointedSink::snapshot_state`] for an
//! epoch are persisted before that epoch is reported complete. It
//! does not guarantee completion notifications arrive in order, or
//! at all.

use crate::errors::CommitResult;
use crate::model::DataFileDescriptor;
use crate::model::Epoch;

pub trait CheckpointedSink {
    /// Called once at start, with the state of the last successful
    /// checkpoint if there is one.
    fn initialize_state(&mut self, state: Option<&[u8]>) -> CommitResult<()>;

    fn process_element(&mut self, file: DataFileDescriptor) -> CommitResult<()>;

    /// Checkpoint barrier for `epoch` reached this sink. The returned
    /// bytes must be stored as part of the checkpoint.
    fn snapshot_state(&mut self, epoch: Epoch) -> CommitResult<Vec<u8>>;

    /// The checkpoint for `epoch`, and so every earlier one, is
    /// durable.
    fn notify_checkpoint_complete(&mut self, epoch: Epoch) -> CommitResult<()>;

    /// The input is bounded and has been fully consumed.
    fn end_input(&mut self) -> CommitResult<()>;
}
