//! The data model for committing.
//!
//! [`epoch`] holds the identifiers, [`data_file`] what upstream
//! writers hand us, and [`state`] the checkpointed coordinator state
//! built on top of both.

pub mod data_file;
pub mod epoch;
pub mod state;

// Re-export so you can get the whole model at once.

pub use data_file::*;
pub use epoch::*;
pub use state::*;
