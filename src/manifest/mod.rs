//! Pending manifests: the side-log of staged, not yet committed
//! epochs.
//!
//! [`codec`] is the on-disk format, [`store`] manages files in the
//! manifest directory.

pub mod codec;
pub mod store;

pub use store::list_dir;
pub use store::ManifestName;
pub use store::ManifestStore;
