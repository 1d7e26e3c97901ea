//! Identifiers for who is committing and which checkpoint cycle the
//! commit belongs to.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// One checkpoint / commit cycle of a writer.
///
/// Epochs only increase for a given [`WriterIdentity`], but they are
/// not globally unique: two writers will both happily start counting
/// at 1.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Epoch {
    /// Epoch used for the final commit when input is exhausted.
    ///
    /// Once a writer's marker is at this value no further commits
    /// from that writer can follow.
    pub const TERMINAL: Epoch = Epoch(u64::MAX);

    pub fn is_terminal(&self) -> bool {
        *self == Self::TERMINAL
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifies one incarnation of a writing pipeline.
///
/// Stable across restarts of the same deployed job and distinct
/// across independently started jobs. This is the key the
/// idempotency marker is stored under in table metadata, so it must
/// not contain characters that would be ambiguous in a file name.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriterIdentity(pub String);

impl WriterIdentity {
    /// A new random identity, formatted as 32 lowercase hex chars.
    pub fn generate() -> Self {
        Self(format!("{:016x}{:016x}", fastrand::u64(..), fastrand::u64(..)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WriterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WriterIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which parallel sub-task of the writer this instance is.
#[derive(
    Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TaskIndex(pub usize);

/// How many times the host has restarted this sub-task.
#[derive(
    Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct AttemptNumber(pub u32);

#[test]
fn none_sorts_below_epoch_zero() {
    assert!(None < Some(Epoch(0)));
    assert!(Some(Epoch(0)) < Some(Epoch::TERMINAL));
}

#[test]
fn generated_identities_are_hex_and_distinct() {
    let a = WriterIdentity::generate();
    let b = WriterIdentity::generate();
    assert_eq!(a.as_str().len(), 32);
    assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a, b);
}

#[test]
fn epoch_serde_tokens() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(
        &Epoch(7),
        &[Token::NewtypeStruct { name: "Epoch" }, Token::U64(7)],
    );
}
