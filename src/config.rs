//! Configuration of a commit coordinator.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::CommitError;
use crate::errors::CommitResult;
use crate::model::AttemptNumber;
use crate::model::TaskIndex;
use crate::model::WriterIdentity;

/// Where pending manifests go when no directory is configured,
/// relative to the table location.
pub const DEFAULT_MANIFEST_SUBDIR: &str = "metadata/pending-manifests";

/// Configuration settings for one writer task's coordinator.
///
/// Args:
///
///   table_location: Location of the target table. Only used to
///       derive the default manifest directory and for logging.
///
///   writer: Identity this job commits under. Must be stable across
///       restarts of the same job and distinct between jobs.
///
///   manifest_dir: Directory for pending manifests. Defaults to
///       `<table_location>/metadata/pending-manifests`. Many writers
///       may share one directory.
///
///   delete_manifests_on_commit: Remove a pending manifest once its
///       epoch is committed. Defaults to true. Turning this off
///       leaves an audit trail for external cleanup tooling.
///
///   max_commit_retries: How many extra attempts a commit gets after
///       losing a race with a concurrent writer. Defaults to 4.
///
///   commit_retry_backoff: Base sleep between conflicting attempts;
///       each attempt sleeps a random duration up to base *
///       attempt. Defaults to 100ms.
///
///   task_index, attempt: Position of this instance within the job;
///       used only in manifest file names.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitterConfig {
    pub table_location: String,
    pub writer: WriterIdentity,
    #[serde(default)]
    pub manifest_dir: Option<PathBuf>,
    #[serde(default = "default_delete_manifests")]
    pub delete_manifests_on_commit: bool,
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,
    #[serde(default = "default_commit_retry_backoff", with = "millis")]
    pub commit_retry_backoff: Duration,
    #[serde(default)]
    pub task_index: TaskIndex,
    #[serde(default)]
    pub attempt: AttemptNumber,
}

fn default_delete_manifests() -> bool {
    true
}

fn default_max_commit_retries() -> u32 {
    4
}

fn default_commit_retry_backoff() -> Duration {
    Duration::from_millis(100)
}

/// `Duration` as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl CommitterConfig {
    pub fn new(table_location: impl Into<String>, writer: WriterIdentity) -> Self {
        Self {
            table_location: table_location.into(),
            writer,
            manifest_dir: None,
            delete_manifests_on_commit: default_delete_manifests(),
            max_commit_retries: default_max_commit_retries(),
            commit_retry_backoff: default_commit_retry_backoff(),
            task_index: TaskIndex::default(),
            attempt: AttemptNumber::default(),
        }
    }

    /// Parse a JSON config document.
    pub fn from_json(json: &str) -> CommitResult<Self> {
        serde_json::from_str(json).map_err(|err| CommitError::Config(err.to_string()))
    }

    pub fn with_manifest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.manifest_dir = Some(dir.into());
        self
    }

    pub fn with_delete_manifests_on_commit(mut self, delete: bool) -> Self {
        self.delete_manifests_on_commit = delete;
        self
    }

    pub fn with_max_commit_retries(mut self, retries: u32) -> Self {
        self.max_commit_retries = retries;
        self
    }

    pub fn with_commit_retry_backoff(mut self, backoff: Duration) -> Self {
        self.commit_retry_backoff = backoff;
        self
    }

    pub fn with_task(mut self, task_index: TaskIndex, attempt: AttemptNumber) -> Self {
        self.task_index = task_index;
        self.attempt = attempt;
        self
    }

    /// The directory pending manifests are written to.
    pub fn manifest_dir(&self) -> PathBuf {
        self.manifest_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.table_location).join(DEFAULT_MANIFEST_SUBDIR))
    }
}

#[test]
fn json_defaults() {
    let config =
        CommitterConfig::from_json(r#"{"table_location": "/wh/db/t", "writer": "job-1"}"#).unwrap();
    assert_eq!(config.writer, WriterIdentity::from("job-1"));
    assert!(config.delete_manifests_on_commit);
    assert_eq!(config.max_commit_retries, 4);
    assert_eq!(config.commit_retry_backoff, Duration::from_millis(100));
    assert_eq!(
        config.manifest_dir(),
        PathBuf::from("/wh/db/t/metadata/pending-manifests")
    );
}

#[test]
fn json_overrides() {
    let config = CommitterConfig::from_json(
        r#"{
            "table_location": "/wh/db/t",
            "writer": "job-1",
            "manifest_dir": "/tmp/manifests",
            "delete_manifests_on_commit": false,
            "max_commit_retries": 0,
            "commit_retry_backoff": 5,
            "task_index": 3,
            "attempt": 1
        }"#,
    )
    .unwrap();
    assert_eq!(config.manifest_dir(), PathBuf::from("/tmp/manifests"));
    assert!(!config.delete_manifests_on_commit);
    assert_eq!(config.max_commit_retries, 0);
    assert_eq!(config.commit_retry_backoff, Duration::from_millis(5));
    assert_eq!(config.task_index, TaskIndex(3));
    assert_eq!(config.attempt, AttemptNumber(1));
}

#[test]
fn json_rejects_typos() {
    assert!(matches!(
        CommitterConfig::from_json(r#"{"table_location": "t", "writer": "j", "retries": 1}"#),
        Err(CommitError::Config(_))
    ));
}
