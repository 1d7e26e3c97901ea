//! Lifecycle of pending manifest files on durable storage.
//!
//! One manifest is written per non-empty epoch. File names encode
//! the writer identity, task, attempt, epoch and a per-store
//! sequence number so that any number of writers can share one
//! directory, and so that leftovers from unrelated runs can be told
//! apart by cleanup tooling.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::fs::File;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use crate::errors::CommitError;
use crate::errors::CommitResult;
use crate::manifest::codec;
use crate::model::*;

/// Extension of finished manifest files.
pub const MANIFEST_EXT: &str = "manifest";

const TMP_EXT: &str = "tmp";

/// The parsed name of a pending manifest file.
///
/// Formats as `<writer>-<task:05>-<attempt>-<epoch>-<sequence:05>`,
/// without the extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestName {
    pub writer: WriterIdentity,
    pub task: TaskIndex,
    pub attempt: AttemptNumber,
    pub epoch: Epoch,
    pub sequence: u64,
}

impl ManifestName {
    pub fn file_name(&self) -> String {
        format!("{self}.{MANIFEST_EXT}")
    }

    /// Parse a manifest file name.
    ///
    /// Returns [`None`] for anything that is not a finished manifest,
    /// including in-flight temp files. The writer identity is taken
    /// to be everything before the last four `-` separated fields so
    /// identities may themselves contain `-`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(&format!(".{MANIFEST_EXT}"))?;
        let mut fields = stem.rsplitn(5, '-');
        let sequence = fields.next()?.parse().ok()?;
        let epoch = Epoch(fields.next()?.parse().ok()?);
        let attempt = AttemptNumber(fields.next()?.parse().ok()?);
        let task = TaskIndex(fields.next()?.parse().ok()?);
        let writer = fields.next().filter(|w| !w.is_empty())?;
        Some(Self {
            writer: WriterIdentity::from(writer),
            task,
            attempt,
            epoch,
            sequence,
        })
    }
}

impl fmt::Display for ManifestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:05}-{}-{}-{:05}",
            self.writer, self.task.0, self.attempt.0, self.epoch, self.sequence
        )
    }
}

/// Reads and writes pending manifests in one directory for one
/// writer task.
#[derive(Debug)]
pub struct ManifestStore {
    dir: PathBuf,
    writer: WriterIdentity,
    task: TaskIndex,
    attempt: AttemptNumber,
    /// Sequence number the next written manifest gets.
    next_sequence: u64,
}

impl ManifestStore {
    /// Open a store, creating the directory if needed.
    pub fn open(
        dir: impl Into<PathBuf>,
        writer: WriterIdentity,
        task: TaskIndex,
        attempt: AttemptNumber,
    ) -> CommitResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CommitError::ManifestWrite {
            path: dir.clone(),
            source,
        })?;
        tracing::debug!("Opened pending manifest dir {dir:?} for {writer} task {task:?}");
        Ok(Self {
            dir,
            writer,
            task,
            attempt,
            next_sequence: 1,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably write the files of `epoch` to a new manifest.
    ///
    /// The returned [`ManifestRef`] only exists once the file and its
    /// directory entry are synced. On any failure the temp file is
    /// cleaned up and nothing is referenced.
    pub fn write(&mut self, epoch: Epoch, files: &[DataFileDescriptor]) -> CommitResult<ManifestRef> {
        let name = ManifestName {
            writer: self.writer.clone(),
            task: self.task,
            attempt: self.attempt,
            epoch,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;

        let path = self.dir.join(name.file_name());
        let tmp_path = path.with_extension(format!("{MANIFEST_EXT}.{TMP_EXT}"));

        let res = codec::encode(files)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
            .and_then(|bytes| write_synced(&tmp_path, &bytes))
            .and_then(|()| fs::rename(&tmp_path, &path))
            .and_then(|()| sync_dir(&self.dir));
        if let Err(source) = res {
            // Might not exist if we failed before creating it.
            let _ = fs::remove_file(&tmp_path);
            return Err(CommitError::ManifestWrite { path, source });
        }

        let manifest = ManifestRef {
            path,
            data_file_count: files.len(),
            record_count: files.iter().map(|f| f.record_count).sum(),
        };
        tracing::trace!("Wrote pending manifest {manifest:?}");
        Ok(manifest)
    }

    /// Read back the files listed in a manifest.
    pub fn read(&self, manifest: &ManifestRef) -> CommitResult<Vec<DataFileDescriptor>> {
        let bytes = fs::read(&manifest.path).map_err(|err| CommitError::CorruptManifest {
            path: manifest.path.clone(),
            reason: err.to_string(),
        })?;
        let files = codec::decode(&bytes).map_err(|err| CommitError::corrupt(&manifest.path, err))?;
        if files.len() != manifest.data_file_count {
            return Err(CommitError::CorruptManifest {
                path: manifest.path.clone(),
                reason: format!(
                    "expected {} data files, found {}",
                    manifest.data_file_count,
                    files.len()
                ),
            });
        }
        Ok(files)
    }

    /// Remove a manifest that is no longer needed.
    ///
    /// Returns whether the file is gone. A leftover manifest only
    /// costs storage since its epoch has already been committed, so
    /// failures are just logged.
    pub fn delete(&self, manifest: &ManifestRef) -> bool {
        match fs::remove_file(&manifest.path) {
            Ok(()) => {
                tracing::trace!("Deleted pending manifest {:?}", manifest.path);
                true
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(err) => {
                tracing::warn!(
                    "Unable to delete pending manifest {:?}; it will need manual cleanup: {err}",
                    manifest.path
                );
                false
            }
        }
    }

    /// List finished manifests in this store's directory, sorted by
    /// epoch then sequence.
    ///
    /// Pass a writer to only see that writer's manifests.
    pub fn list(&self, writer: Option<&WriterIdentity>) -> io::Result<Vec<ManifestName>> {
        list_dir(&self.dir, writer)
    }
}

/// List finished manifests in any directory.
///
/// Usable by cleanup tooling that doesn't own a [`ManifestStore`].
pub fn list_dir(dir: &Path, writer: Option<&WriterIdentity>) -> io::Result<Vec<ManifestName>> {
    let manifest_ext = OsStr::new(MANIFEST_EXT);
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension() != Some(manifest_ext) {
            continue;
        }
        let parsed = path
            .file_name()
            .and_then(OsStr::to_str)
            .and_then(ManifestName::parse);
        match parsed {
            Some(name) if writer.map_or(true, |w| *w == name.writer) => names.push(name),
            Some(_) => {}
            None => tracing::trace!("Ignoring unrecognized file {path:?} in manifest dir"),
        }
    }
    names.sort_by_key(|name| (name.epoch, name.sequence));
    Ok(names)
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Make a rename in `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[test]
fn name_formats_and_parses() {
    let name = ManifestName {
        writer: WriterIdentity::from("3f2a"),
        task: TaskIndex(0),
        attempt: AttemptNumber(0),
        epoch: Epoch(10),
        sequence: 1,
    };
    assert_eq!(name.file_name(), "3f2a-00000-0-10-00001.manifest");
    assert_eq!(ManifestName::parse(&name.file_name()), Some(name));
}

#[test]
fn name_parse_allows_dashed_writer() {
    let name = ManifestName::parse("my-job-00003-2-18446744073709551615-00012.manifest").unwrap();
    assert_eq!(name.writer, WriterIdentity::from("my-job"));
    assert_eq!(name.task, TaskIndex(3));
    assert_eq!(name.attempt, AttemptNumber(2));
    assert_eq!(name.epoch, Epoch::TERMINAL);
    assert_eq!(name.sequence, 12);
}

#[test]
fn name_parse_rejects_others() {
    assert_eq!(ManifestName::parse("job-00000-0-1-00001.manifest.tmp"), None);
    assert_eq!(ManifestName::parse("00000-0-1-00001.manifest"), None);
    assert_eq!(ManifestName::parse("job-x-0-1-00001.manifest"), None);
    assert_eq!(ManifestName::parse("data-1.parquet"), None);
}

#[test]
fn write_read_delete() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = ManifestStore::open(
        dir.path().join("pending"),
        WriterIdentity::from("job"),
        TaskIndex(1),
        AttemptNumber(0),
    )
    .unwrap();
    let files = vec![DataFileDescriptor::new("a.parquet", FileFormat::Parquet, 5, 3)];

    let first = store.write(Epoch(1), &files).unwrap();
    let second = store.write(Epoch(2), &files).unwrap();
    assert_eq!(first.record_count, 3);
    assert_eq!(
        second.path.file_name().unwrap(),
        "job-00001-0-2-00002.manifest"
    );
    assert_eq!(store.read(&first).unwrap(), files);

    let listed: Vec<_> = store.list(None).unwrap().into_iter().map(|n| n.epoch).collect();
    assert_eq!(listed, vec![Epoch(1), Epoch(2)]);

    assert!(store.delete(&first));
    // Deleting twice is fine.
    assert!(store.delete(&first));
    assert_eq!(store.list(None).unwrap().len(), 1);
    assert!(matches!(
        store.read(&first),
        Err(CommitError::CorruptManifest { .. })
    ));
}

#[test]
fn list_filters_by_writer() {
    let dir = tempfile::tempdir().unwrap();
    let files = vec![DataFileDescriptor::new("a.parquet", FileFormat::Parquet, 5, 3)];
    let mut a = ManifestStore::open(
        dir.path(),
        WriterIdentity::from("a"),
        TaskIndex(0),
        AttemptNumber(0),
    )
    .unwrap();
    let mut b = ManifestStore::open(
        dir.path(),
        WriterIdentity::from("b"),
        TaskIndex(0),
        AttemptNumber(0),
    )
    .unwrap();
    a.write(Epoch(1), &files).unwrap();
    b.write(Epoch(1), &files).unwrap();
    fs::write(dir.path().join("README"), "not a manifest").unwrap();

    assert_eq!(list_dir(dir.path(), None).unwrap().len(), 2);
    let only_b = list_dir(dir.path(), Some(&WriterIdentity::from("b"))).unwrap();
    assert_eq!(only_b.len(), 1);
    assert_eq!(only_b[0].writer, WriterIdentity::from("b"));
}

#[test]
fn read_reports_count_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = ManifestStore::open(
        dir.path(),
        WriterIdentity::from("job"),
        TaskIndex(0),
        AttemptNumber(0),
    )
    .unwrap();
    let files = vec![DataFileDescriptor::new("a.parquet", FileFormat::Parquet, 5, 3)];
    let mut manifest = store.write(Epoch(1), &files).unwrap();
    manifest.data_file_count = 2;
    assert!(matches!(
        store.read(&manifest),
        Err(CommitError::CorruptManifest { .. })
    ));
}
