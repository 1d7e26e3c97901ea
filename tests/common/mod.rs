#![allow(dead_code)]

use std::path::Path;
use std::path::PathBuf;

use tablecommit::model::DataFileDescriptor;
use tablecommit::model::FileFormat;
use tablecommit::model::WriterIdentity;
use tablecommit::table::SqliteTable;
use tablecommit::tracker::COMMIT_EPOCH_PROPERTY;
use tablecommit::tracker::WRITER_ID_PROPERTY;
use tablecommit::CommitCoordinator;
use tablecommit::CommitterConfig;

pub fn catalog(dir: &Path) -> PathBuf {
    dir.join("catalog.sqlite3")
}

/// A fresh connection to the test table, creating it if needed.
pub fn table(dir: &Path) -> SqliteTable {
    SqliteTable::init(&catalog(dir)).unwrap()
}

pub fn manifest_dir(dir: &Path) -> PathBuf {
    dir.join("pending")
}

pub fn config(dir: &Path, writer: &str) -> CommitterConfig {
    CommitterConfig::new(dir.display().to_string(), WriterIdentity::from(writer))
        .with_manifest_dir(manifest_dir(dir))
}

/// A coordinator on its own connection, as after a process start.
pub fn start(dir: &Path, writer: &str, blob: Option<&[u8]>) -> CommitCoordinator<SqliteTable> {
    start_with(config(dir, writer), dir, blob)
}

pub fn start_with(
    config: CommitterConfig,
    dir: &Path,
    blob: Option<&[u8]>,
) -> CommitCoordinator<SqliteTable> {
    let mut coord = CommitCoordinator::new(config, table(dir)).unwrap();
    coord.restore(blob).unwrap();
    coord
}

pub fn file(path: &str) -> DataFileDescriptor {
    DataFileDescriptor::new(path, FileFormat::Parquet, 1024, 10)
}

pub fn committed_paths(table: &SqliteTable) -> Vec<String> {
    table
        .data_files()
        .unwrap()
        .into_iter()
        .map(|file| file.path)
        .collect()
}

/// `(writer, epoch)` of every snapshot, oldest first.
pub fn commit_log(table: &SqliteTable) -> Vec<(String, String)> {
    table
        .snapshots()
        .unwrap()
        .into_iter()
        .map(|snap| {
            (
                snap.summary[WRITER_ID_PROPERTY].clone(),
                snap.summary[COMMIT_EPOCH_PROPERTY].clone(),
            )
        })
        .collect()
}

/// Finished manifest file names in the test manifest dir.
pub fn manifest_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(manifest_dir(dir))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".manifest"))
        .collect();
    names.sort();
    names
}
