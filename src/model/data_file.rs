//! Descriptors of data files produced by upstream writers.
//!
//! We never look inside a data file. Everything the table format
//! needs to register it is carried in the descriptor, and we only
//! transport, persist and list these.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Physical encoding of a data file.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Parquet,
    Avro,
    Orc,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Parquet => "parquet",
            FileFormat::Avro => "avro",
            FileFormat::Orc => "orc",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Per-column statistics the table format uses for pruning.
///
/// Bounds are kept as the table format's single-value binary
/// serialization; we don't interpret them.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub null_value_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<Vec<u8>>,
}

/// An already-written, immutable data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileDescriptor {
    pub path: String,
    pub format: FileFormat,
    pub file_size_in_bytes: u64,
    pub record_count: u64,
    /// Partition field name to partition value, in partition spec
    /// order.
    #[serde(default)]
    pub partition: BTreeMap<String, String>,
    /// Column field ID to stats.
    #[serde(default)]
    pub column_stats: BTreeMap<i32, ColumnStats>,
}

impl DataFileDescriptor {
    /// Describe an unpartitioned file with no column stats.
    pub fn new(
        path: impl Into<String>,
        format: FileFormat,
        file_size_in_bytes: u64,
        record_count: u64,
    ) -> Self {
        Self {
            path: path.into(),
            format,
            file_size_in_bytes,
            record_count,
            partition: BTreeMap::new(),
            column_stats: BTreeMap::new(),
        }
    }

    pub fn with_partition(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.partition.insert(field.into(), value.into());
        self
    }

    pub fn with_column_stats(mut self, field_id: i32, stats: ColumnStats) -> Self {
        self.column_stats.insert(field_id, stats);
        self
    }
}

#[test]
fn descriptor_json_omits_empty_stats() {
    let file = DataFileDescriptor::new("s3://bucket/t/data-1.parquet", FileFormat::Parquet, 10, 2)
        .with_column_stats(
            1,
            ColumnStats {
                value_count: Some(2),
                ..Default::default()
            },
        );
    let json = serde_json::to_string(&file).unwrap();
    assert!(json.contains(r#""format":"parquet""#), "{json}");
    assert!(json.contains(r#""value_count":2"#), "{json}");
    assert!(!json.contains("lower_bound"), "{json}");
    let back: DataFileDescriptor = serde_json::from_str(&json).unwrap();
    assert_eq!(back, file);
}
