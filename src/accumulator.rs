//! Buffering of data files between epoch boundaries.

use crate::model::DataFileDescriptor;

/// Collects the descriptors received during the current epoch.
///
/// Lives only in memory; whatever is in here is lost on restart, so
/// it has to be drained into a pending commit before an epoch can be
/// acknowledged.
#[derive(Debug, Default)]
pub struct EpochAccumulator {
    files: Vec<DataFileDescriptor>,
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    pub fn add(&mut self, file: DataFileDescriptor) {
        self.files.push(file);
    }

    /// Take everything buffered so far, leaving this empty.
    pub fn drain_and_reset(&mut self) -> Vec<DataFileDescriptor> {
        std::mem::take(&mut self.files)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total records across buffered files.
    pub fn record_count(&self) -> u64 {
        self.files.iter().map(|f| f.record_count).sum()
    }
}

#[test]
fn drain_returns_in_arrival_order_and_resets() {
    use crate::model::FileFormat;

    let mut acc = EpochAccumulator::new();
    assert!(acc.drain_and_reset().is_empty());

    acc.add(DataFileDescriptor::new("a", FileFormat::Avro, 1, 2));
    acc.add(DataFileDescriptor::new("b", FileFormat::Avro, 1, 3));
    assert_eq!(acc.len(), 2);
    assert_eq!(acc.record_count(), 5);

    let drained: Vec<_> = acc.drain_and_reset().into_iter().map(|f| f.path).collect();
    assert_eq!(drained, vec!["a", "b"]);
    assert!(acc.is_empty());
    assert_eq!(acc.record_count(), 0);
}
