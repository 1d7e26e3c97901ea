//! Metrics for the commit path.
//!
//! Instruments are created on the global OpenTelemetry meter; until
//! [`initialize_metrics`] is called that meter is a no-op, so hosts
//! that don't care about metrics pay nothing.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::Aggregation;
use opentelemetry_sdk::metrics::Instrument;
use opentelemetry_sdk::metrics::MeterProvider;
use opentelemetry_sdk::metrics::Stream;
use prometheus::default_registry;
use prometheus::TextEncoder;

use crate::errors::CommitError;
use crate::errors::CommitResult;
use crate::model::TaskIndex;
use crate::model::WriterIdentity;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> CommitResult<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("tablecommit")
        .build()
        .map_err(|err| CommitError::Metrics(err.to_string()))?;

    // Create a global MeterProvider
    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| CommitError::Metrics(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Render everything in the default Prometheus registry in the text
/// exposition format, for the host to serve.
pub fn render() -> CommitResult<String> {
    TextEncoder::new()
        .encode_to_string(&default_registry().gather())
        .map_err(|err| CommitError::Metrics(err.to_string()))
}

/// Instruments for one coordinator.
pub(crate) struct CommitMetrics {
    pub(crate) labels: Vec<KeyValue>,
    epochs_committed: Counter<u64>,
    epochs_skipped: Counter<u64>,
    data_files_committed: Counter<u64>,
    commit_conflicts: Counter<u64>,
    manifest_delete_failures: Counter<u64>,
    pub(crate) epoch_commit_duration: Histogram<f64>,
    pub(crate) manifest_write_duration: Histogram<f64>,
}

impl CommitMetrics {
    pub(crate) fn new(writer: &WriterIdentity, task: TaskIndex) -> Self {
        let meter = global::meter("tablecommit");
        Self {
            labels: vec![
                KeyValue::new("writer", writer.to_string()),
                KeyValue::new("task_index", task.0.to_string()),
            ],
            epochs_committed: meter
                .u64_counter("epochs_committed")
                .with_description("number of epochs published as a table snapshot")
                .init(),
            epochs_skipped: meter
                .u64_counter("epochs_skipped")
                .with_description("number of epochs found already committed and skipped")
                .init(),
            data_files_committed: meter
                .u64_counter("data_files_committed")
                .with_description("number of data files published to the table")
                .init(),
            commit_conflicts: meter
                .u64_counter("commit_conflicts")
                .with_description("number of table commits lost to a concurrent writer")
                .init(),
            manifest_delete_failures: meter
                .u64_counter("manifest_delete_failures")
                .with_description("number of pending manifests that could not be removed")
                .init(),
            epoch_commit_duration: meter
                .f64_histogram("epoch_commit_duration_seconds")
                .with_description("duration of committing one epoch in seconds")
                .init(),
            manifest_write_duration: meter
                .f64_histogram("manifest_write_duration_seconds")
                .with_description("duration of durably writing a pending manifest in seconds")
                .init(),
        }
    }

    pub(crate) fn committed(&self, data_files: usize) {
        self.epochs_committed.add(1, &self.labels);
        self.data_files_committed
            .add(data_files as u64, &self.labels);
    }

    pub(crate) fn skipped(&self) {
        self.epochs_skipped.add(1, &self.labels);
    }

    pub(crate) fn conflict(&self) {
        self.commit_conflicts.add(1, &self.labels);
    }

    pub(crate) fn delete_failed(&self) {
        self.manifest_delete_failures.add(1, &self.labels);
    }
}

#[test]
fn commits_show_up_in_rendered_metrics() {
    use crate::config::CommitterConfig;
    use crate::coordinator::CommitCoordinator;
    use crate::model::DataFileDescriptor;
    use crate::model::Epoch;
    use crate::model::FileFormat;
    use crate::table::SqliteTable;

    initialize_metrics().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = CommitterConfig::new("mem", WriterIdentity::from("metered-job"))
        .with_manifest_dir(dir.path());
    let mut coord = CommitCoordinator::new(config, SqliteTable::open_in_memory().unwrap()).unwrap();
    coord.restore(None).unwrap();
    coord
        .record(DataFileDescriptor::new("a.parquet", FileFormat::Parquet, 10, 1))
        .unwrap();
    coord.snapshot(Epoch(1)).unwrap();
    coord.notify_complete(Epoch(1)).unwrap();

    let text = render().unwrap();
    assert!(text.contains("tablecommit_epochs_committed"), "{text}");
    assert!(text.contains("metered-job"), "{text}");
}
