//! Metrics for the engine and scheduler.
//!
//! Instruments are created from the global meter. Until
//! [`initialize_metrics`] installs the Prometheus-backed provider the
//! global meter is a no-op, so the engine can always record.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::Aggregation;
use opentelemetry_sdk::metrics::Instrument;
use opentelemetry_sdk::metrics::MeterProvider;
use opentelemetry_sdk::metrics::Stream;
use prometheus::default_registry;
use prometheus::Encoder;
use prometheus::TextEncoder;

use crate::engine::entity::ReactiveEntityKind;
use crate::engine::entity::Uri;
use crate::errors::EngineError;
use crate::errors::EngineResult;

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
pub fn initialize_metrics() -> EngineResult<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("rxqe")
        .build()
        .map_err(|err| EngineError::Config(err.to_string()))?;

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
            .map_err(|err| EngineError::Config(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Render everything in the default registry in the Prometheus text
/// format.
pub fn render_metrics() -> EngineResult<String> {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&default_registry().gather(), &mut buf)
        .map_err(|err| EngineError::Config(format!("error encoding metrics: {err}")))?;
    String::from_utf8(buf).map_err(|err| EngineError::Config(err.to_string()))
}

/// Instruments recorded by one engine instance.
pub struct EngineMetrics {
    entity_save_failed_count: Counter<u64>,
    entity_load_failed_count: Counter<u64>,
    entity_replay_failed_count: Counter<u64>,
    checkpoint_count: Counter<u64>,
    pub(crate) checkpoint_duration: Histogram<f64>,
    pub(crate) recovery_duration: Histogram<f64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl EngineMetrics {
    pub fn new(engine_uri: &Uri) -> Self {
        let meter = global::meter("rxqe");
        Self {
            entity_save_failed_count: meter
                .u64_counter("entity_save_failed_count")
                .with_description("number of entities that could not be checkpointed")
                .init(),
            entity_load_failed_count: meter
                .u64_counter("entity_load_failed_count")
                .with_description("number of entities that could not be recovered")
                .init(),
            entity_replay_failed_count: meter
                .u64_counter("entity_replay_failed_count")
                .with_description("number of logged operations that could not be replayed")
                .init(),
            checkpoint_count: meter
                .u64_counter("checkpoint_count")
                .with_description("number of checkpoints committed")
                .init(),
            checkpoint_duration: meter
                .f64_histogram("checkpoint_duration_seconds")
                .with_description("checkpoint duration in seconds")
                .init(),
            recovery_duration: meter
                .f64_histogram("recovery_duration_seconds")
                .with_description("recovery duration in seconds")
                .init(),
            labels: vec![KeyValue::new("engine_uri", engine_uri.to_string())],
        }
    }

    fn with_kind(&self, kind: ReactiveEntityKind) -> Vec<KeyValue> {
        let mut labels = self.labels.clone();
        labels.push(KeyValue::new("entity_kind", kind.to_string()));
        labels
    }

    pub(crate) fn save_failed(&self, kind: ReactiveEntityKind) {
        self.entity_save_failed_count.add(1, &self.with_kind(kind));
    }

    pub(crate) fn load_failed(&self, kind: ReactiveEntityKind) {
        self.entity_load_failed_count.add(1, &self.with_kind(kind));
    }

    pub(crate) fn replay_failed(&self, kind: ReactiveEntityKind) {
        self.entity_replay_failed_count
            .add(1, &self.with_kind(kind));
    }

    pub(crate) fn checkpoint_committed(&self) {
        self.checkpoint_count.add(1, &self.labels);
    }
}

/// Instruments recorded by a scheduler.
pub struct SchedulerMetrics {
    task_executed_count: Counter<u64>,
    pub(crate) task_duration: Histogram<f64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        let meter = global::meter("rxqe");
        Self {
            task_executed_count: meter
                .u64_counter("task_executed_count")
                .with_description("number of task quanta executed")
                .init(),
            task_duration: meter
                .f64_histogram("task_execute_duration_seconds")
                .with_description("task quantum duration in seconds")
                .init(),
            labels: Vec::new(),
        }
    }

    pub(crate) fn executed(&self) {
        self.task_executed_count.add(1, &self.labels);
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
