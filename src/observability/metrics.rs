//! OpenTelemetry metrics.
//!
//! Key metrics:
//! - parkline_broadcast_total: broadcasts per topic
//! - parkline_delivery_total: messages handed to a transport
//! - parkline_skipped_total: subscribers a broadcast could not resume
//! - parkline_transition_total: resource transitions by event kind
//! - parkline_listener_failure_total: listener errors and panics
//! - parkline_transport_failure_total: sink write/flush failures by kind
//! - parkline_subscribers: current subscriber count per topic

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

use crate::error::TransportError;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Parkline metrics registry.
#[derive(Debug)]
pub struct Metrics {
    pub broadcast_total: Counter<u64>,
    pub delivery_total: Counter<u64>,
    pub skipped_total: Counter<u64>,
    pub transition_total: Counter<u64>,
    pub listener_failure_total: Counter<u64>,
    pub transport_failure_total: Counter<u64>,
    /// Subscribers per topic.
    pub subscribers: Gauge<i64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            broadcast_total: meter
                .u64_counter("parkline_broadcast_total")
                .with_description("Total number of broadcasts")
                .with_unit("1")
                .init(),
            delivery_total: meter
                .u64_counter("parkline_delivery_total")
                .with_description("Messages written to a subscriber's transport")
                .with_unit("1")
                .init(),
            skipped_total: meter
                .u64_counter("parkline_skipped_total")
                .with_description("Subscribers skipped because they were not suspended")
                .with_unit("1")
                .init(),
            transition_total: meter
                .u64_counter("parkline_transition_total")
                .with_description("Resource transitions by event kind")
                .with_unit("1")
                .init(),
            listener_failure_total: meter
                .u64_counter("parkline_listener_failure_total")
                .with_description("Listener callbacks that failed or panicked")
                .with_unit("1")
                .init(),
            transport_failure_total: meter
                .u64_counter("parkline_transport_failure_total")
                .with_description("Transport write or flush failures")
                .with_unit("1")
                .init(),
            subscribers: meter
                .i64_gauge("parkline_subscribers")
                .with_description("Resources subscribed to a broadcaster")
                .with_unit("1")
                .init(),
        }
    }
}

/// Install the parkline meters, exporting to `otel_endpoint` over OTLP/gRPC
/// when given. Only the first call has an effect.
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(error = %e, endpoint, "OTLP exporter unavailable, metrics stay local");
                    install_manual_provider();
                }
            }
        } else {
            install_manual_provider();
        }

        let meter = global::meter("parkline");
        Metrics::new(&meter)
    });
}

fn install_manual_provider() {
    let reader = ManualReader::builder().build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider);
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// The global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

pub fn record_broadcast(topic: &str) {
    if let Some(m) = METRICS.get() {
        m.broadcast_total
            .add(1, &[KeyValue::new("topic", topic.to_string())]);
    }
}

pub fn record_delivery(topic: &str) {
    if let Some(m) = METRICS.get() {
        m.delivery_total
            .add(1, &[KeyValue::new("topic", topic.to_string())]);
    }
}

pub fn record_skipped(topic: &str) {
    if let Some(m) = METRICS.get() {
        m.skipped_total
            .add(1, &[KeyValue::new("topic", topic.to_string())]);
    }
}

/// Record a resource transition, labelled by event kind.
pub fn record_transition(kind: &'static str) {
    if let Some(m) = METRICS.get() {
        m.transition_total.add(1, &[KeyValue::new("kind", kind)]);
    }
}

pub fn record_listener_failure(listener: &str) {
    if let Some(m) = METRICS.get() {
        m.listener_failure_total
            .add(1, &[KeyValue::new("listener", listener.to_string())]);
    }
}

pub fn record_transport_failure(error: &TransportError) {
    if let Some(m) = METRICS.get() {
        m.transport_failure_total
            .add(1, &[KeyValue::new("kind", format!("{:?}", error.kind()))]);
    }
}

/// Record the subscriber count of a topic.
pub fn record_subscribers(topic: &str, count: usize) {
    if let Some(m) = METRICS.get() {
        m.subscribers.record(
            i64::try_from(count).unwrap_or(i64::MAX),
            &[KeyValue::new("topic", topic.to_string())],
        );
    }
}
