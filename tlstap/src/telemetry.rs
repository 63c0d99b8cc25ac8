//! OpenTelemetry metrics export.
//!
//! Export is enabled only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set; every
//! `record_*` helper is a no-op otherwise.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;
use tlstap_common::{Direction, TlsSource};

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<TlsTapMetrics> = OnceLock::new();

/// Kept for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Attached target count per probe family, read by the gauge callback
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct TlsTapMetrics {
    pub tls_chunks: Counter<u64>,
    pub tls_bytes: Counter<u64>,
    pub tls_fragments: Counter<u64>,
    pub probe_events: Counter<u64>,
}

impl TlsTapMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            tls_chunks: meter
                .u64_counter("tls_chunks")
                .with_description("Plaintext chunks received from the kernel")
                .with_unit("chunks")
                .build(),
            tls_bytes: meter
                .u64_counter("tls_bytes")
                .with_description("Plaintext bytes received from the kernel")
                .with_unit("bytes")
                .build(),
            tls_fragments: meter
                .u64_counter("tls_fragments")
                .with_description("Reassembled per-call fragments")
                .with_unit("fragments")
                .build(),
            probe_events: meter
                .u64_counter("probe_events")
                .with_description("Kernel-side probe outcomes by kind")
                .with_unit("events")
                .build(),
        }
    }
}

/// `OTEL_EXPORTER_OTLP_ENDPOINT`, with `http://` added when no scheme is
/// given. Empty or unset disables export.
fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Configures metrics export to an OTLP collector via gRPC.
pub fn init_metrics() -> Result<()> {
    let endpoint = match get_otlp_endpoint() {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "tlstap"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("tlstap");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of attach targets per probe family")
        .with_unit("targets")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(TlsTapMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static TlsTapMetrics> {
    METRICS.get()
}

pub fn record_chunk(direction: Direction, source: TlsSource, bytes: u64) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("direction", direction.as_str()),
            KeyValue::new("source", source.as_str()),
        ];
        m.tls_chunks.add(1, &attrs);
        m.tls_bytes.add(bytes, &attrs);
    }
}

pub fn record_fragment(direction: Direction, source: TlsSource, truncated: bool) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("direction", direction.as_str()),
            KeyValue::new("source", source.as_str()),
            KeyValue::new("truncated", truncated),
        ];
        m.tls_fragments.add(1, &attrs);
    }
}

pub fn record_probe_stat(outcome: &str, count: u64) {
    if count == 0 {
        return;
    }
    if let Some(m) = metrics() {
        m.probe_events
            .add(count, &[KeyValue::new("outcome", outcome.to_string())]);
    }
}

pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        info!("Shutting down OpenTelemetry metrics...");
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
