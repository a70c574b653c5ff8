use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tokio::runtime::Runtime;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";
const OTLP_ENDPOINT_OVERRIDE_ENV: &str = "INDEX_RELEASE_OTEL_EXPORTER_OTLP_ENDPOINT";
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const DEFAULT_SERVICE_NAME: &str = "index-release";
const DEFAULT_METRIC_EXPORT_INTERVAL_SECS: u64 = 15;

static UPDATES_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
static UPDATE_DURATION_SECONDS_HISTOGRAM: OnceLock<Histogram<f64>> = OnceLock::new();
static STAGED_BYTES_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();

/// Keeps the tracing subscriber and, when enabled, the OTLP pipeline alive.
pub struct ObservabilityGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    _tokio_runtime: Option<Runtime>,
}

impl ObservabilityGuard {
    /// Installs an stderr fmt subscriber. With `otel_enabled`, spans and the update
    /// instruments are exported over OTLP; a failed pipeline setup degrades to local logging.
    pub fn init(otel_enabled: bool) -> Self {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);

        if !otel_enabled {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init();
            return Self::local();
        }

        match setup_otel_pipeline() {
            Ok(pipeline) => {
                let tracer = pipeline.tracer_provider.tracer("index-release");
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(otel_layer)
                    .try_init();

                init_instruments();
                info!(otlp_endpoint = %pipeline.endpoint, "observability pipeline initialized");

                Self {
                    tracer_provider: Some(pipeline.tracer_provider),
                    meter_provider: Some(pipeline.meter_provider),
                    _tokio_runtime: Some(pipeline.runtime),
                }
            }
            Err(err) => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .try_init();
                warn!(error = %format!("{err:#}"), "observability pipeline degraded to local logging");
                Self::local()
            }
        }
    }

    fn local() -> Self {
        Self {
            tracer_provider: None,
            meter_provider: None,
            _tokio_runtime: None,
        }
    }

    pub fn exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(meter_provider) = self.meter_provider.as_ref() {
            if let Err(err) = meter_provider.force_flush() {
                eprintln!("observability: metrics flush failed: {err}");
            }
            if let Err(err) = meter_provider.shutdown() {
                eprintln!("observability: metrics shutdown failed: {err}");
            }
        }

        if let Some(tracer_provider) = self.tracer_provider.as_ref() {
            for result in tracer_provider.force_flush() {
                if let Err(err) = result {
                    eprintln!("observability: trace flush failed: {err}");
                }
            }
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!("observability: trace shutdown failed: {err}");
            }
        }
    }
}

struct PipelineState {
    runtime: Runtime,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    endpoint: String,
}

fn setup_otel_pipeline() -> Result<PipelineState> {
    let endpoint = read_trimmed_env(OTLP_ENDPOINT_OVERRIDE_ENV)
        .or_else(|| read_trimmed_env(OTLP_ENDPOINT_ENV))
        .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string());
    let service_name =
        read_trimmed_env("OTEL_SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
    let export_interval_secs = read_trimmed_env("OTEL_METRIC_EXPORT_INTERVAL_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_METRIC_EXPORT_INTERVAL_SECS);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .thread_name("index-release-otel")
        .build()
        .context("failed building tokio runtime for OpenTelemetry")?;
    let _runtime_guard = runtime.enter();

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name)]);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .context("failed building OTLP span exporter")?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .context("failed building OTLP metric exporter")?;

    let periodic_reader =
        PeriodicReader::builder(metric_exporter, opentelemetry_sdk::runtime::Tokio)
            .with_interval(Duration::from_secs(export_interval_secs))
            .build();

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(periodic_reader)
        .build();
    global::set_meter_provider(meter_provider.clone());

    Ok(PipelineState {
        runtime,
        tracer_provider,
        meter_provider,
        endpoint,
    })
}

fn read_trimmed_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn init_instruments() {
    let meter = global::meter("index-release");

    let _ = UPDATES_COUNTER.get_or_init(|| {
        meter
            .u64_counter("release_updates_total")
            .with_description("Update runs by terminal status and failure code.")
            .build()
    });
    let _ = UPDATE_DURATION_SECONDS_HISTOGRAM.get_or_init(|| {
        meter
            .f64_histogram("release_update_duration_seconds")
            .with_description("Wall-clock duration of update runs in seconds.")
            .build()
    });
    let _ = STAGED_BYTES_COUNTER.get_or_init(|| {
        meter
            .u64_counter("release_staged_bytes_total")
            .with_description("Bytes copied and verified into staged releases.")
            .build()
    });
}

/// Records one finished update run. A no-op unless the OTLP pipeline is active.
pub fn record_update(status: &str, code: Option<&str>, duration: Duration, staged_bytes: u64) {
    let attrs = vec![
        KeyValue::new("status", status.to_string()),
        KeyValue::new("code", code.unwrap_or("none").to_string()),
    ];

    if let Some(counter) = UPDATES_COUNTER.get() {
        counter.add(1, &attrs);
    }
    if let Some(histogram) = UPDATE_DURATION_SECONDS_HISTOGRAM.get() {
        histogram.record(duration.as_secs_f64(), &attrs);
    }
    if staged_bytes > 0 {
        if let Some(counter) = STAGED_BYTES_COUNTER.get() {
            counter.add(staged_bytes, &attrs);
        }
    }
}
