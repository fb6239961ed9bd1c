use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "beach-beacon";
const DEFAULT_FILTER: &str = "info";

/// Handshakes normally finish in one auth round trip; the tail buckets
/// cover a slow auth service up to its request timeout.
const HANDSHAKE_BUCKETS_MS: &[f64] = &[
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0,
];

#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Also export tracing spans to stdout through OpenTelemetry.
    pub otel_stdout: bool,
}

/// Keeps the metrics recorder handle and, when span export is on, the
/// tracer provider that must be flushed on exit.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(config: &TelemetryConfig) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("beach_beacon_handshake_duration_ms".to_string()),
                HANDSHAKE_BUCKETS_MS,
            )
            .context("invalid handshake histogram buckets")?
            .install_recorder()
            .context("failed to install Prometheus recorder")?;

        let tracer_provider = config.otel_stdout.then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to install tracing subscriber")?;

        if tracer_provider.is_some() {
            info!(service = SERVICE_NAME, "exporting spans to stdout");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(resource)
        .build()
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let Some(provider) = self.tracer_provider.take() else {
            return;
        };
        match provider.shutdown() {
            Ok(()) => debug!("span exporter flushed"),
            Err(err) => warn!(error = %err, "span exporter did not shut down cleanly"),
        }
    }
}
