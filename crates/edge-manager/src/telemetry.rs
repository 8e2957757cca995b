//! Tracing subscriber setup with optional OpenTelemetry export.
//!
//! With telemetry disabled this is plain `common::logging`. With it enabled
//! spans are also batched to an OTLP collector over gRPC or HTTP.

use crate::config::{LoggingSettings, OtlpProtocol, TelemetrySettings};
use common::logging::{self, LogFormat};
use common::{Error, Result};
use opentelemetry::{KeyValue, trace::TracerProvider as _};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Flushes pending spans and shuts the tracer provider down when dropped.
/// Keep it alive for the life of the process.
pub struct TelemetryGuard;

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// Install the global subscriber.
///
/// Returns a guard only when OTLP export is enabled.
pub fn init_tracing(
    logging: &LoggingSettings,
    telemetry: &TelemetrySettings,
) -> Result<Option<TelemetryGuard>> {
    if !telemetry.enabled {
        logging::init(logging.level(), logging.format);
        tracing::info!("OpenTelemetry tracing disabled");
        return Ok(None);
    }

    let provider = build_provider(telemetry)?;
    let tracer = provider.tracer("edge-manager");
    opentelemetry::global::set_tracer_provider(provider);

    let otel = tracing_opentelemetry::layer().with_tracer(tracer);
    let registry = tracing_subscriber::registry()
        .with(logging::env_filter(logging.level()))
        .with(otel);
    let result = match logging.format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }

    tracing::info!(
        service_name = %telemetry.service_name,
        otlp_endpoint = %telemetry.otlp_endpoint,
        protocol = ?telemetry.protocol,
        "OpenTelemetry tracing initialized"
    );
    Ok(Some(TelemetryGuard))
}

fn build_provider(telemetry: &TelemetrySettings) -> Result<TracerProvider> {
    let exporter = match telemetry.protocol {
        OtlpProtocol::Grpc => opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(telemetry.otlp_endpoint.clone())
            .build(),
        OtlpProtocol::Http => opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(telemetry.otlp_endpoint.clone())
            .build(),
    }
    .map_err(|e| Error::config(format!("failed to build OTLP exporter: {}", e)))?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", telemetry.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .build())
}
