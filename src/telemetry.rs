//! Logging and OpenTelemetry tracing setup
//!
//! Log lines always go to stdout through `tracing-subscriber`. When enabled,
//! spans are also exported to an OTLP collector (e.g., Jaeger, Tempo).

use anyhow::{Context, Result};
use config::TracingConfig;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `log_level`. Returns the tracer provider
/// when OTLP export is enabled; keep it alive and pass it to
/// [`shutdown_telemetry`] on exit to flush pending spans.
pub fn init_tracing(log_level: &str, config: &TracingConfig) -> Result<Option<SdkTracerProvider>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level '{}'", log_level))?;

    let provider = init_telemetry(config);
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("tenant-tls")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(otel_layer)
        .try_init()
        .context("Failed to set tracing subscriber")?;

    if provider.is_some() {
        info!(
            endpoint = %config.otlp_endpoint,
            service = %config.service_name,
            sampling_ratio = config.sampling_ratio,
            "OpenTelemetry tracing initialized"
        );
    }
    Ok(provider)
}

/// Build the OTLP tracer provider, or `None` when tracing is disabled or the
/// exporter cannot be created
pub fn init_telemetry(config: &TracingConfig) -> Option<SdkTracerProvider> {
    if !config.enabled {
        return None;
    }

    let sampler = if config.sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sampling_ratio)
    };

    let trace_config = opentelemetry_sdk::trace::Config::default()
        .with_sampler(sampler)
        .with_resource(Resource::new(vec![opentelemetry::KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]));

    match opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&config.otlp_endpoint),
        )
        .with_trace_config(trace_config)
        .install_batch(opentelemetry_sdk::runtime::Tokio)
    {
        Ok(provider) => Some(provider),
        Err(e) => {
            // The subscriber is not installed yet
            eprintln!("Failed to create OTLP tracer provider: {}", e);
            None
        }
    }
}

/// Shutdown OpenTelemetry and flush pending traces
pub fn shutdown_telemetry(provider: Option<SdkTracerProvider>) {
    if let Some(provider) = provider {
        info!("Shutting down OpenTelemetry tracing");
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = %e, "Error shutting down tracer provider");
        }
    }
}
