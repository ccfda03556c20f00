use anyhow::Context;
use opentelemetry::global;
use opentelemetry::sdk::propagation::BaggagePropagator;
use opentelemetry::sdk::propagation::TextMapCompositePropagator;
use opentelemetry::sdk::propagation::TraceContextPropagator;
use opentelemetry::sdk::trace;
use opentelemetry::sdk::Resource;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use serde::Deserialize;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry};

const DEFAULT_DIRECTIVES: &str = "info";

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    pub service_name: String,
    /// Export spans over OTLP; endpoint and headers come from the standard
    /// `OTEL_EXPORTER_OTLP_*` environment variables.
    #[serde(default)]
    pub otlp_export: bool,
}

/// Installs the global `tracing` subscriber: JSON lines on stdout filtered by
/// `RUST_LOG` (default `info`), plus an OTLP layer when enabled.
pub fn init_telemetry(settings: &TelemetrySettings) -> anyhow::Result<()> {
    // Needed to forward ordinary log statements to our tracing subscriber.
    tracing_log::LogTracer::init().context("Failed to initialize log tracer")?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let subscriber = Registry::default().with(filter).with(
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_thread_names(true),
    );

    let otel_layer = if settings.otlp_export {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_env())
            .with_trace_config(trace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", settings.service_name.clone()),
            ])))
            .install_batch(opentelemetry::runtime::Tokio)
            .context("Failed to initialize otlp tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing::subscriber::set_global_default(subscriber.with(otel_layer))
        .context("Failed to install `tracing` subscriber")?;

    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(BaggagePropagator::new()),
        Box::new(TraceContextPropagator::new()),
    ]));

    Ok(())
}

pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
