//! Telemetry initialization
//!
//! Structured logging through `tracing` (console or JSON), optional OTLP
//! trace export, and a Prometheus recorder for the `metrics` facade.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use loqa_config::Settings;

/// Initialize tracing with optional OpenTelemetry integration.
///
/// When `telemetry.otlp_endpoint` is configured, spans are exported to the
/// given OTLP collector; otherwise logging stays console-only.
pub fn init_tracing(config: &Settings) {
    use opentelemetry_otlp::WithExportConfig;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("loqa={}", config.telemetry.log_level).into());

    let subscriber = tracing_subscriber::registry().with(env_filter);

    let fmt_layer = if config.telemetry.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    if let Some(otlp_endpoint) = &config.telemetry.otlp_endpoint {
        match opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(otlp_endpoint),
            )
            .with_trace_config(
                opentelemetry_sdk::trace::Config::default().with_resource(
                    opentelemetry_sdk::Resource::new(vec![
                        opentelemetry::KeyValue::new(
                            "service.name",
                            config.runtime_name.clone(),
                        ),
                        opentelemetry::KeyValue::new(
                            "deployment.environment",
                            config.environment.clone(),
                        ),
                    ]),
                ),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)
        {
            Ok(provider) => {
                use opentelemetry::trace::TracerProvider as _;
                let tracer = provider.tracer(config.runtime_name.clone());
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                subscriber.with(fmt_layer).with(otel_layer).init();
                tracing::info!(endpoint = %otlp_endpoint, "otlp trace export enabled");
                return;
            }
            Err(error) => {
                eprintln!("failed to initialize OTLP export: {error}; console logging only");
            }
        }
    }

    subscriber.with(fmt_layer).init();
}

/// Install the Prometheus recorder. Must run once before any metric is
/// recorded; the returned handle renders the scrape payload.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
