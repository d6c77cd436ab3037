use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Registry};

/// Subscriber options
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    pub service_name: String,
    /// OTLP gRPC collector; spans are only exported when set
    pub otlp_endpoint: Option<String>,
    /// Emit log lines as JSON objects
    pub json_logs: bool,
}

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber, with an OpenTelemetry layer when an OTLP
/// endpoint is configured
pub fn init_tracing(config: TracingConfig) -> Result<(), anyhow::Error> {
    // Exactly one of the two is set
    let (plain, json) = if config.json_logs {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (Some(fmt::layer().with_target(true)), None)
    };

    let Some(endpoint) = config.otlp_endpoint else {
        Registry::default()
            .with(env_filter())
            .with(plain)
            .with(json)
            .try_init()?;
        return Ok(());
    };

    global::set_text_map_propagator(TraceContextPropagator::new());
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()?;
    let provider = SdkTracerProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(config.service_name)
                .build(),
        )
        .with_batch_exporter(exporter)
        .build();
    let tracer = provider.tracer("wayport");
    let _ = TRACER_PROVIDER.set(provider.clone());
    global::set_tracer_provider(provider);

    Registry::default()
        .with(env_filter())
        .with(plain)
        .with(json)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;

    tracing::info!("Exporting spans to {}", endpoint);
    Ok(())
}

/// Flush pending spans
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::error!("Failed to shut down tracer provider: {}", e);
        }
    }
}
