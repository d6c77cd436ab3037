pub mod metrics;
pub mod tracing;

pub use metrics::{
    gateway_metrics, gather_metrics, init_metrics, metrics_enabled, GatewayMetrics, REGISTRY,
};
pub use tracing::{init_tracing, shutdown_tracing, TracingConfig};

/// Logging plus optional metrics and span export, driven by the environment
/// (`RUST_LOG`, `OTEL_EXPORTER_OTLP_ENDPOINT`)
pub fn init_basic_observability(service_name: &str, enable_tracing: bool, enable_metrics: bool) {
    if enable_metrics {
        init_metrics();
    }

    if enable_tracing {
        let config = TracingConfig {
            service_name: service_name.to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            json_logs: false,
        };
        if let Err(e) = init_tracing(config) {
            eprintln!("tracing setup failed: {e}");
        }
    } else {
        init_minimal_logging();
    }
}

/// Plain stdout logging filtered by `RUST_LOG` (default `info`)
pub fn init_minimal_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
