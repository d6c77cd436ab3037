//! Prometheus metrics for the gateway
//!
//! Metrics are opt-in: until [`init_metrics`] runs, [`gateway_metrics`]
//! returns `None` and instrumented code skips its updates.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::{LazyLock, OnceLock};

/// Process-wide registry all gateway metrics are registered in
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static METRICS: OnceLock<GatewayMetrics> = OnceLock::new();

/// Gateway counters and gauges
#[derive(Debug, Clone)]
pub struct GatewayMetrics {
    /// Registered tunnel connections
    pub tunnel_connections: IntGauge,
    /// Exchanges currently in flight
    pub active_exchanges: IntGauge,
    /// Finished exchanges by outcome (`ok`, `upgrade`, `not_found`, `upstream_error`, `disconnected`, `error`)
    pub exchanges_total: IntCounterVec,
    /// Public requests no tunnel matched
    pub routing_misses: IntCounter,
    /// Frames for streams the connection never opened
    pub unknown_stream_frames: IntCounter,
}

impl GatewayMetrics {
    fn register(registry: &Registry) -> prometheus::Result<Self> {
        let tunnel_connections =
            IntGauge::new("wayport_tunnel_connections", "Registered tunnel connections")?;
        let active_exchanges =
            IntGauge::new("wayport_active_exchanges", "Exchanges currently in flight")?;
        let exchanges_total = IntCounterVec::new(
            Opts::new("wayport_exchanges_total", "Finished exchanges by outcome"),
            &["outcome"],
        )?;
        let routing_misses = IntCounter::new(
            "wayport_routing_misses_total",
            "Public requests with no matching tunnel",
        )?;
        let unknown_stream_frames = IntCounter::new(
            "wayport_unknown_stream_frames_total",
            "Frames received for unknown virtual streams",
        )?;

        registry.register(Box::new(tunnel_connections.clone()))?;
        registry.register(Box::new(active_exchanges.clone()))?;
        registry.register(Box::new(exchanges_total.clone()))?;
        registry.register(Box::new(routing_misses.clone()))?;
        registry.register(Box::new(unknown_stream_frames.clone()))?;

        Ok(Self {
            tunnel_connections,
            active_exchanges,
            exchanges_total,
            routing_misses,
            unknown_stream_frames,
        })
    }

    /// Count one finished exchange
    pub fn record_outcome(&self, outcome: &str) {
        self.exchanges_total.with_label_values(&[outcome]).inc();
    }
}

/// Register the gateway metrics. Safe to call more than once.
pub fn init_metrics() {
    if METRICS.get().is_some() {
        return;
    }
    match GatewayMetrics::register(&REGISTRY) {
        Ok(metrics) => {
            let _ = METRICS.set(metrics);
        }
        Err(e) => tracing::error!("Failed to register metrics: {}", e),
    }
}

pub fn metrics_enabled() -> bool {
    METRICS.get().is_some()
}

/// The gateway metrics, if [`init_metrics`] ran
pub fn gateway_metrics() -> Option<&'static GatewayMetrics> {
    METRICS.get()
}

/// Text exposition of every registered metric
pub fn gather_metrics() -> String {
    TextEncoder::new()
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_else(|e| {
            tracing::error!("Failed to encode metrics: {}", e);
            String::new()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_exposed_after_init() {
        init_metrics();
        init_metrics();
        assert!(metrics_enabled());

        let metrics = gateway_metrics().unwrap();
        metrics.tunnel_connections.inc();
        metrics.record_outcome("ok");

        let text = gather_metrics();
        assert!(text.contains("wayport_tunnel_connections"));
        assert!(text.contains("wayport_exchanges_total{outcome=\"ok\"}"));
    }
}
