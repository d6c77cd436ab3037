pub mod client;
pub mod connection;
pub mod server;

pub use client::{IncomingExchange, Responder, TunnelClient};
pub use connection::TunnelConnection;
pub use server::TunnelServer;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, for ping timestamps
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Frame validation limits derived from the configured resource limits
pub(crate) fn validation_limits(
    limits: &wayport_common::LimitsConfig,
) -> wayport_protocol::validation::ValidationLimits {
    wayport_protocol::validation::ValidationLimits {
        max_token_len: limits.max_token_len,
        max_host_len: limits.max_host_len,
        max_path_prefix_len: limits.max_path_prefix_len,
        max_headers: limits.max_headers,
        max_payload_bytes: limits.max_frame_bytes as usize,
    }
}
