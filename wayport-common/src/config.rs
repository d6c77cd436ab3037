//! Shared configuration types for `Wayport`

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource limits configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum frame size in bytes (default: 16MB)
    pub max_frame_bytes: u64,
    /// Maximum concurrent tunnel connections per gateway
    pub max_tunnels: usize,
    /// Maximum concurrent public connections on the ingress
    pub max_public_connections: usize,
    /// Maximum token length in bytes
    pub max_token_len: usize,
    /// Maximum host name length
    pub max_host_len: usize,
    /// Maximum path prefix length
    pub max_path_prefix_len: usize,
    /// Maximum number of header entries in a request/response head
    pub max_headers: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024, // 16MB
            max_tunnels: 1000,
            max_public_connections: 10_000,
            max_token_len: 4096,
            max_host_len: 253,
            max_path_prefix_len: 2048,
            max_headers: 256,
        }
    }
}

/// Keepalive configuration for the control connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// How often the tunnel client sends a ping
    pub ping_interval: Duration,
    /// A peer that sends nothing for this long is treated as disconnected
    pub idle_timeout: Duration,
    /// Deadline for the handshake after a connection is accepted
    pub handshake_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}
