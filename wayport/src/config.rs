//! Configuration types for the embeddable `Wayport` client and server.

use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;
use wayport_common::{KeepaliveConfig, LimitsConfig, Result, TunnelError};
use wayport_core::reconnect::BackoffConfig;
use wayport_core::registry::normalize_host;

/// How the gateway checks tunnel client credentials
#[derive(Debug, Clone)]
pub enum ServerAuth {
    /// HS256 JWT signed with `secret_key` whose `token` claim is `verify_token`
    Jwt {
        secret_key: String,
        verify_token: String,
    },
    /// One shared token
    Static(String),
}

impl Default for ServerAuth {
    fn default() -> Self {
        ServerAuth::Static(String::new())
    }
}

/// Credentials guarding `GET /tunnel_jwt_generator`
#[derive(Debug, Clone)]
pub struct GeneratorCredentials {
    pub username: String,
    pub password: String,
}

/// Configuration for the gateway.
///
/// Use [`ServerBuilder`](crate::ServerBuilder) for ergonomic construction.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Control-connection listener for tunnel clients
    pub bind_addr: SocketAddr,
    /// Public HTTP listener
    pub http_bind_addr: SocketAddr,
    pub auth: ServerAuth,
    /// Enables the token generator endpoint (JWT auth only)
    pub jwt_generator: Option<GeneratorCredentials>,
    pub limits: LimitsConfig,
    pub keepalive: KeepaliveConfig,
    /// Value of `x-forwarded-proto` on relayed requests
    pub forwarded_proto: String,
    /// Deadline for a tunnel client's response head. `None` waits as long as
    /// the tunnel stays connected.
    pub response_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        match &self.auth {
            ServerAuth::Jwt {
                secret_key,
                verify_token,
            } => {
                if secret_key.is_empty() {
                    return Err(TunnelError::Config("secret_key is required".into()));
                }
                if verify_token.is_empty() {
                    return Err(TunnelError::Config("verify_token is required".into()));
                }
            }
            ServerAuth::Static(token) => {
                if token.is_empty() {
                    return Err(TunnelError::Config("token is required".into()));
                }
            }
        }
        if let Some(generator) = &self.jwt_generator {
            if !matches!(self.auth, ServerAuth::Jwt { .. }) {
                return Err(TunnelError::Config(
                    "jwt generator requires JWT authentication".into(),
                ));
            }
            if generator.username.is_empty() || generator.password.is_empty() {
                return Err(TunnelError::Config(
                    "jwt generator needs a username and a password".into(),
                ));
            }
        }
        if self.limits.max_tunnels == 0 || self.limits.max_public_connections == 0 {
            return Err(TunnelError::Config("connection limits must be positive".into()));
        }
        if self.bind_addr == self.http_bind_addr && self.bind_addr.port() != 0 {
            return Err(TunnelError::Config(
                "tunnel and http listeners need different addresses".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], wayport_common::constants::DEFAULT_TUNNEL_PORT).into(),
            http_bind_addr: ([0, 0, 0, 0], wayport_common::constants::DEFAULT_HTTP_PORT).into(),
            auth: ServerAuth::default(),
            jwt_generator: None,
            limits: LimitsConfig::default(),
            keepalive: KeepaliveConfig::default(),
            forwarded_proto: "http".to_string(),
            response_timeout: None,
        }
    }
}

/// Configuration for the tunnel client.
///
/// Use [`ClientBuilder`](crate::ClientBuilder) for ergonomic construction.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway control address (host:port)
    pub server_addr: String,
    /// Static token or JWT
    pub token: String,
    /// Public host this client serves
    pub host: String,
    /// Only paths starting with this prefix are routed here
    pub path_prefix: Option<String>,
    /// Local service traffic is forwarded to
    pub local_addr: String,
    pub auto_reconnect: bool,
    pub backoff: BackoffConfig,
    /// Give up after this many consecutive failed attempts
    pub max_reconnect_attempts: Option<u32>,
    pub keepalive: KeepaliveConfig,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(TunnelError::Config("server_addr is required".into()));
        }
        if self.token.is_empty() {
            return Err(TunnelError::Config("token is required".into()));
        }
        if self.host.is_empty() {
            return Err(TunnelError::Config("host is required".into()));
        }
        if normalize_host(&self.host).is_none() {
            return Err(TunnelError::Config(format!("invalid host {:?}", self.host)));
        }
        if let Some(prefix) = &self.path_prefix {
            if !prefix.is_empty() && !prefix.starts_with('/') {
                return Err(TunnelError::Config(format!(
                    "path_prefix must start with '/': {prefix:?}"
                )));
            }
        }
        if self.local_addr.is_empty() {
            return Err(TunnelError::Config("local_addr is required".into()));
        }
        if self.keepalive.ping_interval >= self.keepalive.idle_timeout {
            return Err(TunnelError::Config(
                "ping interval must be shorter than the idle timeout".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            token: String::new(),
            host: String::new(),
            path_prefix: None,
            local_addr: wayport_common::constants::DEFAULT_LOCAL_ADDR.to_string(),
            auto_reconnect: true,
            backoff: BackoffConfig::default(),
            max_reconnect_attempts: None,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

/// An established tunnel
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    /// Session id assigned by the gateway
    pub session_id: Uuid,
    pub host: String,
    pub path_prefix: Option<String>,
}
