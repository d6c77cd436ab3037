//! Embeddable gateway with builder pattern.
//!
//! # Example
//!
//! ```rust,no_run
//! use wayport::Server;
//!
//! # async fn example() -> wayport::Result<()> {
//! let server = Server::builder()
//!     .bind("0.0.0.0:7835".parse().unwrap())
//!     .http_bind("0.0.0.0:8080".parse().unwrap())
//!     .jwt("my-secret-key", "my-verify-token")
//!     .build()?;
//!
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{GeneratorCredentials, ServerAuth, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wayport_common::{KeepaliveConfig, LimitsConfig, Result, TunnelError};
use wayport_core::auth::{JwtVerifier, StaticTokenVerifier, TokenVerifier};
use wayport_core::transport::tcp;
use wayport_core::{TunnelRegistry, TunnelServer};
use wayport_http::{HttpIngress, IngressConfig, JwtGenerator};

/// A gateway that can be embedded in your application.
///
/// The control listener and the public HTTP listener share one
/// [`TunnelRegistry`]; both stop when [`stop()`](Self::stop) is called.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    registry: TunnelRegistry,
    shutdown: CancellationToken,
}

/// Builder for constructing a [`Server`] with ergonomic configuration.
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Bind both listeners and serve until stopped or one of them fails
    pub async fn start(&self) -> Result<()> {
        let tunnel_listener = tcp::bind(self.config.bind_addr).await?;
        let http_listener = tcp::bind(self.config.http_bind_addr).await?;
        self.serve(tunnel_listener, http_listener).await
    }

    /// Serve on already bound listeners
    pub async fn serve(&self, tunnel_listener: TcpListener, http_listener: TcpListener) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::InvalidState("server was stopped".into()));
        }

        info!("Starting Wayport gateway");
        info!("  Tunnel bind: {}", tunnel_listener.local_addr()?);
        info!("  HTTP bind: {}", http_listener.local_addr()?);

        let tunnel_server =
            TunnelServer::new(self.config.bind_addr, self.registry.clone(), self.verifier())
                .with_keepalive(self.config.keepalive.clone())
                .with_limits(self.config.limits.clone())
                .with_shutdown(self.shutdown.clone());
        let ingress = HttpIngress::with_config(
            self.config.http_bind_addr,
            self.registry.clone(),
            self.ingress_config(),
        )
        .with_shutdown(self.shutdown.clone());

        let mut tunnel_handle = tokio::spawn(tunnel_server.serve(tunnel_listener));
        let mut ingress_handle = tokio::spawn(ingress.serve(http_listener));

        // Either listener ending takes the other one down with it
        let result = tokio::select! {
            result = &mut tunnel_handle => joined("tunnel", result),
            result = &mut ingress_handle => joined("ingress", result),
        };
        self.shutdown.cancel();
        let _ = tunnel_handle.await;
        let _ = ingress_handle.await;

        info!("Gateway stopped");
        result
    }

    /// Signal both listeners to stop
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Live routing table
    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn verifier(&self) -> Arc<dyn TokenVerifier> {
        match &self.config.auth {
            ServerAuth::Jwt {
                secret_key,
                verify_token,
            } => Arc::new(JwtVerifier::new(secret_key, verify_token)),
            ServerAuth::Static(token) => Arc::new(StaticTokenVerifier::new(token)),
        }
    }

    fn ingress_config(&self) -> IngressConfig {
        let jwt_generator = match (&self.config.auth, &self.config.jwt_generator) {
            (
                ServerAuth::Jwt {
                    secret_key,
                    verify_token,
                },
                Some(credentials),
            ) => Some(JwtGenerator {
                username: credentials.username.clone(),
                password: credentials.password.clone(),
                secret_key: secret_key.clone(),
                verify_token: verify_token.clone(),
            }),
            _ => None,
        };
        IngressConfig {
            max_connections: self.config.limits.max_public_connections,
            forwarded_proto: self.config.forwarded_proto.clone(),
            response_timeout: self.config.response_timeout,
            jwt_generator,
        }
    }
}

fn joined(name: &str, result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(TunnelError::Connection(format!("{name} task panicked: {e}"))),
    }
}

impl ServerBuilder {
    /// Control listener for tunnel clients.
    ///
    /// Default: `0.0.0.0:7835`
    #[must_use]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Public HTTP listener.
    ///
    /// Default: `0.0.0.0:8080`
    #[must_use]
    pub fn http_bind(mut self, addr: SocketAddr) -> Self {
        self.config.http_bind_addr = addr;
        self
    }

    /// Accept HS256 JWTs signed with `secret_key` carrying `verify_token`
    #[must_use]
    pub fn jwt(mut self, secret_key: impl Into<String>, verify_token: impl Into<String>) -> Self {
        self.config.auth = ServerAuth::Jwt {
            secret_key: secret_key.into(),
            verify_token: verify_token.into(),
        };
        self
    }

    /// Accept one shared token
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.auth = ServerAuth::Static(token.into());
        self
    }

    /// Serve `GET /tunnel_jwt_generator` behind these credentials
    #[must_use]
    pub fn jwt_generator(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.jwt_generator = Some(GeneratorCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: LimitsConfig) -> Self {
        self.config.limits = limits;
        self
    }

    #[must_use]
    pub fn keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.config.keepalive = keepalive;
        self
    }

    #[must_use]
    pub fn forwarded_proto(mut self, proto: impl Into<String>) -> Self {
        self.config.forwarded_proto = proto.into();
        self
    }

    #[must_use]
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = Some(timeout);
        self
    }

    /// # Errors
    ///
    /// Returns an error if no credentials are configured or limits are invalid.
    pub fn build(self) -> Result<Server> {
        self.config.validate()?;
        Ok(Server {
            config: self.config,
            registry: TunnelRegistry::new(),
            shutdown: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_builder_with_token() {
        let server = Server::builder()
            .bind("127.0.0.1:7835".parse().unwrap())
            .http_bind("127.0.0.1:8080".parse().unwrap())
            .token("secret")
            .build()
            .expect("should build");
        assert!(!server.is_stopped());
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_server_builder_missing_credentials() {
        let err = Server::builder().build().unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn test_generator_wired_for_jwt() {
        let server = Server::builder()
            .jwt("key", "verify")
            .jwt_generator("admin", "pw")
            .forwarded_proto("https")
            .build()
            .unwrap();
        let ingress = server.ingress_config();
        assert_eq!(ingress.forwarded_proto, "https");
        let generator = ingress.jwt_generator.expect("generator configured");
        assert_eq!(generator.secret_key, "key");
        assert_eq!(generator.username, "admin");
    }

    #[tokio::test]
    async fn test_stop_ends_serve() {
        let server = Server::builder().token("secret").build().unwrap();
        let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let token = server.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        assert!(server.serve(tunnel, http).await.is_ok());
        assert!(server.is_stopped());
    }
}
