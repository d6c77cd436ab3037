//! Embeddable tunnel client with builder pattern.
//!
//! # Example
//!
//! ```rust,no_run
//! use wayport::Client;
//!
//! # async fn example() -> wayport::Result<()> {
//! let mut client = Client::builder()
//!     .server_addr("gateway.example.com:7835")
//!     .token("my-secret-token")
//!     .host("app.example.com")
//!     .local_addr("127.0.0.1:3000")
//!     .build()?;
//!
//! let info = client.start().await?;
//! println!("Serving {} as session {}", info.host, info.session_id);
//! client.wait().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{ClientConfig, TunnelInfo};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wayport_common::{KeepaliveConfig, Result, TunnelError};
use wayport_core::reconnect::{BackoffConfig, ReconnectPolicy};
use wayport_core::TunnelClient;
use wayport_http::LocalProxy;

type InfoSlot = Arc<Mutex<Option<oneshot::Sender<TunnelInfo>>>>;

/// A tunnel client that can be embedded in your application.
///
/// Use [`Client::builder()`] to create a new client with the builder pattern.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

/// Builder for constructing a [`Client`] with ergonomic configuration.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Connect to the gateway and start serving exchanges in the background.
    ///
    /// Resolves once the first handshake succeeds. A failure that will not be
    /// retried (rejected credentials, a taken route, reconnects disabled or
    /// exhausted) is returned instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is already running or never connected.
    pub async fn start(&mut self) -> Result<TunnelInfo> {
        if self.task.is_some() {
            return Err(TunnelError::InvalidState("client already started".into()));
        }

        let (info_tx, info_rx) = oneshot::channel();
        let slot: InfoSlot = Arc::new(Mutex::new(Some(info_tx)));
        let mut task = tokio::spawn(run(self.config.clone(), slot, self.shutdown.clone()));

        tokio::select! {
            info = info_rx => match info {
                Ok(info) => {
                    self.task = Some(task);
                    Ok(info)
                }
                // Sender gone: the loop ended before connecting
                Err(_) => Err(stopped(task.await)),
            },
            finished = &mut task => Err(stopped(finished)),
        }
    }

    /// Wait for the background loop to end
    pub async fn wait(&mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| TunnelError::Connection(format!("client task failed: {e}")))?,
            None => Ok(()),
        }
    }

    /// Stop the client and wait for cleanup
    pub async fn shutdown(&mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    /// Signal the client to stop without waiting
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn stopped(finished: std::result::Result<Result<()>, tokio::task::JoinError>) -> TunnelError {
    match finished {
        Ok(Err(e)) => e,
        Ok(Ok(())) => TunnelError::Connection("client stopped before connecting".into()),
        Err(e) => TunnelError::Connection(format!("client task failed: {e}")),
    }
}

async fn run(config: ClientConfig, slot: InfoSlot, shutdown: CancellationToken) -> Result<()> {
    let proxy = Arc::new(LocalProxy::new(config.local_addr.clone()));
    let mut policy = ReconnectPolicy::new(config.backoff.clone(), config.max_reconnect_attempts);

    loop {
        let mut tunnel = TunnelClient::new(&config.server_addr, &config.token, &config.host)
            .with_keepalive(config.keepalive.clone());
        if let Some(prefix) = &config.path_prefix {
            tunnel = tunnel.with_path_prefix(prefix);
        }

        let handler_proxy = proxy.clone();
        let on_connected = {
            let slot = slot.clone();
            let host = config.host.clone();
            let path_prefix = config.path_prefix.clone();
            move |session_id| {
                info!("Tunnel for {} established, session {}", host, session_id);
                if let Some(tx) = slot.lock().ok().and_then(|mut guard| guard.take()) {
                    let _ = tx.send(TunnelInfo {
                        session_id,
                        host,
                        path_prefix,
                    });
                }
            }
        };

        let result = tokio::select! {
            result = tunnel.connect_and_run_with_callback(
                move |exchange| {
                    let proxy = handler_proxy.clone();
                    async move { proxy.handle(exchange).await }
                },
                on_connected,
            ) => result,
            () = shutdown.cancelled() => {
                info!("Client shutdown requested");
                return Ok(());
            }
        };

        if tunnel.session_id().is_some() {
            policy.on_connected();
        }

        let err = match result {
            Ok(()) => {
                info!("Gateway closed the tunnel");
                TunnelError::PeerDisconnected
            }
            Err(e) => e,
        };
        if !config.auto_reconnect {
            error!("Tunnel ended: {}", err);
            return Err(err);
        }
        let Some(delay) = policy.on_failure(&err) else {
            error!("Giving up on the gateway: {}", err);
            return Err(err);
        };

        warn!("Tunnel ended ({}), reconnecting in {:?}", err, delay);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shutdown.cancelled() => return Ok(()),
        }
    }
}

impl ClientBuilder {
    /// Gateway control address, `host:port`
    #[must_use]
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server_addr = addr.into();
        self
    }

    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    /// Public host to register
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Restrict the route to paths under `prefix`
    #[must_use]
    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.path_prefix = Some(prefix.into());
        self
    }

    /// Local service to forward to.
    ///
    /// Default: `"127.0.0.1:3000"`
    #[must_use]
    pub fn local_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.local_addr = addr.into();
        self
    }

    /// Default: `true`
    #[must_use]
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Shorthand for a backoff starting at `delay`
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.backoff.base = delay;
        self
    }

    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.config.keepalive = keepalive;
        self
    }

    /// # Errors
    ///
    /// Returns an error if `server_addr`, `token` or `host` is missing or invalid.
    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        Ok(Client {
            config: self.config,
            shutdown: CancellationToken::new(),
            task: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builder_success() {
        let client = Client::builder()
            .server_addr("localhost:7835")
            .token("secret-token")
            .host("app.test")
            .local_addr("127.0.0.1:9000")
            .build();
        assert!(client.is_ok());
    }

    #[test]
    fn test_client_builder_with_all_options() {
        let client = Client::builder()
            .server_addr("gateway.example.com:7835")
            .token("my-token")
            .host("App.Example.com")
            .path_prefix("/api")
            .local_addr("127.0.0.1:3000")
            .auto_reconnect(false)
            .reconnect_delay(Duration::from_secs(10))
            .max_reconnect_attempts(3)
            .build()
            .expect("should build successfully");

        assert_eq!(client.config().server_addr, "gateway.example.com:7835");
        assert_eq!(client.config().path_prefix.as_deref(), Some("/api"));
        assert!(!client.config().auto_reconnect);
        assert_eq!(client.config().backoff.base, Duration::from_secs(10));
        assert_eq!(client.config().max_reconnect_attempts, Some(3));
    }

    #[test]
    fn test_client_builder_missing_fields() {
        let err = Client::builder().token("secret").host("a.test").build().unwrap_err();
        assert!(err.to_string().contains("server_addr"));

        let err = Client::builder()
            .server_addr("localhost:7835")
            .host("a.test")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("token"));

        let err = Client::builder()
            .server_addr("localhost:7835")
            .token("secret")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("host"));
    }

    #[test]
    fn test_client_builder_default_local_addr() {
        let client = Client::builder()
            .server_addr("localhost:7835")
            .token("secret")
            .host("a.test")
            .build()
            .expect("should use default local_addr");
        assert_eq!(client.config().local_addr, "127.0.0.1:3000");
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_start_fails_without_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = Client::builder()
            .server_addr(addr.to_string())
            .token("secret")
            .host("a.test")
            .auto_reconnect(false)
            .build()
            .unwrap();
        assert!(client.start().await.is_err());
        assert!(!client.is_running());
    }
}
