//! # `Wayport`
//!
//! A reverse tunnel gateway. Tunnel clients dial out to the gateway, claim a
//! public host (optionally narrowed to a path prefix) and serve the HTTP and
//! WebSocket traffic the gateway receives for it from a local service.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wayport::{Client, Server};
//!
//! # async fn example() -> wayport::Result<()> {
//! let server = Server::builder().token("shared-secret").build()?;
//! tokio::spawn(async move { server.start().await });
//!
//! let mut client = Client::builder()
//!     .server_addr("127.0.0.1:7835")
//!     .token("shared-secret")
//!     .host("app.localhost")
//!     .local_addr("127.0.0.1:3000")
//!     .build()?;
//! client.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crates
//!
//! - `wayport-protocol` - frames and the length-delimited codec
//! - `wayport-core` - registry, multiplexer, control connections
//! - `wayport-http` - public ingress, exchange orchestration, local proxy

pub mod client;
pub mod config;
pub mod server;

pub use wayport_common as common;
pub use wayport_core as core;
pub use wayport_http as http;
pub use wayport_protocol as protocol;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, GeneratorCredentials, ServerAuth, ServerConfig, TunnelInfo};
pub use server::{Server, ServerBuilder};

pub use common::{Result, TunnelError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::common::{KeepaliveConfig, LimitsConfig, Result, TunnelError};
    pub use crate::core::reconnect::BackoffConfig;
    pub use crate::core::{issue_token, TunnelRegistry};
    pub use crate::{Client, ClientBuilder, Server, ServerBuilder, TunnelInfo};
}
