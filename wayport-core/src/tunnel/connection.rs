use crate::stream::{ExchangeStreams, Multiplexer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;
use wayport_common::Result;
use wayport_protocol::RequestHead;

#[derive(Debug)]
struct ConnectionInfo {
    id: Uuid,
    host: String,
    path_prefix: Option<String>,
    peer_addr: SocketAddr,
    connected_at: Instant,
    multiplexer: Multiplexer,
}

/// Handle to one registered tunnel client.
///
/// Cheap to clone. Exchanges hold a clone for their lifetime; once the control
/// connection is gone every stream opened through the handle observes a
/// disconnect, so an exchange can never outlive its connection unnoticed.
#[derive(Debug, Clone)]
pub struct TunnelConnection {
    inner: Arc<ConnectionInfo>,
}

impl TunnelConnection {
    pub fn new(
        id: Uuid,
        host: String,
        path_prefix: Option<String>,
        peer_addr: SocketAddr,
        multiplexer: Multiplexer,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInfo {
                id,
                host,
                path_prefix,
                peer_addr,
                connected_at: Instant::now(),
                multiplexer,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn path_prefix(&self) -> Option<&str> {
        self.inner.path_prefix.as_deref()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn connected_at(&self) -> Instant {
        self.inner.connected_at
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.inner.multiplexer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.multiplexer.is_closed()
    }

    /// Start a new exchange on this connection
    pub async fn open_exchange(&self, head: RequestHead) -> Result<ExchangeStreams> {
        self.inner.multiplexer.open_exchange(head).await
    }
}
