//! Plain TCP transport

use super::socket_tuning::configure_socket_silent;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use wayport_common::{Result, TunnelError};

/// Bind a listener for control or public connections
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| TunnelError::Connection(format!("failed to bind {addr}: {e}")))
}

/// Accept one connection and apply socket tuning
pub async fn accept(listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept().await?;
    configure_socket_silent(&stream);
    Ok((stream, addr))
}

/// Open a tuned TCP connection
pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    configure_socket_silent(&stream);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_accept_connect() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(connect(addr), accept(&listener));
        let client = client.unwrap();
        let (server, peer) = accepted.unwrap();

        assert_eq!(peer, client.local_addr().unwrap());
        assert!(server.nodelay().unwrap());
        assert!(client.nodelay().unwrap());
    }
}
