//! Duplex relay between a raw socket and an upgraded virtual stream

use super::virtual_stream::{InboundEvent, InboundStream, StreamWriter};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use wayport_common::Result;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Byte counters of a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes read from the socket and written into the virtual stream
    pub to_tunnel: u64,
    /// Bytes received from the virtual stream and written to the socket
    pub from_tunnel: u64,
}

/// Relay bytes between `io` and an upgraded exchange until either side ends.
///
/// Both directions are torn down together: socket EOF ends the virtual
/// stream, a socket error aborts it, and any terminal event from the peer
/// (end, error, disconnect) shuts the socket down. The socket is dropped on
/// return.
pub async fn relay_duplex<T>(
    io: T,
    mut inbound: InboundStream,
    mut writer: StreamWriter,
) -> Result<RelayStats>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut rd, mut wr) = tokio::io::split(io);
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut stats = RelayStats::default();

    loop {
        if buf.capacity() < READ_BUFFER_SIZE / 4 {
            buf.reserve(READ_BUFFER_SIZE);
        }
        tokio::select! {
            read = rd.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!("Socket side of {} ended", writer.request_id());
                    writer.end().await?;
                    break;
                }
                Ok(n) => {
                    stats.to_tunnel += n as u64;
                    writer.write(buf.split().freeze()).await?;
                }
                Err(e) => {
                    writer.abort(e.to_string()).await?;
                    break;
                }
            },
            event = inbound.recv() => match event {
                Some(InboundEvent::Data(chunk)) => {
                    if let Err(e) = wr.write_all(&chunk).await {
                        writer.abort(e.to_string()).await?;
                        break;
                    }
                    stats.from_tunnel += chunk.len() as u64;
                }
                Some(InboundEvent::Head(_)) => {
                    debug!("Ignoring repeated head on duplex stream {}", inbound.request_id());
                }
                Some(InboundEvent::End) | None => {
                    let _ = wr.shutdown().await;
                    writer.end().await?;
                    break;
                }
                Some(event) => {
                    debug!("Tunnel side of {} terminated: {:?}", inbound.request_id(), event);
                    let _ = wr.shutdown().await;
                    // Aborting is a no-op for a writer already torn down with the connection
                    let _ = writer.abort("peer terminated stream").await;
                    break;
                }
            },
        }
    }

    Ok(stats)
}
