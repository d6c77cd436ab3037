use super::{validation_limits, TunnelConnection};
use crate::auth::{validate_token_format, TokenVerifier};
use crate::registry::{normalize_host, TunnelRegistry};
use crate::stream::Multiplexer;
use crate::transport::{run_frame_writer, tcp, FrameSink};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wayport_common::{KeepaliveConfig, LimitsConfig, Result, TunnelError};
use wayport_protocol::constants::{MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION};
use wayport_protocol::validation::{validate_frame, ValidationLimits};
use wayport_protocol::{Frame, HandshakeFrame, HandshakeStatus, TunnelCodec};

/// Gateway side of the control connections.
///
/// Accepts tunnel clients, runs the registration handshake and keeps each
/// admitted connection in the [`TunnelRegistry`] until it goes away.
pub struct TunnelServer {
    addr: SocketAddr,
    registry: TunnelRegistry,
    verifier: Arc<dyn TokenVerifier>,
    keepalive: KeepaliveConfig,
    limits: LimitsConfig,
    shutdown: CancellationToken,
}

struct ServerContext {
    registry: TunnelRegistry,
    verifier: Arc<dyn TokenVerifier>,
    keepalive: KeepaliveConfig,
    limits: LimitsConfig,
    validation: ValidationLimits,
    shutdown: CancellationToken,
}

impl TunnelServer {
    pub fn new(addr: SocketAddr, registry: TunnelRegistry, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            addr,
            registry,
            verifier,
            keepalive: KeepaliveConfig::default(),
            limits: LimitsConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    /// Stop accepting when `token` is cancelled
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub async fn run(self) -> Result<()> {
        let listener = tcp::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Tunnel server listening on {}", listener.local_addr()?);

        let permits = Arc::new(Semaphore::new(self.limits.max_tunnels));
        let ctx = Arc::new(ServerContext {
            registry: self.registry,
            verifier: self.verifier,
            keepalive: self.keepalive,
            validation: validation_limits(&self.limits),
            limits: self.limits,
            shutdown: self.shutdown.clone(),
        });

        loop {
            let accepted = tokio::select! {
                accepted = tcp::accept(&listener) => accepted,
                () = self.shutdown.cancelled() => {
                    info!("Tunnel server shutting down");
                    return Ok(());
                }
            };

            match accepted {
                Ok((stream, addr)) => {
                    let Ok(permit) = permits.clone().try_acquire_owned() else {
                        warn!(
                            "Max tunnels ({}) reached, rejecting connection from {}",
                            ctx.limits.max_tunnels, addr
                        );
                        continue;
                    };

                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, ctx, permit).await {
                            warn!("Tunnel connection {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Decide whether a handshake may proceed to registration.
///
/// Order: token format, protocol version, route shape, route availability,
/// credentials. Duplicates are rejected before the verifier runs so a taken
/// route answers the same regardless of the presented credential.
fn check_handshake(handshake: &HandshakeFrame, ctx: &ServerContext) -> HandshakeStatus {
    if validate_token_format(&handshake.token, ctx.limits.max_token_len).is_err() {
        return HandshakeStatus::InvalidToken;
    }
    if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&handshake.version) {
        return HandshakeStatus::UnsupportedVersion;
    }
    if normalize_host(&handshake.host).is_none()
        || handshake
            .path_prefix
            .as_deref()
            .is_some_and(|p| p.chars().any(char::is_control))
    {
        return HandshakeStatus::InvalidRoute;
    }
    if ctx
        .registry
        .contains(&handshake.host, handshake.path_prefix.as_deref())
    {
        return HandshakeStatus::RouteTaken;
    }
    if ctx.verifier.verify(&handshake.token).is_err() {
        return HandshakeStatus::InvalidToken;
    }
    HandshakeStatus::Success
}

async fn reject(
    framed: &mut Framed<TcpStream, TunnelCodec>,
    status: HandshakeStatus,
) -> Result<()> {
    framed
        .send(Frame::HandshakeAck {
            session_id: Uuid::nil(),
            status,
        })
        .await?;
    Ok(())
}

async fn read_handshake(
    framed: &mut Framed<TcpStream, TunnelCodec>,
    ctx: &ServerContext,
) -> Result<HandshakeFrame> {
    let first = timeout(ctx.keepalive.handshake_timeout, framed.next())
        .await
        .map_err(|_| TunnelError::Timeout("handshake".into()))?;

    match first {
        Some(Ok(Frame::Handshake(handshake))) => Ok(*handshake),
        Some(Ok(other)) => Err(TunnelError::Protocol(format!(
            "expected handshake, got {}",
            other.event_name()
        ))),
        Some(Err(e)) => Err(e.into()),
        None => Err(TunnelError::Connection("closed before handshake".into())),
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    _permit: OwnedSemaphorePermit,
) -> Result<()> {
    let codec = TunnelCodec::with_max_frame_size(ctx.limits.max_frame_bytes as usize);
    let mut framed = Framed::new(stream, codec);

    // 1. Handshake
    let handshake = read_handshake(&mut framed, &ctx).await?;
    if let Err(e) = validate_frame(&Frame::Handshake(Box::new(handshake.clone())), &ctx.validation) {
        warn!("Oversized handshake from {}: {}", addr, e);
        return reject(&mut framed, HandshakeStatus::InvalidRoute).await;
    }

    let status = check_handshake(&handshake, &ctx);
    if status != HandshakeStatus::Success {
        warn!(
            "Rejecting tunnel from {} for {}{}: {:?}",
            addr,
            handshake.host,
            handshake.path_prefix.as_deref().unwrap_or(""),
            status
        );
        return reject(&mut framed, status).await;
    }

    // 2. Register. Frames queued by early exchanges wait in the sink until
    //    the writer task starts, which happens after the ack below.
    let HandshakeFrame {
        host, path_prefix, ..
    } = handshake;
    let session_id = Uuid::new_v4();
    let (sink, queue) = FrameSink::channel();
    let multiplexer = Multiplexer::gateway(sink.clone());
    let connection = TunnelConnection::new(
        session_id,
        host.clone(),
        path_prefix.clone(),
        addr,
        multiplexer.clone(),
    );

    if let Err(e) = ctx
        .registry
        .register(&host, path_prefix.as_deref(), session_id, connection)
    {
        warn!("Registration from {} lost the race: {}", addr, e);
        return reject(&mut framed, HandshakeStatus::RouteTaken).await;
    }

    if let Err(e) = framed
        .send(Frame::HandshakeAck {
            session_id,
            status: HandshakeStatus::Success,
        })
        .await
    {
        ctx.registry.release(&host, path_prefix.as_deref(), session_id);
        return Err(e.into());
    }

    info!(
        "Tunnel {} registered for {}{} from {}",
        session_id,
        host,
        path_prefix.as_deref().unwrap_or(""),
        addr
    );
    #[cfg(feature = "metrics")]
    if let Some(m) = wayport_observability::gateway_metrics() {
        m.tunnel_connections.inc();
    }

    // 3. Split into a reader and the writer task, keeping buffered bytes
    let parts = framed.into_parts();
    let (read_half, write_half) = tokio::io::split(parts.io);
    let mut reader = FramedRead::new(read_half, parts.codec);
    reader.read_buffer_mut().extend_from_slice(&parts.read_buf);
    let writer_task = tokio::spawn(run_frame_writer(queue, write_half, parts.codec));

    let result = read_loop(&mut reader, &multiplexer, &sink, &ctx).await;

    // 4. Teardown: unroute first so no new exchange picks this connection
    ctx.registry.release(&host, path_prefix.as_deref(), session_id);
    multiplexer.close();
    writer_task.abort();
    #[cfg(feature = "metrics")]
    if let Some(m) = wayport_observability::gateway_metrics() {
        m.tunnel_connections.dec();
    }

    match &result {
        Ok(()) => info!("Tunnel {} disconnected", session_id),
        Err(e) => warn!("Tunnel {} dropped: {}", session_id, e),
    }
    result
}

async fn read_loop(
    reader: &mut FramedRead<tokio::io::ReadHalf<TcpStream>, TunnelCodec>,
    multiplexer: &Multiplexer,
    sink: &FrameSink,
    ctx: &ServerContext,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            next = timeout(ctx.keepalive.idle_timeout, reader.next()) => next
                .map_err(|_| TunnelError::Timeout("no frames from tunnel client".into()))?,
            () = ctx.shutdown.cancelled() => return Ok(()),
        };

        let frame = match next {
            Some(frame) => frame?,
            None => return Ok(()),
        };

        if let Err(e) = validate_frame(&frame, &ctx.validation) {
            return Err(TunnelError::Protocol(e.to_string()));
        }

        match frame {
            Frame::Ping { timestamp } => sink.send(Frame::Pong { timestamp }).await?,
            Frame::Pong { .. } => debug!("Pong received"),
            Frame::Handshake(_) | Frame::HandshakeAck { .. } => {
                warn!("Ignoring repeated handshake frame");
            }
            frame => multiplexer.dispatch(frame),
        }
    }
}
