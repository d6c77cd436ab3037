use super::now_millis;
use crate::auth::validate_token_format;
use crate::stream::{InboundStream, IncomingRequest, Multiplexer, StreamWriter};
use crate::transport::{run_frame_writer, tcp, FrameSink};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::{Framed, FramedRead};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wayport_common::{KeepaliveConfig, LimitsConfig, Result, TunnelError};
use wayport_protocol::constants::PROTOCOL_VERSION;
use wayport_protocol::{
    Direction, Frame, HandshakeFrame, HandshakeStatus, HeaderList, RequestHead, RequestId,
    ResponseHead, TunnelCodec,
};

/// One request the gateway forwarded to this client
#[derive(Debug)]
pub struct IncomingExchange {
    pub request_id: RequestId,
    pub head: RequestHead,
    /// Request body as sent by the public caller
    pub body: InboundStream,
    pub responder: Responder,
}

/// Answers exactly one exchange.
///
/// Dropping a responder that never answered reports a `request-error` so the
/// gateway does not leave its public caller waiting.
#[derive(Debug)]
pub struct Responder {
    request_id: RequestId,
    mux: Multiplexer,
    responded: bool,
}

impl Responder {
    fn new(request_id: RequestId, mux: Multiplexer) -> Self {
        Self {
            request_id,
            mux,
            responded: false,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Send the status line and headers; the body follows on the returned writer
    pub async fn respond(mut self, head: ResponseHead) -> Result<StreamWriter> {
        self.responded = true;
        self.mux
            .sink()
            .send(Frame::Response {
                request_id: self.request_id,
                head: Box::new(head),
            })
            .await?;
        Ok(self.mux.writer(self.request_id, Direction::Response))
    }

    /// Report that the local service could not be reached
    pub async fn fail(mut self, message: impl Into<String>) -> Result<()> {
        self.responded = true;
        self.mux
            .sink()
            .send_and_drain(Frame::RequestError {
                request_id: self.request_id,
                message: message.into(),
            })
            .await
    }

    /// Accept a protocol upgrade. The response stream becomes duplex: bytes
    /// the gateway writes arrive on the returned reader.
    pub async fn upgrade(
        mut self,
        headers: HeaderList,
        http_version: impl Into<String>,
    ) -> Result<(StreamWriter, InboundStream)> {
        self.responded = true;
        let inbound = self.mux.subscribe(self.request_id, Direction::Response)?;
        self.mux
            .sink()
            .send(Frame::Response {
                request_id: self.request_id,
                head: Box::new(ResponseHead {
                    status_code: None,
                    status_message: None,
                    headers,
                    http_version: http_version.into(),
                }),
            })
            .await?;
        Ok((self.mux.writer(self.request_id, Direction::Response), inbound))
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.responded {
            let frame = Frame::RequestError {
                request_id: self.request_id,
                message: "request dropped by tunnel client".into(),
            };
            if !self.mux.sink().try_send(frame) {
                debug!("Could not report dropped request {}", self.request_id);
            }
        }
    }
}

/// Tunnel client: holds one control connection to the gateway and hands
/// every forwarded request to an application handler.
pub struct TunnelClient {
    server_addr: String,
    token: String,
    host: String,
    path_prefix: Option<String>,
    keepalive: KeepaliveConfig,
    limits: LimitsConfig,
    session_id: Option<Uuid>,
}

impl TunnelClient {
    pub fn new(server_addr: impl Into<String>, token: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            token: token.into(),
            host: host.into(),
            path_prefix: None,
            keepalive: KeepaliveConfig::default(),
            limits: LimitsConfig::default(),
            session_id: None,
        }
    }

    #[must_use]
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
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

    /// Session id assigned by the gateway on the last successful handshake
    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// Connect and serve until the control connection ends
    pub async fn connect_and_run<F, Fut>(&mut self, handler: F) -> Result<()>
    where
        F: Fn(IncomingExchange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.connect_and_run_with_callback(handler, |_| {}).await
    }

    /// Like [`connect_and_run`](Self::connect_and_run), calling `on_connected`
    /// once the gateway accepted the handshake
    pub async fn connect_and_run_with_callback<F, Fut, C>(
        &mut self,
        handler: F,
        on_connected: C,
    ) -> Result<()>
    where
        F: Fn(IncomingExchange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        C: FnOnce(Uuid) + Send + 'static,
    {
        validate_token_format(&self.token, self.limits.max_token_len)?;

        info!("Connecting to {}", self.server_addr);
        let stream = tcp::connect(self.server_addr.as_str()).await?;
        let codec = TunnelCodec::with_max_frame_size(self.limits.max_frame_bytes as usize);
        let mut framed = Framed::new(stream, codec);

        // 1. Handshake
        framed
            .send(Frame::Handshake(Box::new(HandshakeFrame {
                version: PROTOCOL_VERSION,
                token: self.token.clone(),
                host: self.host.clone(),
                path_prefix: self.path_prefix.clone(),
            })))
            .await?;

        let session_id = self.await_ack(&mut framed).await?;
        self.session_id = Some(session_id);
        info!(
            "Tunnel {} serving {}{}",
            session_id,
            self.host,
            self.path_prefix.as_deref().unwrap_or("")
        );
        on_connected(session_id);

        // 2. Writer task and accept loop
        let parts = framed.into_parts();
        let (read_half, write_half) = tokio::io::split(parts.io);
        let mut reader = FramedRead::new(read_half, parts.codec);
        reader.read_buffer_mut().extend_from_slice(&parts.read_buf);

        let (sink, queue) = FrameSink::channel();
        let writer_task = tokio::spawn(run_frame_writer(queue, write_half, parts.codec));
        let (mux, incoming) = Multiplexer::client(sink.clone());
        let mut session = SessionGuard {
            mux: mux.clone(),
            tasks: vec![writer_task.abort_handle()],
        };

        let handler = Arc::new(handler);
        let accept_mux = mux.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok(IncomingRequest {
                request_id,
                head,
                body,
            }) = incoming.recv().await
            {
                let exchange = IncomingExchange {
                    request_id,
                    head,
                    body,
                    responder: Responder::new(request_id, accept_mux.clone()),
                };
                let handler = handler.clone();
                tokio::spawn(async move { handler(exchange).await });
            }
        });
        session.tasks.push(accept_task.abort_handle());

        // 3. Keepalive and read loop
        let mut ping = interval(self.keepalive.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_frame = Instant::now();

        let result = loop {
            tokio::select! {
                _ = ping.tick() => {
                    if let Err(e) = sink.send(Frame::Ping { timestamp: now_millis() }).await {
                        break Err(e);
                    }
                }
                next = reader.next() => match next {
                    Some(Ok(frame)) => {
                        last_frame = Instant::now();
                        match frame {
                            Frame::Pong { .. } => debug!("Pong received"),
                            Frame::Ping { timestamp } => {
                                if let Err(e) = sink.send(Frame::Pong { timestamp }).await {
                                    break Err(e);
                                }
                            }
                            Frame::Handshake(_) | Frame::HandshakeAck { .. } => {
                                warn!("Ignoring handshake frame after registration");
                            }
                            frame => mux.dispatch(frame),
                        }
                    }
                    Some(Err(e)) => {
                        error!("Protocol error: {}", e);
                        break Err(e.into());
                    }
                    None => break Err(TunnelError::Connection("closed by gateway".into())),
                },
                () = sleep_until(last_frame + self.keepalive.idle_timeout) => {
                    break Err(TunnelError::Timeout("no frames from gateway".into()));
                }
            }
        };

        drop(session);
        result
    }

    async fn await_ack(&self, framed: &mut Framed<tokio::net::TcpStream, TunnelCodec>) -> Result<Uuid> {
        let ack = timeout(self.keepalive.handshake_timeout, framed.next())
            .await
            .map_err(|_| TunnelError::Timeout("handshake ack".into()))?;

        match ack {
            Some(Ok(Frame::HandshakeAck { session_id, status })) => match status {
                HandshakeStatus::Success => Ok(session_id),
                status => {
                    error!("Handshake rejected: {:?}", status);
                    Err(rejection_error(status, &self.host, self.path_prefix.as_deref()))
                }
            },
            Some(Ok(other)) => Err(TunnelError::Protocol(format!(
                "expected handshake ack, got {}",
                other.event_name()
            ))),
            Some(Err(e)) => Err(e.into()),
            None => Err(TunnelError::Connection("closed during handshake".into())),
        }
    }
}

/// Tears a session down however `connect_and_run` exits, including when its
/// future is dropped mid-flight
struct SessionGuard {
    mux: Multiplexer,
    tasks: Vec<AbortHandle>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.mux.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn rejection_error(status: HandshakeStatus, host: &str, prefix: Option<&str>) -> TunnelError {
    match status {
        HandshakeStatus::RouteTaken => {
            TunnelError::DuplicateRegistration(format!("{host}{}", prefix.unwrap_or("")))
        }
        HandshakeStatus::UnsupportedVersion => {
            TunnelError::Protocol("gateway does not support this protocol version".into())
        }
        HandshakeStatus::InvalidRoute => {
            TunnelError::Config(format!("gateway rejected route {host}{}", prefix.unwrap_or("")))
        }
        HandshakeStatus::InvalidToken | HandshakeStatus::Success => {
            TunnelError::Authentication("gateway rejected the token".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    type GatewaySide = Framed<tokio::net::TcpStream, TunnelCodec>;

    async fn fake_gateway() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    async fn accept_handshake(listener: &TcpListener, status: HandshakeStatus) -> (GatewaySide, HandshakeFrame) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, TunnelCodec::new());
        let Some(Ok(Frame::Handshake(handshake))) = framed.next().await else {
            panic!("expected handshake");
        };
        framed
            .send(Frame::HandshakeAck {
                session_id: Uuid::new_v4(),
                status,
            })
            .await
            .unwrap();
        (framed, *handshake)
    }

    /// Next frame that is not keepalive traffic
    async fn next_stream_frame(framed: &mut GatewaySide) -> Frame {
        loop {
            match framed.next().await.unwrap().unwrap() {
                Frame::Ping { .. } => {}
                frame => return frame,
            }
        }
    }

    #[tokio::test]
    async fn test_route_taken_maps_to_duplicate_registration() {
        let (listener, addr) = fake_gateway().await;
        let gateway = tokio::spawn(async move {
            let (_framed, handshake) = accept_handshake(&listener, HandshakeStatus::RouteTaken).await;
            handshake
        });

        let mut client = TunnelClient::new(addr, "token", "a.test").with_path_prefix("/api");
        let err = client.connect_and_run(|_| async {}).await.unwrap_err();
        assert!(matches!(err, TunnelError::DuplicateRegistration(_)));

        let handshake = gateway.await.unwrap();
        assert_eq!(handshake.host, "a.test");
        assert_eq!(handshake.path_prefix.as_deref(), Some("/api"));
        assert_eq!(handshake.version, PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_invalid_token_maps_to_authentication() {
        let (listener, addr) = fake_gateway().await;
        tokio::spawn(async move {
            let _ = accept_handshake(&listener, HandshakeStatus::InvalidToken).await;
        });

        let mut client = TunnelClient::new(addr, "token", "a.test");
        let err = client.connect_and_run(|_| async {}).await.unwrap_err();
        assert!(matches!(err, TunnelError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_request_answered_through_responder() {
        let (listener, addr) = fake_gateway().await;
        let gateway = tokio::spawn(async move {
            let (mut framed, _) = accept_handshake(&listener, HandshakeStatus::Success).await;
            let request_id = RequestId::generate();
            framed
                .send(Frame::Request {
                    request_id,
                    head: Box::new(RequestHead {
                        method: "POST".into(),
                        path: "/echo".into(),
                        headers: vec![],
                    }),
                })
                .await
                .unwrap();
            framed
                .send(Direction::Request.pipe(request_id, Bytes::from("hello")))
                .await
                .unwrap();
            framed.send(Direction::Request.end(request_id)).await.unwrap();

            let Frame::Response { request_id: rid, head } = next_stream_frame(&mut framed).await else {
                panic!("expected response head");
            };
            assert_eq!(rid, request_id);
            assert_eq!(head.status_code, Some(200));
            assert_eq!(
                next_stream_frame(&mut framed).await,
                Frame::ResponsePipeEnd {
                    request_id,
                    chunk: Some(Bytes::from("hello")),
                }
            );
        });

        let mut client = TunnelClient::new(addr, "token", "a.test");
        let run = tokio::spawn(async move {
            client
                .connect_and_run(|mut exchange: IncomingExchange| async move {
                    let mut body = Vec::new();
                    while let Ok(Some(chunk)) = exchange.body.next_chunk().await {
                        body.extend_from_slice(&chunk);
                    }
                    let head = ResponseHead {
                        status_code: Some(200),
                        status_message: Some("OK".into()),
                        headers: vec![],
                        http_version: "1.1".into(),
                    };
                    let mut writer = exchange.responder.respond(head).await.unwrap();
                    writer.end_with(Bytes::from(body)).await.unwrap();
                })
                .await
        });

        gateway.await.unwrap();
        // The fake gateway hung up, so the client loop ends
        assert!(run.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_dropped_responder_reports_request_error() {
        let (listener, addr) = fake_gateway().await;
        let gateway = tokio::spawn(async move {
            let (mut framed, _) = accept_handshake(&listener, HandshakeStatus::Success).await;
            let request_id = RequestId::generate();
            framed
                .send(Frame::Request {
                    request_id,
                    head: Box::new(RequestHead {
                        method: "GET".into(),
                        path: "/".into(),
                        headers: vec![],
                    }),
                })
                .await
                .unwrap();
            let frame = next_stream_frame(&mut framed).await;
            assert!(matches!(frame, Frame::RequestError { request_id: rid, .. } if rid == request_id));
        });

        let mut client = TunnelClient::new(addr, "token", "a.test");
        let run = tokio::spawn(async move { client.connect_and_run(|_exchange| async {}).await });

        gateway.await.unwrap();
        run.abort();
    }
}
