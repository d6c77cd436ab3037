//! Gateway exchange orchestration
//!
//! Turns one public HTTP request into one exchange on the tunnel connection
//! that owns its route: the request body is pumped into the request stream,
//! the response stream is relayed back, and upgrades switch to a duplex relay
//! over the upgraded socket. Every exit path releases the exchange's
//! subscriptions, either explicitly or by dropping the stream handles.

use crate::headers::{add_forwarded_headers, is_upgrade_request, strip_hop_by_hop, to_header_list, to_header_map};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::ext::ReasonPhrase;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wayport_common::TunnelError;
use wayport_core::stream::{relay_duplex, InboundEvent, InboundStream, StreamWriter};
use wayport_core::TunnelRegistry;
use wayport_protocol::{Direction, RequestHead, ResponseHead};

/// Body of every response the gateway produces
pub type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, TunnelError>;

/// Relays public requests to tunnel clients
#[derive(Debug, Clone)]
pub struct Gateway {
    registry: TunnelRegistry,
    forwarded_proto: Arc<str>,
    response_timeout: Option<Duration>,
}

impl Gateway {
    pub fn new(registry: TunnelRegistry) -> Self {
        Self {
            registry,
            forwarded_proto: Arc::from("http"),
            response_timeout: None,
        }
    }

    /// Value of `x-forwarded-proto` (set to `https` behind a TLS terminator)
    #[must_use]
    pub fn with_forwarded_proto(mut self, proto: impl Into<String>) -> Self {
        self.forwarded_proto = Arc::from(proto.into());
        self
    }

    /// Give up on a response head that takes longer than `timeout` (504).
    /// Without one, the gateway waits as long as the tunnel stays connected.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// Relay one public request addressed to `host`
    pub async fn handle<B>(&self, mut req: Request<B>, host: &str, peer: SocketAddr) -> Response<BoxBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Display + Send,
    {
        let path = req
            .uri()
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());

        let Some(connection) = self.registry.resolve(host, &path) else {
            info!("No tunnel for {}{}", host, path);
            let mut guard = ExchangeGuard::start();
            guard.outcome("not_found");
            #[cfg(feature = "metrics")]
            if let Some(m) = wayport_observability::gateway_metrics() {
                m.routing_misses.inc();
            }
            let err = TunnelError::RoutingMiss {
                host: host.to_string(),
                path,
            };
            return error_response(&err);
        };

        let mut guard = ExchangeGuard::start();
        let upgrade = is_upgrade_request(req.headers());
        let on_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        add_forwarded_headers(&mut headers, peer.ip(), &self.forwarded_proto);
        let head = RequestHead {
            method: parts.method.as_str().to_string(),
            path,
            headers: to_header_list(&headers),
        };

        let exchange = match connection.open_exchange(head).await {
            Ok(exchange) => exchange,
            Err(e) => {
                warn!("Could not open exchange on tunnel {}: {}", connection.id(), e);
                guard.outcome("error");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR, "Tunnel unavailable");
            }
        };
        let request_id = exchange.request_id;
        debug!("Exchange {} opened on tunnel {}", request_id, connection.id());

        let cancel = CancellationToken::new();
        tokio::spawn(pump_request_body(body, exchange.request, cancel.clone()));

        let mut response = exchange.response;
        let head = match head_within(self.response_timeout, &mut response).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                warn!("Exchange {} failed before response: {}", request_id, e);
                cancel.cancel();
                guard.outcome(outcome_of(&e));
                return error_response(&e);
            }
            Err(_) => {
                warn!("Exchange {} timed out waiting for a response", request_id);
                cancel.cancel();
                guard.outcome("timeout");
                return error_response(&TunnelError::Timeout("response head".into()));
            }
        };

        match (head.status_code, on_upgrade) {
            (None, Some(on_upgrade)) => {
                let writer = connection.multiplexer().writer(request_id, Direction::Response);
                guard.outcome("upgrade");
                tokio::spawn(async move {
                    let _guard = guard;
                    match on_upgrade.await {
                        Ok(upgraded) => {
                            match relay_duplex(TokioIo::new(upgraded), response, writer).await {
                                Ok(stats) => debug!(
                                    "Upgrade {} closed ({} bytes up, {} bytes down)",
                                    request_id, stats.to_tunnel, stats.from_tunnel
                                ),
                                Err(e) => debug!("Upgrade {} ended: {}", request_id, e),
                            }
                        }
                        // Dropping the writer tells the tunnel client to close its side
                        Err(e) => warn!("Public upgrade of {} failed: {}", request_id, e),
                    }
                });
                switching_protocols(&head)
            }
            (None, None) => {
                warn!("Tunnel answered {} with an upgrade it was not asked for", request_id);
                cancel.cancel();
                guard.outcome("upstream_error");
                status_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
            (Some(code), _) => {
                let Ok(status) = StatusCode::from_u16(code) else {
                    warn!("Tunnel answered {} with invalid status {}", request_id, code);
                    cancel.cancel();
                    guard.outcome("upstream_error");
                    return status_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
                };
                guard.outcome("ok");
                relayed_response(status, &head, response, guard)
            }
        }
    }
}

/// Wait for the response head; any terminal event before it fails the exchange
async fn await_head(response: &mut InboundStream) -> Result<Box<ResponseHead>, TunnelError> {
    match response.recv().await {
        Some(InboundEvent::Head(head)) => Ok(head),
        Some(InboundEvent::Data(_)) => Err(TunnelError::StreamAbort("body before response head".into())),
        Some(InboundEvent::End) => Err(TunnelError::StreamAbort("response ended before head".into())),
        Some(event) => Err(event.into_error().unwrap_or(TunnelError::PeerDisconnected)),
        None => Err(TunnelError::PeerDisconnected),
    }
}

/// [`await_head`] bounded by the optional response timeout
async fn head_within(
    limit: Option<Duration>,
    response: &mut InboundStream,
) -> Result<Result<Box<ResponseHead>, TunnelError>, tokio::time::error::Elapsed> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, await_head(response)).await,
        None => Ok(await_head(response).await),
    }
}

/// Copy the public request body into the request stream
async fn pump_request_body<B>(mut body: B, mut writer: StreamWriter, cancel: CancellationToken)
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display + Send,
{
    loop {
        let frame = tokio::select! {
            frame = body.frame() => frame,
            () = cancel.cancelled() => {
                let _ = writer.abort("exchange cancelled").await;
                return;
            }
        };
        let result = match frame {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(chunk) => writer.write(chunk).await,
                // Trailers are not relayed
                Err(_) => Ok(()),
            },
            Some(Err(e)) => {
                let reason = e.to_string();
                let _ = writer.abort(reason).await;
                return;
            }
            None => {
                let _ = writer.end().await;
                return;
            }
        };
        if let Err(e) = result {
            debug!("Request body of {} not relayed: {}", writer.request_id(), e);
            return;
        }
    }
}

fn relayed_response(
    status: StatusCode,
    head: &ResponseHead,
    inbound: InboundStream,
    guard: ExchangeGuard,
) -> Response<BoxBody> {
    let stream = futures::stream::unfold(Some((inbound, guard)), |state| async move {
        let (mut inbound, guard) = state?;
        match inbound.next_chunk().await {
            Ok(Some(chunk)) => Some((Ok(Frame::data(chunk)), Some((inbound, guard)))),
            Ok(None) => None,
            Err(e) => {
                warn!("Response body of {} interrupted: {}", inbound.request_id(), e);
                Some((Err(e), None))
            }
        }
    });

    let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
    *response.status_mut() = status;
    *response.headers_mut() = to_header_map(&head.headers);
    strip_hop_by_hop(response.headers_mut());
    set_reason(&mut response, status, head.status_message.as_deref());
    response
}

fn switching_protocols(head: &ResponseHead) -> Response<BoxBody> {
    let mut response = Response::new(Empty::new().map_err(|never| match never {}).boxed_unsync());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = to_header_map(&head.headers);
    response
}

/// Keep a non-canonical status message from the local service
fn set_reason<B>(response: &mut Response<B>, status: StatusCode, message: Option<&str>) {
    let Some(message) = message else { return };
    if status.canonical_reason() == Some(message) || message.is_empty() {
        return;
    }
    if let Ok(reason) = ReasonPhrase::try_from(message.as_bytes()) {
        response.extensions_mut().insert(reason);
    }
}

/// Plain-text response for a failed exchange
pub fn error_response(err: &TunnelError) -> Response<BoxBody> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = match err {
        TunnelError::RoutingMiss { .. } => "Not Found",
        TunnelError::UpstreamUnreachable(_) | TunnelError::StreamAbort(_) => "Bad Gateway",
        TunnelError::Timeout(_) => "Gateway Timeout",
        _ => "Internal Server Error",
    };
    status_response(status, message)
}

pub fn status_response(status: StatusCode, body: &'static str) -> Response<BoxBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(body.as_bytes()))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    response
}

fn outcome_of(err: &TunnelError) -> &'static str {
    match err {
        TunnelError::UpstreamUnreachable(_) | TunnelError::StreamAbort(_) => "upstream_error",
        TunnelError::PeerDisconnected => "disconnected",
        _ => "error",
    }
}

/// Tracks one exchange in the gateway metrics until dropped
#[derive(Debug)]
struct ExchangeGuard {
    outcome: &'static str,
}

impl ExchangeGuard {
    fn start() -> Self {
        #[cfg(feature = "metrics")]
        if let Some(m) = wayport_observability::gateway_metrics() {
            m.active_exchanges.inc();
        }
        Self { outcome: "error" }
    }

    fn outcome(&mut self, outcome: &'static str) {
        self.outcome = outcome;
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        #[cfg(feature = "metrics")]
        if let Some(m) = wayport_observability::gateway_metrics() {
            m.active_exchanges.dec();
            m.record_outcome(self.outcome);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = self.outcome;
    }
}
