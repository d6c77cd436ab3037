//! Tunnel-client side: replay forwarded requests against a local service

use crate::headers::{to_header_list, to_header_map};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http1;
use hyper::ext::ReasonPhrase;
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use wayport_common::TunnelError;
use wayport_core::stream::{relay_duplex, InboundStream, StreamWriter};
use wayport_core::transport::tcp;
use wayport_core::IncomingExchange;
use wayport_protocol::{HeaderList, RequestHead, ResponseHead};

type RequestBody = http_body_util::combinators::UnsyncBoxBody<Bytes, TunnelError>;

/// Forwards every exchange to one local HTTP service over a fresh connection
#[derive(Debug, Clone)]
pub struct LocalProxy {
    target: Arc<str>,
    connect_timeout: Duration,
}

impl LocalProxy {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: Arc::from(target.into()),
            connect_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Serve one exchange; failures reach the gateway as `request-error`
    pub async fn handle(&self, exchange: IncomingExchange) {
        let IncomingExchange {
            request_id,
            head,
            body,
            responder,
        } = exchange;

        let response = match self.send(head, body).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Local request {} to {} failed: {}", request_id, self.target, e);
                if let Err(e) = responder.fail(e.to_string()).await {
                    debug!("Could not report failure of {}: {}", request_id, e);
                }
                return;
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let headers = to_header_list(response.headers());
            let version = version_string(response.version());
            let (writer, inbound) = match responder.upgrade(headers, version).await {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("Upgrade {} not forwarded: {}", request_id, e);
                    return;
                }
            };
            match hyper::upgrade::on(response).await {
                Ok(upgraded) => {
                    if let Err(e) = relay_duplex(TokioIo::new(upgraded), inbound, writer).await {
                        debug!("Upgrade {} ended: {}", request_id, e);
                    }
                }
                // Dropping the writer aborts the gateway's side
                Err(e) => warn!("Local upgrade of {} failed: {}", request_id, e),
            }
            return;
        }

        let head = ResponseHead {
            status_code: Some(response.status().as_u16()),
            status_message: status_message(&response),
            headers: to_header_list(response.headers()),
            http_version: version_string(response.version()).to_string(),
        };
        let writer = match responder.respond(head).await {
            Ok(writer) => writer,
            Err(e) => {
                debug!("Response {} not forwarded: {}", request_id, e);
                return;
            }
        };
        pump_response_body(response.into_body(), writer).await;
    }

    async fn send(&self, head: RequestHead, body: InboundStream) -> Result<Response<Incoming>, TunnelError> {
        let stream = timeout(self.connect_timeout, tcp::connect(&*self.target))
            .await
            .map_err(|_| TunnelError::UpstreamUnreachable(format!("connect to {} timed out", self.target)))?
            .map_err(|e| TunnelError::UpstreamUnreachable(format!("connect to {}: {e}", self.target)))?;

        let (mut sender, conn) = http1::handshake::<_, RequestBody>(TokioIo::new(stream))
            .await
            .map_err(|e| TunnelError::UpstreamUnreachable(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Local connection ended: {}", e);
            }
        });

        let body = if declares_body(&head.headers) {
            request_body(body)
        } else {
            // No framing headers means no body; a chunked terminator would
            // corrupt an upgraded connection
            drop(body);
            Empty::new().map_err(|never| match never {}).boxed_unsync()
        };
        let mut request = Request::new(body);
        *request.method_mut() = head
            .method
            .parse()
            .map_err(|_| TunnelError::Protocol(format!("invalid method {}", head.method)))?;
        *request.uri_mut() = head
            .path
            .parse()
            .map_err(|_| TunnelError::Protocol(format!("invalid path {}", head.path)))?;
        *request.headers_mut() = to_header_map(&head.headers);

        sender
            .send_request(request)
            .await
            .map_err(|e| TunnelError::UpstreamUnreachable(e.to_string()))
    }
}

/// The reason phrase the local service sent, or the canonical one
fn status_message<B>(response: &Response<B>) -> Option<String> {
    response
        .extensions()
        .get::<ReasonPhrase>()
        .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
        .or_else(|| response.status().canonical_reason().map(str::to_string))
}

fn declares_body(headers: &HeaderList) -> bool {
    headers.iter().any(|(name, _)| {
        name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
    })
}

/// Request body fed from the exchange's request stream. A `request-pipe-error`
/// from the gateway surfaces as a body error, which aborts the local call.
fn request_body(inbound: InboundStream) -> RequestBody {
    let stream = futures::stream::unfold(Some(inbound), |state| async move {
        let mut inbound = state?;
        match inbound.next_chunk().await {
            Ok(Some(chunk)) => Some((Ok(Frame::data(chunk)), Some(inbound))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    });
    StreamBody::new(stream).boxed_unsync()
}

async fn pump_response_body(mut body: Incoming, mut writer: StreamWriter) {
    loop {
        let result = match body.frame().await {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(chunk) => writer.write(chunk).await,
                Err(_) => Ok(()),
            },
            Some(Err(e)) => {
                let _ = writer.abort(e.to_string()).await;
                return;
            }
            None => {
                let _ = writer.end().await;
                return;
            }
        };
        if let Err(e) = result {
            debug!("Response body of {} not relayed: {}", writer.request_id(), e);
            return;
        }
    }
}

fn version_string(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}
