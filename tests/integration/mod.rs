#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for `Wayport`
//!
//! Every test runs a real gateway, real tunnel clients and local services on
//! loopback ports chosen by the OS.

mod error_test;
mod routing_test;
mod tunnel_test;
mod websocket_test;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use wayport::{Client, Server, ServerBuilder};

pub const SECRET_KEY: &str = "integration-secret";
pub const VERIFY_TOKEN: &str = "integration-verify";
pub const GENERATOR_USER: &str = "admin";
pub const GENERATOR_PASSWORD: &str = "hunter2";

/// A running gateway on two loopback listeners
pub struct TestGateway {
    pub tunnel_addr: SocketAddr,
    pub http_addr: SocketAddr,
    server: Arc<Server>,
}

impl TestGateway {
    /// JWT authentication with the token generator enabled
    pub async fn start() -> Self {
        Self::start_with(
            Server::builder()
                .jwt(SECRET_KEY, VERIFY_TOKEN)
                .jwt_generator(GENERATOR_USER, GENERATOR_PASSWORD)
                .response_timeout(Duration::from_secs(10)),
        )
        .await
    }

    pub async fn start_with(builder: ServerBuilder) -> Self {
        let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel_addr = tunnel.local_addr().unwrap();
        let http_addr = http.local_addr().unwrap();

        let server = Arc::new(builder.build().expect("valid gateway config"));
        let running = server.clone();
        tokio::spawn(async move {
            let _ = running.serve(tunnel, http).await;
        });

        Self {
            tunnel_addr,
            http_addr,
            server,
        }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }

    /// Start a tunnel client serving `host`/`prefix` from `local`
    pub async fn connect(&self, host: &str, prefix: Option<&str>, local: SocketAddr) -> Client {
        let mut client = self.client(host, prefix, local, &valid_token());
        client.start().await.expect("tunnel client should connect");
        client
    }

    /// Build, but do not start, a client that gives up on the first failure
    pub fn client(&self, host: &str, prefix: Option<&str>, local: SocketAddr, token: &str) -> Client {
        let mut builder = Client::builder()
            .server_addr(self.tunnel_addr.to_string())
            .token(token)
            .host(host)
            .local_addr(local.to_string())
            .auto_reconnect(false);
        if let Some(prefix) = prefix {
            builder = builder.path_prefix(prefix);
        }
        builder.build().expect("valid client config")
    }

    /// GET `path` on the public listener with the given Host header
    pub async fn get(&self, host: &str, path: &str) -> reqwest::Response {
        make_client()
            .get(self.url(path))
            .header(reqwest::header::HOST, host)
            .send()
            .await
            .expect("public request should complete")
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.server.stop();
    }
}

pub fn valid_token() -> String {
    wayport_core::issue_token(SECRET_KEY, VERIFY_TOKEN, None).unwrap()
}

/// Create a reqwest client configured for testing (no proxy, direct connection)
pub fn make_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(15))
        .build()
        .expect("Failed to build reqwest client")
}

/// Local HTTP service that names itself in every answer.
///
/// `GET` answers `"{name} {method} {path}"`; a request with a body gets the
/// body echoed back. Forwarding headers it received are reflected as
/// `x-seen-*` response headers. `/status/{code}` answers with that status.
pub async fn start_named_service(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            tokio::spawn(async move {
                let service = service_fn(move |req| answer(name, req));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

async fn answer(
    name: &'static str,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(ToString::to_string)
        .unwrap_or_default();
    let seen = |header: &str| {
        req.headers()
            .get(header)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let seen_for = seen("x-forwarded-for");
    let seen_host = seen("x-forwarded-host");
    let seen_proto = seen("x-forwarded-proto");
    let seen_port = seen("x-forwarded-port");

    let status = path
        .strip_prefix("/status/")
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(200);

    let body = req.into_body().collect().await?.to_bytes();
    let body = if body.is_empty() {
        Bytes::from(format!("{name} {method} {path}"))
    } else {
        body
    };

    Ok(Response::builder()
        .status(status)
        .header("x-served-by", name)
        .header("x-seen-forwarded-for", seen_for)
        .header("x-seen-forwarded-host", seen_host)
        .header("x-seen-forwarded-proto", seen_proto)
        .header("x-seen-forwarded-port", seen_port)
        .body(Full::new(body))
        .unwrap())
}

/// Local WebSocket service that echoes every data message
pub async fn start_ws_echo_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Local service that accepts connections and never answers
pub async fn start_silent_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

/// Local service that answers every request with the same raw HTTP response
pub async fn start_raw_service(response: &'static [u8]) -> SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(response).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// An address nothing listens on
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
