use crate::exchange::{status_response, BoxBody, Gateway};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wayport_common::Result;
use wayport_core::auth::{constant_time_eq, issue_token};
use wayport_core::registry::normalize_host;
use wayport_core::transport::tcp;
use wayport_core::TunnelRegistry;

const JWT_GENERATOR_PATH: &str = "/tunnel_jwt_generator";

/// Credentials for the token generator endpoint
#[derive(Debug, Clone)]
pub struct JwtGenerator {
    pub username: String,
    pub password: String,
    pub secret_key: String,
    pub verify_token: String,
}

/// Public ingress limits and behavior
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Maximum concurrent public connections (default: 10000)
    pub max_connections: usize,
    /// Value sent as `x-forwarded-proto`
    pub forwarded_proto: String,
    /// Deadline for the tunnel client's response head (default: none)
    pub response_timeout: Option<Duration>,
    /// Serves `GET /tunnel_jwt_generator` when set
    pub jwt_generator: Option<JwtGenerator>,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            forwarded_proto: "http".to_string(),
            response_timeout: None,
            jwt_generator: None,
        }
    }
}

/// Public HTTP/1.1 listener in front of the tunnels
pub struct HttpIngress {
    addr: SocketAddr,
    gateway: Gateway,
    jwt_generator: Option<Arc<JwtGenerator>>,
    connection_semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl HttpIngress {
    pub fn new(addr: SocketAddr, registry: TunnelRegistry) -> Self {
        Self::with_config(addr, registry, IngressConfig::default())
    }

    pub fn with_config(addr: SocketAddr, registry: TunnelRegistry, config: IngressConfig) -> Self {
        let gateway = Gateway::new(registry)
            .with_forwarded_proto(config.forwarded_proto)
            .with_response_timeout(config.response_timeout);
        Self {
            addr,
            gateway,
            jwt_generator: config.jwt_generator.map(Arc::new),
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop accepting when `token` is cancelled
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub async fn start(self) -> Result<()> {
        let listener = tcp::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("HTTP ingress listening on {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                accepted = tcp::accept(&listener) => accepted,
                () = self.shutdown.cancelled() => {
                    info!("HTTP ingress shutting down");
                    return Ok(());
                }
            };
            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };

            let Ok(permit) = self.connection_semaphore.clone().try_acquire_owned() else {
                warn!("Max connections reached, rejecting connection from {}", peer_addr);
                continue;
            };

            let gateway = self.gateway.clone();
            let generator = self.jwt_generator.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let service = service_fn(move |req| {
                    let gateway = gateway.clone();
                    let generator = generator.clone();
                    async move {
                        Ok::<_, Infallible>(route(req, peer_addr, &gateway, generator.as_deref()).await)
                    }
                });
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    debug!("Public connection {} ended: {}", peer_addr, err);
                }
            });
        }
    }
}

async fn route(
    req: Request<Incoming>,
    peer: SocketAddr,
    gateway: &Gateway,
    generator: Option<&JwtGenerator>,
) -> Response<BoxBody> {
    if req.method() == Method::GET && req.uri().path() == JWT_GENERATOR_PATH {
        return generate_token(req.uri().query(), generator);
    }

    let raw_host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host());
    let Some(host) = raw_host.and_then(normalize_host) else {
        return status_response(StatusCode::BAD_REQUEST, "Missing or invalid Host header");
    };

    gateway.handle(req, &host, peer).await
}

#[derive(Debug, Default, Deserialize)]
struct GeneratorQuery {
    username: Option<String>,
    password: Option<String>,
}

fn generate_token(query: Option<&str>, generator: Option<&JwtGenerator>) -> Response<BoxBody> {
    let Some(generator) = generator else {
        return status_response(StatusCode::NOT_FOUND, "Not found");
    };
    let query: GeneratorQuery = serde_urlencoded::from_str(query.unwrap_or("")).unwrap_or_default();

    let matches = |given: Option<&String>, expected: &str| {
        given.is_some_and(|g| constant_time_eq(g.as_bytes(), expected.as_bytes()))
    };
    if !(matches(query.username.as_ref(), &generator.username)
        && matches(query.password.as_ref(), &generator.password))
    {
        return status_response(StatusCode::UNAUTHORIZED, "Forbidden");
    }

    match issue_token(&generator.secret_key, &generator.verify_token, None) {
        Ok(token) => {
            let mut response = Response::new(
                Full::new(Bytes::from(token))
                    .map_err(|never| match never {})
                    .boxed_unsync(),
            );
            *response.status_mut() = StatusCode::OK;
            response
        }
        Err(e) => {
            error!("Failed to sign token: {}", e);
            status_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayport_core::auth::{JwtVerifier, TokenVerifier};

    fn generator() -> JwtGenerator {
        JwtGenerator {
            username: "admin".into(),
            password: "hunter2".into(),
            secret_key: "secret".into(),
            verify_token: "verify".into(),
        }
    }

    #[tokio::test]
    async fn test_generator_issues_valid_token() {
        let response = generate_token(Some("username=admin&password=hunter2"), Some(&generator()));
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let token = String::from_utf8(body.to_vec()).unwrap();
        assert!(JwtVerifier::new("secret", "verify").verify(&token).is_ok());
    }

    #[test]
    fn test_generator_rejects_bad_credentials() {
        let response = generate_token(Some("username=admin&password=nope"), Some(&generator()));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = generate_token(None, Some(&generator()));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_generator_hidden_when_unconfigured() {
        let response = generate_token(Some("username=admin&password=hunter2"), None);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_generator_decodes_query() {
        let mut g = generator();
        g.password = "a b&c".into();
        let response = generate_token(Some("username=admin&password=a+b%26c"), Some(&g));
        assert_eq!(response.status(), StatusCode::OK);
    }
}
