//! Server subcommand implementation

use anyhow::{bail, Result};
use clap::Args;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};
use wayport::Server;
use wayport_common::constants::{DEFAULT_HTTP_BIND, DEFAULT_TUNNEL_BIND};
use wayport_common::LimitsConfig;
use wayport_observability::{
    gather_metrics, init_basic_observability, init_minimal_logging, shutdown_tracing,
};

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Control listener for tunnel clients
    #[arg(long, default_value = DEFAULT_TUNNEL_BIND, env = "WAYPORT_BIND")]
    bind: SocketAddr,

    /// Public HTTP listener
    #[arg(long, default_value = DEFAULT_HTTP_BIND, env = "WAYPORT_HTTP_BIND")]
    http_bind: SocketAddr,

    /// HS256 secret used to verify client JWTs
    #[arg(long, env = "WAYPORT_SECRET_KEY", hide_env_values = true, requires = "verify_token")]
    secret_key: Option<String>,

    /// Value the JWT `token` claim must carry
    #[arg(long, env = "WAYPORT_VERIFY_TOKEN", hide_env_values = true, requires = "secret_key")]
    verify_token: Option<String>,

    /// Shared static token, instead of JWTs
    #[arg(long, env = "WAYPORT_TOKEN", hide_env_values = true, conflicts_with = "secret_key")]
    token: Option<String>,

    /// Username for GET /tunnel_jwt_generator
    #[arg(
        long,
        env = "WAYPORT_JWT_GENERATOR_USERNAME",
        requires = "jwt_generator_password"
    )]
    jwt_generator_username: Option<String>,

    /// Password for GET /tunnel_jwt_generator
    #[arg(
        long,
        env = "WAYPORT_JWT_GENERATOR_PASSWORD",
        hide_env_values = true,
        requires = "jwt_generator_username"
    )]
    jwt_generator_password: Option<String>,

    /// Value of x-forwarded-proto on relayed requests
    #[arg(long, default_value = "http", value_parser = ["http", "https"], env = "WAYPORT_FORWARDED_PROTO")]
    forwarded_proto: String,

    /// Maximum concurrent tunnel connections
    #[arg(long, default_value_t = 1000, env = "WAYPORT_MAX_TUNNELS")]
    max_tunnels: usize,

    /// Seconds to wait for a tunnel client's response head before answering
    /// 504 (default: wait while the tunnel is connected)
    #[arg(long, env = "WAYPORT_RESPONSE_TIMEOUT")]
    response_timeout: Option<u64>,

    /// Metrics bind address
    #[arg(long, default_value = "0.0.0.0:9090", env = "WAYPORT_METRICS_BIND")]
    metrics_bind: SocketAddr,

    /// Enable tracing export (metrics is separate via --metrics)
    #[arg(long, env = "WAYPORT_OBSERVABILITY")]
    observability: bool,

    /// Enable the metrics endpoint
    #[arg(long, env = "WAYPORT_METRICS")]
    metrics: bool,
}

impl ServerArgs {
    fn build_server(&self) -> Result<Server> {
        let mut builder = Server::builder()
            .bind(self.bind)
            .http_bind(self.http_bind)
            .forwarded_proto(&self.forwarded_proto)
            .limits(LimitsConfig {
                max_tunnels: self.max_tunnels,
                ..LimitsConfig::default()
            });
        if let Some(secs) = self.response_timeout {
            builder = builder.response_timeout(Duration::from_secs(secs));
        }

        builder = match (&self.secret_key, &self.verify_token, &self.token) {
            (Some(secret_key), Some(verify_token), _) => builder.jwt(secret_key, verify_token),
            (_, _, Some(token)) => builder.token(token),
            _ => bail!("set --secret-key and --verify-token, or --token"),
        };
        if let (Some(username), Some(password)) =
            (&self.jwt_generator_username, &self.jwt_generator_password)
        {
            builder = builder.jwt_generator(username, password);
        }

        Ok(builder.build()?)
    }
}

pub async fn run(args: ServerArgs) -> Result<()> {
    if args.observability || args.metrics {
        init_basic_observability("wayport-server", args.observability, args.metrics);
    } else {
        init_minimal_logging();
    }

    let server = args.build_server()?;

    if args.metrics {
        let metrics_addr = args.metrics_bind;
        tokio::spawn(async move {
            use axum::{routing::get, Router};
            let app = Router::new()
                .route("/metrics", get(|| async { gather_metrics() }))
                .route("/health/ready", get(|| async { "OK" }));
            info!("Metrics server listening on http://{}", metrics_addr);
            match tokio::net::TcpListener::bind(metrics_addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app).await {
                        error!("Metrics server error: {}", e);
                    }
                }
                Err(e) => error!("Failed to bind metrics server to {}: {}", metrics_addr, e),
            }
        });
    }

    info!("Starting Wayport gateway v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            shutdown.cancel();
        }
    });

    let result = server.start().await;
    shutdown_tracing();
    Ok(result?)
}
