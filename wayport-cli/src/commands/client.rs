//! Client subcommand implementation

use anyhow::{Context, Result};
use clap::Args;
use std::time::Duration;
use tracing::info;
use wayport::Client;
use wayport_common::constants::DEFAULT_LOCAL_ADDR;
use wayport_observability::{init_basic_observability, init_minimal_logging, shutdown_tracing};

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Gateway control address (host:port)
    #[arg(long, env = "WAYPORT_SERVER")]
    server: String,

    /// Authentication token or JWT. Prompted for when omitted.
    #[arg(long, env = "WAYPORT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Public host to serve
    #[arg(long, env = "WAYPORT_HOST")]
    host: String,

    /// Only route paths under this prefix to this client
    #[arg(long, env = "WAYPORT_PATH_PREFIX")]
    path_prefix: Option<String>,

    /// Local service address to forward to (host:port)
    #[arg(long, default_value = DEFAULT_LOCAL_ADDR, env = "WAYPORT_LOCAL_ADDR")]
    local_addr: String,

    /// Exit instead of reconnecting when the tunnel drops
    #[arg(long)]
    no_reconnect: bool,

    /// Give up after this many consecutive failed reconnects
    #[arg(long, env = "WAYPORT_MAX_RECONNECT_ATTEMPTS")]
    max_reconnect_attempts: Option<u32>,

    /// First reconnect delay in seconds
    #[arg(long, default_value_t = 1, env = "WAYPORT_RECONNECT_DELAY")]
    reconnect_delay: u64,

    /// Enable tracing export
    #[arg(long, env = "WAYPORT_OBSERVABILITY")]
    observability: bool,
}

/// Resolve the token from args or env, then prompt without echo
fn resolve_token(args: &ClientArgs) -> Result<String> {
    if let Some(token) = &args.token {
        return Ok(token.clone());
    }
    rpassword::prompt_password("Token: ").context(
        "Could not read token from terminal (is stdin a TTY?). Set WAYPORT_TOKEN or pass --token",
    )
}

impl ClientArgs {
    fn build_client(&self, token: String) -> Result<Client> {
        let mut builder = Client::builder()
            .server_addr(&self.server)
            .token(token)
            .host(&self.host)
            .local_addr(&self.local_addr)
            .auto_reconnect(!self.no_reconnect)
            .reconnect_delay(Duration::from_secs(self.reconnect_delay));
        if let Some(prefix) = &self.path_prefix {
            builder = builder.path_prefix(prefix);
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            builder = builder.max_reconnect_attempts(attempts);
        }
        Ok(builder.build()?)
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    if args.observability {
        init_basic_observability("wayport-client", true, false);
    } else {
        init_minimal_logging();
    }

    info!("Starting Wayport client v{}", env!("CARGO_PKG_VERSION"));

    let token = resolve_token(&args)?;
    let mut client = args.build_client(token)?;

    let tunnel = client.start().await?;
    info!(
        "Forwarding http://{}{} to {}",
        tunnel.host,
        tunnel.path_prefix.as_deref().unwrap_or(""),
        args.local_addr
    );

    let result = tokio::select! {
        result = client.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            client.shutdown().await
        }
    };

    shutdown_tracing();
    Ok(result?)
}
