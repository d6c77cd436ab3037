//! Embedding a `Wayport` tunnel client in an application.
//!
//! ```bash
//! # A local service to expose
//! python3 -m http.server 8000
//!
//! cargo run -p wayport --example embedded_client -- \
//!     --server localhost:7835 \
//!     --token my-secret-token \
//!     --host app.localhost \
//!     --local-addr 127.0.0.1:8000
//! ```

use std::env;
use wayport::Client;

#[tokio::main]
async fn main() -> wayport::Result<()> {
    wayport_observability::init_minimal_logging();

    let args: Vec<String> = env::args().collect();
    let server_addr = get_arg(&args, "--server").unwrap_or_else(|| "localhost:7835".to_string());
    let token = get_arg(&args, "--token").unwrap_or_else(|| "secret".to_string());
    let host = get_arg(&args, "--host").unwrap_or_else(|| "app.localhost".to_string());
    let local_addr = get_arg(&args, "--local-addr").unwrap_or_else(|| "127.0.0.1:8000".to_string());

    let mut builder = Client::builder()
        .server_addr(&server_addr)
        .token(&token)
        .host(&host)
        .local_addr(&local_addr);
    if let Some(prefix) = get_arg(&args, "--path-prefix") {
        builder = builder.path_prefix(prefix);
    }
    let mut client = builder.build()?;

    let info = client.start().await?;
    println!(
        "Serving http://{}{} from {local_addr} (session {})",
        info.host,
        info.path_prefix.as_deref().unwrap_or("/"),
        info.session_id
    );
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    client.shutdown().await
}

fn get_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1).cloned())
}
