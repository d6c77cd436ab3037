//! Wayport command-line interface
//!
//! Runs the gateway or a tunnel client, and signs client tokens.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "wayport",
    author,
    version,
    about = "Reverse tunnel gateway for HTTP and WebSocket services",
    long_about = "Wayport exposes local HTTP services behind public hosts.\n\n\
                  Run `wayport server` on a public machine and `wayport client` next to \
                  the service you want to expose.",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Server(commands::server::ServerArgs),

    /// Run a tunnel client
    Client(commands::client::ClientArgs),

    /// Sign a client token
    Token(commands::token::TokenArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => commands::server::run(args).await,
        Commands::Client(args) => commands::client::run(args).await,
        Commands::Token(args) => commands::token::run(&args),
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_token_subcommand() {
        let cli = Cli::try_parse_from([
            "wayport",
            "token",
            "--secret-key",
            "s",
            "--verify-token",
            "v",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Token(_)));
    }
}
