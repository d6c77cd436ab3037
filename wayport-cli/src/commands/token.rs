//! Token subcommand: sign a JWT for tunnel clients

use anyhow::Result;
use clap::Args;
use std::time::Duration;
use wayport_core::issue_token;

#[derive(Args, Debug)]
pub struct TokenArgs {
    /// HS256 secret the gateway verifies with
    #[arg(long, env = "WAYPORT_SECRET_KEY", hide_env_values = true)]
    secret_key: String,

    /// Value for the `token` claim
    #[arg(long, env = "WAYPORT_VERIFY_TOKEN", hide_env_values = true)]
    verify_token: String,

    /// Expire the token after this many seconds
    #[arg(long)]
    ttl: Option<u64>,
}

pub fn run(args: &TokenArgs) -> Result<()> {
    let token = issue_token(
        &args.secret_key,
        &args.verify_token,
        args.ttl.map(Duration::from_secs),
    )?;
    println!("{token}");
    Ok(())
}
