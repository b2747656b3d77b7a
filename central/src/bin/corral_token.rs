//! Operator helper: mint a signed user token against the cluster key.

use clap::Parser;

use corral_core::auth::{issue, TokenKind};
use corral_core::config::Config;

#[derive(Parser)]
#[command(name = "corral-token", about = "Issue a corral user token")]
struct Args {
    /// Subject the token is issued to.
    user: String,

    /// Expiry in seconds from now.
    #[arg(short, long, default_value_t = 86_400 * 60)]
    exp: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = Config::load()?;
    let token = issue(&args.user, TokenKind::User, args.exp, &cfg.jwt_key)?;
    println!("{token}");
    Ok(())
}
