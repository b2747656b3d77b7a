mod client_config;
mod commands;
mod connection;
mod portfwd;
mod render;
mod shell;

use clap::Parser;
use serde_json::Value;

use corral_core::protocol::Response;

use crate::commands::{execute, Cli};
use crate::connection::Connection;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = client_config::load()?;
    let (mut conn, auth) = Connection::connect(&cfg.addr, &cfg.token).await?;
    if auth.code != 0 {
        let msg = auth
            .fields
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        println!("[error] login failed: {msg}");
        std::process::exit(1);
    }
    let user = auth
        .fields
        .get("user")
        .and_then(Value::as_str)
        .unwrap_or("?");
    println!("logged in as {user}");

    if std::env::args().len() > 1 {
        let cli = Cli::parse();
        let result = execute(&mut conn, cli.command).await;
        let ok = print_outcome(&result);
        if !ok {
            std::process::exit(1);
        }
    } else {
        shell::run(&mut conn).await?;
    }
    Ok(())
}

/// Print the `[done]` / `[error]` trailer; returns whether the command
/// succeeded.
pub fn print_outcome(result: &anyhow::Result<Response>) -> bool {
    match result {
        Ok(response) if response.code == 0 => {
            println!("[done]");
            true
        }
        Ok(response) => {
            let msg = response
                .fields
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            println!("[error] {} {}", response.code, msg);
            false
        }
        Err(err) => {
            println!("[error] {err:#}");
            false
        }
    }
}
