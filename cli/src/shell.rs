//! Interactive shell with persistent history.

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::client_config::history_path;
use crate::commands::{execute, Cli, Command};
use crate::connection::{is_connection_lost, Connection};
use crate::print_outcome;

pub async fn run(conn: &mut Connection) -> anyhow::Result<()> {
    let mut editor = DefaultEditor::new()?;
    let history = history_path();
    if let Some(dir) = history.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let _ = editor.load_history(&history);

    loop {
        // rustyline is synchronous; block in place so spawned tunnel
        // tasks keep running on the other workers.
        let line = tokio::task::block_in_place(|| editor.readline("corral> "));
        match line {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);

                let Some(words) = shlex::split(&line) else {
                    println!("[error] unbalanced quotes");
                    continue;
                };
                match Cli::try_parse_from(std::iter::once("corral".to_string()).chain(words)) {
                    Ok(cli) => {
                        if matches!(cli.command, Command::Q) {
                            break;
                        }
                        let mut result = execute(conn, cli.command.clone()).await;
                        // A dead connection is recovered in place: dial
                        // again and re-run the command, instead of
                        // surfacing the raw transport error.
                        if result.as_ref().is_err_and(|err| is_connection_lost(err)) {
                            println!("Connection to server lost. Reconnecting...");
                            result = match conn.reconnect().await {
                                Ok(auth) if auth.code == 0 => execute(conn, cli.command).await,
                                Ok(auth) => Ok(auth),
                                Err(err) => Err(err),
                            };
                        }
                        print_outcome(&result);
                    }
                    // clap renders its own help/usage text.
                    Err(err) => println!("{err}"),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }

    let _ = editor.save_history(&history);
    Ok(())
}
