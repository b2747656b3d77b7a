//! Command grammar and execution.
//!
//! The same grammar serves one-shot invocation (`corral ps`) and the
//! interactive shell. Execution renders human-readable output for the
//! inspection commands and returns the raw response so the caller can
//! report `[done]` / `[error]`.

use std::path::PathBuf;

use clap::Parser;
use serde_json::{json, Value};

use corral_core::protocol::Response;

use crate::connection::Connection;
use crate::portfwd;
use crate::render::format_table;

#[derive(Parser, Debug)]
#[command(name = "corral", about = "GPU-container orchestrator client", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// List nodes and their free GPUs.
    Nodes {
        /// Also show the names of running containers per node.
        #[arg(short = 'j', long)]
        show_jobs: bool,
    },
    /// List containers across the cluster.
    Ps {
        /// Substring filter on id, name or user.
        filt: Option<String>,
    },
    /// Fetch (or follow) a container's logs.
    Logs {
        container: String,
        /// Write logs to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Keep following new output.
        #[arg(short, long)]
        follow: bool,
    },
    /// Stop a container.
    Stop { container: String },
    /// Force-kill a container.
    Kill { container: String },
    /// Stop every container of a job.
    Jstop { job: String },
    /// Remove a finalized container from the archive.
    Delete { container: String },
    /// Remove every finalized container of a job.
    Jdelete { job: String },
    /// Forward a local port to a port inside a container.
    Portfwd {
        container: String,
        /// remote port, or remote:local.
        port: String,
    },
    /// Drop and re-establish the connection to the central.
    Reconnect,
    /// Run commands from a script file.
    Source { file: PathBuf },
    /// Launch one or more containers.
    Run {
        /// Comma-separated nodes to exclude.
        #[arg(short = 'x', long, default_value = "")]
        node_exclude: String,
        /// Comma-separated nodes to restrict to.
        #[arg(short = 'n', long, default_value = "")]
        node_include: String,
        /// Launch N containers named <name>-0 … <name>-(N-1).
        #[arg(short = 'j', long)]
        n_jobs: Option<usize>,
        /// GPUs per container (0, 1, 2, 4, 8 or 16).
        #[arg(short = 'g', long, default_value_t = 1)]
        n_gpus: usize,
        /// Seconds until the container is stopped; 0 for no timeout.
        #[arg(short = 't', long, default_value_t = 0)]
        timeout: i64,
        /// Environment entries, KEY=VALUE, repeatable.
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        name: String,
        image: String,
        /// Command to run inside the container.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
    /// Quit the shell.
    Q,
}

/// Execute one command against the central.
pub async fn execute(conn: &mut Connection, command: Command) -> anyhow::Result<Response> {
    match command {
        Command::Nodes { show_jobs } => {
            let response = conn.call("nodes", json!({})).await?;
            if response.code == 0 {
                print_nodes(&response, show_jobs);
            }
            Ok(response)
        }
        Command::Ps { filt } => {
            let response = conn.call("ps", json!({ "filt": filt })).await?;
            if response.code == 0 {
                print_ps(&response);
            }
            Ok(response)
        }
        Command::Logs {
            container,
            output,
            follow,
        } => {
            if follow {
                return follow_logs(conn, &container).await;
            }
            let response = conn.call("logs", json!({ "container": container })).await?;
            if response.code == 0 {
                let logs = response
                    .fields
                    .get("logs")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match &output {
                    Some(path) => std::fs::write(path, logs)?,
                    None => println!("{logs}"),
                }
            }
            Ok(response)
        }
        Command::Stop { container } => conn.call("stop", json!({ "container": container })).await,
        Command::Kill { container } => conn.call("kill", json!({ "container": container })).await,
        Command::Jstop { job } => conn.call("jstop", json!({ "job": job })).await,
        Command::Delete { container } => {
            conn.call("delete", json!({ "container": container })).await
        }
        Command::Jdelete { job } => conn.call("jdelete", json!({ "job": job })).await,
        Command::Portfwd { container, port } => portfwd::run(conn, &container, &port).await,
        Command::Reconnect => conn.reconnect().await,
        Command::Source { file } => source(conn, &file).await,
        Command::Run {
            node_exclude,
            node_include,
            n_jobs,
            n_gpus,
            timeout,
            env,
            name,
            image,
            cmd,
        } => {
            conn.call(
                "run",
                json!({
                    "name": name,
                    "image": image,
                    "exec": cmd,
                    "n_gpus": n_gpus,
                    "n_jobs": n_jobs,
                    "env": env,
                    "node_exclude": node_exclude,
                    "node_include": node_include,
                    "timeout": timeout,
                }),
            )
            .await
        }
        // Meaningful in the shell only.
        Command::Q => Ok(Response::ok("", json!({}))),
    }
}

async fn follow_logs(conn: &mut Connection, container: &str) -> anyhow::Result<Response> {
    let response = conn
        .call("follow_logs", json!({ "container": container }))
        .await?;
    if response.code != 0 {
        return Ok(response);
    }
    let follower = response
        .fields
        .get("follower")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    loop {
        let poll = conn
            .call("poll_logs", json!({ "follower": follower }))
            .await?;
        if poll.code != 0 {
            return Ok(poll);
        }
        if let Some(batch) = poll.fields.get("log").and_then(Value::as_str) {
            print!("{batch}");
            use std::io::Write;
            std::io::stdout().flush()?;
        }
        if poll.fields.get("eof").and_then(Value::as_bool) == Some(true) {
            return Ok(poll);
        }
    }
}

async fn source(conn: &mut Connection, file: &PathBuf) -> anyhow::Result<Response> {
    let script = std::fs::read_to_string(file)?;
    for line in script.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(words) = shlex::split(line) else {
            println!("[error] unbalanced quotes in: {line}");
            continue;
        };
        match Cli::try_parse_from(std::iter::once("corral".to_string()).chain(words)) {
            Ok(cli) => {
                let result = Box::pin(execute(conn, cli.command)).await;
                crate::print_outcome(&result);
            }
            Err(err) => println!("{err}"),
        }
    }
    Ok(Response::ok("", json!({})))
}

fn print_nodes(response: &Response, show_jobs: bool) {
    let empty = serde_json::Map::new();
    let nodes = response
        .fields
        .get("nodes")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let mut rows: Vec<Vec<String>> = nodes
        .iter()
        .map(|(name, info)| {
            let free: Vec<String> = info
                .get("free_gpu_ids")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_u64)
                .map(|gpu| gpu.to_string())
                .collect();
            let mut row = vec![name.clone(), free.join(",")];
            if show_jobs {
                let names: Vec<String> = info
                    .get("names")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                row.push(names.join(","));
            }
            row
        })
        .collect();
    rows.sort();

    let headers: &[&str] = if show_jobs {
        &["Node", "Free GPUs", "Running"]
    } else {
        &["Node", "Free GPUs"]
    };
    println!("{}", format_table(headers, &rows));
}

fn print_ps(response: &Response) {
    let empty = serde_json::Map::new();
    let containers = response
        .fields
        .get("containers")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let field = |entry: &Value, key: &str| -> String {
        entry
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    let mut rows: Vec<Vec<String>> = containers
        .iter()
        .map(|(id, entry)| {
            let gpus: Vec<String> = entry
                .get("gpu_ids")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_u64)
                .map(|gpu| gpu.to_string())
                .collect();
            vec![
                id.clone(),
                field(entry, "name"),
                field(entry, "status"),
                field(entry, "user"),
                field(entry, "node"),
                gpus.join(","),
            ]
        })
        .collect();
    rows.sort_by(|a, b| a[1].cmp(&b[1]));

    println!(
        "{}",
        format_table(&["ID", "Name", "Status", "User", "Node", "GPUs"], &rows)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(words: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("corral").chain(words.iter().copied()))
    }

    #[test]
    fn run_grammar_matches_the_original() {
        let cli = parse(&[
            "run", "-j", "4", "-g", "2", "-t", "3600", "-e", "FOO=1", "-e", "BAR=2", "-x",
            "node-3", "train", "pytorch:latest", "python", "train.py", "--lr", "0.1",
        ])
        .unwrap();
        let Command::Run {
            n_jobs,
            n_gpus,
            timeout,
            env,
            node_exclude,
            name,
            image,
            cmd,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(n_jobs, Some(4));
        assert_eq!(n_gpus, 2);
        assert_eq!(timeout, 3600);
        assert_eq!(env, vec!["FOO=1", "BAR=2"]);
        assert_eq!(node_exclude, "node-3");
        assert_eq!(name, "train");
        assert_eq!(image, "pytorch:latest");
        assert_eq!(cmd, vec!["python", "train.py", "--lr", "0.1"]);
    }

    #[test]
    fn run_defaults_are_one_gpu_no_timeout() {
        let cli = parse(&["run", "job", "img", "true"]).unwrap();
        let Command::Run {
            n_jobs,
            n_gpus,
            timeout,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(n_jobs, None);
        assert_eq!(n_gpus, 1);
        assert_eq!(timeout, 0);
    }

    #[test]
    fn run_requires_a_command() {
        assert!(parse(&["run", "job", "img"]).is_err());
    }

    #[test]
    fn logs_flags_parse() {
        let cli = parse(&["logs", "train-0", "-f"]).unwrap();
        let Command::Logs {
            container, follow, ..
        } = cli.command
        else {
            panic!("expected logs");
        };
        assert_eq!(container, "train-0");
        assert!(follow);
    }

    #[test]
    fn ps_filter_is_optional() {
        assert!(matches!(
            parse(&["ps"]).unwrap().command,
            Command::Ps { filt: None }
        ));
        assert!(matches!(
            parse(&["ps", "alice"]).unwrap().command,
            Command::Ps { filt: Some(f) } if f == "alice"
        ));
    }
}
