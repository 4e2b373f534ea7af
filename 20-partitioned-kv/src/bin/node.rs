//! Runs one store node with an interactive console on stdin/stdout.
//!
//! Start a 3-node cluster over TCP:
//! ```bash
//! cargo run --bin node -- tcp 127.0.0.1 7001 127.0.0.1:7002,127.0.0.1:7003
//! cargo run --bin node -- tcp 127.0.0.1 7002 127.0.0.1:7001,127.0.0.1:7003
//! cargo run --bin node -- tcp 127.0.0.1 7003 127.0.0.1:7001,127.0.0.1:7002
//! ```
//!
//! Then type `PUT k v`, `GET k`, `DEL k`, `STORE` or `EXIT` at any prompt.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{stdin, stdout, BufReader};
use tracing::{info, warn};

use partitioned_kv::cli::Cli;
use partitioned_kv::console;
use partitioned_kv::runtime::spawn_node;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let color = !cli.no_color;
    let running = spawn_node(cli.into_config()).await?;
    let node = running.node.clone();

    let mut output = stdout();
    let outcome = tokio::select! {
        result = console::run(&node, BufReader::new(stdin()), &mut output, color) => {
            result.context("console failed")
        }
        signal = tokio::signal::ctrl_c() => {
            info!(node = %node.id(), "received ctrl-c");
            signal.context("failed to listen for ctrl-c")
        }
    };

    running.shutdown().await;
    match outcome {
        // stdin is read on a blocking thread that runtime shutdown would wait for.
        Ok(()) => std::process::exit(0),
        Err(err) => {
            warn!(node = %node.id(), error = ?err, "node exited with error");
            Err(err)
        }
    }
}
