use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use sruth::config::load_config;
use sruth::logging::setup_tracing;
use sruth::node::SourceNode;
use sruth_archive::Archive;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Publishes the files of a directory into the distribution network.
#[derive(Parser, Serialize, Debug)]
#[command(name = "publisher", version)]
struct Cli {
    /// Root directory of the archive to publish.
    #[serde(skip_serializing)]
    root_dir: PathBuf,

    /// Tracker to register this server with. May be repeated.
    #[arg(short, long, value_name = "HOST:PORT")]
    #[serde(skip_serializing)]
    tracker: Vec<SocketAddr>,

    /// IP address to bind the server on.
    #[arg(short, long, value_name = "IP", default_value = "0.0.0.0")]
    #[serde(skip_serializing)]
    bind: IpAddr,

    /// Ceiling on simultaneously open archive files.
    #[arg(long, value_name = "N")]
    #[serde(skip_serializing_if = "Option::is_none")]
    active_file_cache_size: Option<i64>,

    /// First port of the range scanned for three consecutive free ports.
    #[arg(long, value_name = "PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    port_range_start: Option<u16>,

    /// Last port of the range.
    #[arg(long, value_name = "PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    port_range_end: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let archive = Archive::open(&cli.root_dir, config.archive_config())
        .with_context(|| format!("couldn't open archive {}", cli.root_dir.display()))?;

    let node = SourceNode::new(archive, cli.bind, config, cli.tracker.clone()).await?;

    // Scripts read the first server port from stdout.
    println!("{}", node.server_addr().port());
    info!(server = %node.server_addr(), "publishing {}", cli.root_dir.display());

    let cancel = CancellationToken::new();
    let mut node_task = tokio::spawn(node.run(cancel.clone()));
    tokio::select! {
        result = &mut node_task => return result?,
        _ = signal::ctrl_c() => {
            info!("shutting down");
            cancel.cancel();
        }
    }
    node_task.await?
}
