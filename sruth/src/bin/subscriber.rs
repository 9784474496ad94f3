use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use sruth::config::load_config;
use sruth::logging::setup_tracing;
use sruth::node::SinkNode;
use sruth::subscription::load_subscription;
use sruth_archive::Archive;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Pulls files matching a subscription into a local directory.
#[derive(Parser, Serialize, Debug)]
#[command(name = "subscriber", version)]
struct Cli {
    /// Root directory of the local archive.
    #[serde(skip_serializing)]
    root_dir: PathBuf,

    /// Subscription file naming the trackers and the wanted files.
    #[serde(skip_serializing)]
    subscription: PathBuf,

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

    /// Upper bound on concurrent outbound peers per tracker.
    #[arg(long, value_name = "N")]
    #[serde(skip_serializing_if = "Option::is_none")]
    max_clients: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let subscription = load_subscription(&cli.subscription)?;
    let archive = Archive::open(&cli.root_dir, config.archive_config())
        .with_context(|| format!("couldn't open archive {}", cli.root_dir.display()))?;

    let node = SinkNode::new(
        archive,
        cli.bind,
        config,
        subscription.trackers.clone(),
        subscription.predicate.clone(),
    )
    .await?;
    info!(
        server = %node.server_addr(),
        predicate = %subscription.predicate,
        "subscribing into {}",
        cli.root_dir.display()
    );

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
