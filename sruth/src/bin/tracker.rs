use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use sruth::logging::setup_tracing;
use sruth::tracker::Tracker;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Rendezvous service: tells subscribers which servers serve which filter.
#[derive(Parser, Debug)]
#[command(name = "tracker", version)]
struct Cli {
    /// Address to listen on (TCP for queries, UDP for offline reports).
    #[arg(default_value = "0.0.0.0:38799")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let cli = Cli::parse();
    let tracker = Tracker::bind(cli.listen).await?;
    info!(addr = %tracker.local_addr()?, "tracker listening");

    let cancel = CancellationToken::new();
    let mut tracker_task = tokio::spawn(tracker.run(cancel.clone()));
    tokio::select! {
        result = &mut tracker_task => return result?,
        _ = signal::ctrl_c() => {
            info!("shutting down");
            cancel.cancel();
        }
    }
    tracker_task.await?
}
