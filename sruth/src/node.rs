use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sruth_archive::{Archive, ArchiveEvent};
use sruth_core::{Filter, Predicate};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clearing_house::ClearingHouse;
use crate::client_manager::ClientManager;
use crate::config::Config;
use crate::server::Server;
use crate::tracker::TrackerProxy;

/// A top-level publishing node: archive + server + file-tree watcher. Its
/// predicate is NOTHING — it serves but does not request.
pub struct SourceNode {
    archive: Archive,
    server: Server,
    house: Arc<ClearingHouse>,
    trackers: Vec<SocketAddr>,
    config: Config,
}

impl SourceNode {
    pub async fn new(
        archive: Archive,
        bind_ip: IpAddr,
        config: Config,
        trackers: Vec<SocketAddr>,
    ) -> Result<Self> {
        let server = Server::bind(bind_ip, config.port_range_start, config.port_range_end)
            .await
            .context("couldn't start server")?;
        let house = ClearingHouse::new(archive.clone(), Predicate::nothing());
        Ok(Self {
            archive,
            server,
            house,
            trackers,
            config,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn clearing_house(&self) -> Arc<ClearingHouse> {
        self.house.clone()
    }

    /// Serves until cancelled or until a subtask fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let server_addr = self.server.local_addr();
        tasks.spawn(self.server.run(self.house.clone(), cancel.child_token()));

        let mut watcher = self.archive.watch().context("couldn't watch archive")?;
        let house = self.house.clone();
        tasks.spawn(async move {
            while let Some(event) = watcher.recv().await {
                match event {
                    ArchiveEvent::Available(specs) => {
                        house.broadcast_available(specs, None).await;
                    }
                    ArchiveEvent::Removed(id) => {
                        house.broadcast_removed(id, None).await;
                    }
                }
            }
            Ok(())
        });

        // Make this server discoverable. A source serves everything, so it
        // registers under the broadest filter and ignores the returned map.
        for tracker_addr in self.trackers.clone() {
            let archive = self.archive.clone();
            let poll = Duration::from_secs(self.config.tracker_poll_seconds.max(1) * 10);
            let cancel = cancel.child_token();
            tasks.spawn(async move {
                let proxy = TrackerProxy::new(tracker_addr, archive).await?;
                loop {
                    match proxy
                        .get_network(true, &Filter::Everything, server_addr)
                        .await
                    {
                        Ok(_) => info!(tracker = %tracker_addr, "registered with tracker"),
                        Err(err) => debug!(tracker = %tracker_addr, %err, "tracker registration failed"),
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            });
        }

        run_until_failure(tasks, cancel, &self.archive).await
    }
}

/// A subscribing node: archive + server + one client manager per tracker,
/// pulling everything that matches the user-supplied predicate. Completed
/// files are served onwards through the same server.
pub struct SinkNode {
    archive: Archive,
    server: Server,
    house: Arc<ClearingHouse>,
    trackers: Vec<SocketAddr>,
    config: Config,
}

impl SinkNode {
    pub async fn new(
        archive: Archive,
        bind_ip: IpAddr,
        config: Config,
        trackers: Vec<SocketAddr>,
        predicate: Predicate,
    ) -> Result<Self> {
        let server = Server::bind(bind_ip, config.port_range_start, config.port_range_end)
            .await
            .context("couldn't start server")?;
        let house = ClearingHouse::new(archive.clone(), predicate);
        Ok(Self {
            archive,
            server,
            house,
            trackers,
            config,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn clearing_house(&self) -> Arc<ClearingHouse> {
        self.house.clone()
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let server_addr = self.server.local_addr();
        tasks.spawn(self.server.run(self.house.clone(), cancel.child_token()));

        for tracker_addr in self.trackers.clone() {
            let proxy = TrackerProxy::new(tracker_addr, self.archive.clone())
                .await
                .context("couldn't create tracker proxy")?;
            let manager = ClientManager::new(
                self.house.clone(),
                proxy,
                server_addr,
                self.config.max_clients,
                Duration::from_secs(self.config.tracker_poll_seconds.max(1)),
            );
            tasks.spawn(manager.run(cancel.child_token()));
        }

        run_until_failure(tasks, cancel, &self.archive).await
    }
}

/// Waits for the first subtask to end. A clean end (cancellation) drains
/// quietly; a failure cancels the siblings. Either way the archive is
/// closed before returning.
async fn run_until_failure(
    mut tasks: JoinSet<Result<()>>,
    cancel: CancellationToken,
    archive: &Archive,
) -> Result<()> {
    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {
                if cancel.is_cancelled() {
                    continue;
                }
                // A subtask ended without being asked to; shut down.
                break;
            }
            Ok(Err(err)) => {
                error!(%err, "node subtask failed");
                result = Err(err);
                break;
            }
            Err(join_err) if join_err.is_cancelled() => continue,
            Err(join_err) => {
                result = Err(anyhow::anyhow!(join_err).context("node subtask panicked"));
                break;
            }
        }
    }
    cancel.cancel();
    tasks.shutdown().await;
    archive.close();
    result
}
