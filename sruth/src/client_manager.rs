use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clearing_house::ClearingHouse;
use crate::connection::Connection;
use crate::peer::Peer;
use crate::tracker::TrackerProxy;

/// Maintains a bounded pool of outbound peers guided by one tracker.
///
/// Periodically asks the tracker which servers serve the local predicate,
/// dials the shortfall (one peer per remote server), and reports servers
/// it cannot reach. Losing peers forces a topology refresh on the next
/// poll; otherwise the cached snapshot is reused.
pub struct ClientManager {
    house: Arc<ClearingHouse>,
    tracker: Arc<TrackerProxy>,
    local_server: SocketAddr,
    max_clients: usize,
    poll: Duration,
}

impl ClientManager {
    pub fn new(
        house: Arc<ClearingHouse>,
        tracker: Arc<TrackerProxy>,
        local_server: SocketAddr,
        max_clients: usize,
        poll: Duration,
    ) -> Self {
        Self {
            house,
            tracker,
            local_server,
            max_clients,
            poll,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut connected: HashMap<SocketAddr, JoinHandle<()>> = HashMap::new();
        loop {
            connected.retain(|_, task| !task.is_finished());

            // A full pool leaves the topology alone; a shortfall refreshes
            // it, since servers register with the tracker at their own pace.
            let shortfall = self.max_clients.saturating_sub(connected.len());
            if shortfall > 0 {
                match self
                    .tracker
                    .get_network(
                        true,
                        &self.house.local_predicate().as_filter(),
                        self.local_server,
                    )
                    .await
                {
                    Ok(network) => {
                        let mut candidates: Vec<SocketAddr> = network
                            .servers_for(&self.house.local_predicate().as_filter())
                            .into_iter()
                            .filter(|addr| {
                                *addr != self.local_server && !connected.contains_key(addr)
                            })
                            .collect();
                        candidates.shuffle(&mut rand::thread_rng());
                        for addr in candidates.into_iter().take(shortfall) {
                            debug!(server = %addr, "dialing");
                            connected.insert(addr, self.spawn_outbound(addr));
                        }
                    }
                    Err(err) => {
                        // Soft dependency: keep exchanging with the peers
                        // we already have.
                        warn!(%err, "couldn't learn network topology");
                    }
                }
            }

            let jitter = rand::thread_rng()
                .gen_range(Duration::ZERO..self.poll / 4 + Duration::from_millis(1));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll + jitter) => {}
            }
        }
        for task in connected.into_values() {
            task.abort();
        }
        Ok(())
    }

    fn spawn_outbound(&self, addr: SocketAddr) -> JoinHandle<()> {
        let house = self.house.clone();
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            match Connection::connect(addr).await {
                Ok(connection) => {
                    if let Err(err) = Peer::run(connection, house).await {
                        debug!(server = %addr, %err, "outbound peer ended");
                    }
                }
                Err(err) => {
                    warn!(server = %addr, %err, "server unreachable");
                    tracker.report_offline(addr).await;
                }
            }
        })
    }
}
