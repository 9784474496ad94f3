use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use sruth_archive::Archive;
use sruth_core::{
    from_cbor, to_cbor, ArchivePath, Filter, FilterServerMap, RecordCodec, TrackerQuery,
    TrackerReply,
};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{HANDSHAKE_TIMEOUT, MAX_CONTROL_FRAME};

/// Archive pathname of the topology snapshot redistributed for a tracker:
/// an admin file, so it never expires.
pub fn topology_archive_path(tracker: SocketAddr) -> ArchivePath {
    let host = tracker
        .to_string()
        .replace(':', "_")
        .replace(['[', ']'], "");
    ArchivePath::new(format!("SRUTH/{host}/FilterServerMap"))
        .expect("sanitized tracker address forms a valid path")
}

/// Client-side handle on a tracker.
///
/// The tracker is a soft dependency: when it cannot be reached, the proxy
/// falls back to the topology snapshot previously distributed through the
/// archive itself, so a node keeps exchanging data on a stale topology as
/// long as it knows one live peer.
pub struct TrackerProxy {
    tracker_addr: SocketAddr,
    archive: Archive,
    topology_path: ArchivePath,
    udp: UdpSocket,
    state: tokio::sync::Mutex<State>,
}

#[derive(Default)]
struct State {
    cached: Option<FilterServerMap>,
    reporting: Option<SocketAddr>,
    closed: bool,
}

impl TrackerProxy {
    pub async fn new(tracker_addr: SocketAddr, archive: Archive) -> Result<Arc<Self>> {
        let udp = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .context("couldn't bind reporting socket")?;
        Ok(Arc::new(Self {
            topology_path: topology_archive_path(tracker_addr),
            tracker_addr,
            archive,
            udp,
            state: tokio::sync::Mutex::new(State::default()),
        }))
    }

    pub fn address(&self) -> SocketAddr {
        self.tracker_addr
    }

    /// Returns the filter-specific state of the network, registering the
    /// local server with the tracker on the way. Falls back to the
    /// archive's topology snapshot when the tracker is unreachable.
    pub async fn get_network(
        &self,
        refresh: bool,
        filter: &Filter,
        local_server: SocketAddr,
    ) -> Result<FilterServerMap> {
        let mut state = self.state.lock().await;
        if state.closed {
            bail!("tracker proxy for {} is closed", self.tracker_addr);
        }
        let refresh = refresh || state.cached.is_none();
        if refresh {
            match self.fetch(filter, local_server).await {
                Ok(reply) => {
                    state.reporting = Some(reply.reporting);
                    state.cached = Some(reply.network.clone());
                    if let Err(err) = self.archive.save_object(&self.topology_path, &reply.network)
                    {
                        warn!(%err, "couldn't save topology snapshot");
                    }
                }
                Err(err) => {
                    warn!(tracker = %self.tracker_addr, %err, "couldn't reach tracker");
                    let map: FilterServerMap =
                        self.archive.restore(&self.topology_path).with_context(|| {
                            format!(
                                "tracker {} unreachable and no topology file {}",
                                self.tracker_addr, self.topology_path
                            )
                        })?;
                    match self.archive.time_of(&self.topology_path) {
                        Ok(time) => warn!(
                            file = %self.topology_path,
                            last_modified = %time,
                            "using stale network topology file"
                        ),
                        Err(_) => warn!(
                            file = %self.topology_path,
                            "using stale network topology file"
                        ),
                    }
                    state.cached = Some(map);
                }
            }
        } else if let Ok(map) = self.archive.restore::<FilterServerMap>(&self.topology_path) {
            // Pick up a snapshot redistributed through the archive since
            // the last contact.
            state.cached = Some(map);
        }
        Ok(state
            .cached
            .as_ref()
            .expect("topology cached above")
            .subset(filter))
    }

    async fn fetch(&self, filter: &Filter, local_server: SocketAddr) -> Result<TrackerReply> {
        let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(self.tracker_addr))
            .await
            .context("tracker connect timed out")?
            .context("tracker connect failed")?;
        let (read_half, write_half) = stream.into_split();
        let mut sink = FramedWrite::new(
            write_half,
            RecordCodec::<TrackerQuery>::new(MAX_CONTROL_FRAME),
        );
        sink.send(TrackerQuery {
            filter: filter.clone(),
            server: local_server,
        })
        .await
        .context("couldn't send tracker query")?;
        let mut stream = FramedRead::new(
            read_half,
            RecordCodec::<TrackerReply>::new(MAX_CONTROL_FRAME),
        );
        match timeout(HANDSHAKE_TIMEOUT, stream.next()).await {
            Err(_) => bail!("tracker reply timed out"),
            Ok(None) => bail!("tracker closed without replying"),
            Ok(Some(reply)) => Ok(reply.context("tracker reply unreadable")?),
        }
    }

    /// Reports a server as offline: one datagram sized to the serialized
    /// address, fire-and-forget.
    pub async fn report_offline(&self, server: SocketAddr) {
        let target = {
            let state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.reporting.unwrap_or(self.tracker_addr)
        };
        debug!(%server, tracker = %target, "reporting offline server");
        let payload = match to_cbor(&server) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "couldn't encode offline report");
                return;
            }
        };
        if let Err(err) = self.udp.send_to(&payload, target).await {
            warn!(%err, "couldn't send offline report");
        }
    }

    /// Idempotent; `get_network` errors afterwards.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
    }
}

impl std::fmt::Debug for TrackerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TrackerProxy[{}]", self.tracker_addr)
    }
}

/// A minimal tracker: registers which server serves which filter, hands
/// out the resulting map, and unregisters servers reported offline over
/// UDP.
pub struct Tracker {
    tcp: TcpListener,
    udp: Arc<UdpSocket>,
    map: Arc<Mutex<FilterServerMap>>,
}

impl Tracker {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let tcp = TcpListener::bind(addr)
            .await
            .with_context(|| format!("couldn't bind tracker on {addr}"))?;
        // The reporting socket shares the TCP endpoint's address.
        let udp_addr = tcp.local_addr()?;
        let udp = UdpSocket::bind(udp_addr)
            .await
            .with_context(|| format!("couldn't bind tracker reporting socket on {udp_addr}"))?;
        Ok(Self {
            tcp,
            udp: Arc::new(udp),
            map: Arc::new(Mutex::new(FilterServerMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let reporting = self.udp.local_addr()?;
        info!(%reporting, "tracker running");
        let mut clients: JoinSet<()> = JoinSet::new();
        let mut datagram = [0u8; 2048];
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.tcp.accept() => {
                    let (stream, remote) = accepted.context("tracker accept failed")?;
                    let map = self.map.clone();
                    clients.spawn(async move {
                        if let Err(err) = serve_client(stream, map, reporting).await {
                            debug!(%remote, %err, "tracker client failed");
                        }
                    });
                }
                received = self.udp.recv_from(&mut datagram) => {
                    let (len, from) = received.context("tracker reporting socket failed")?;
                    match from_cbor::<SocketAddr>(&datagram[..len]) {
                        Ok(server) => {
                            info!(%server, reporter = %from, "server reported offline");
                            self.map.lock().expect("tracker map lock").remove_server(&server);
                        }
                        Err(err) => debug!(%from, %err, "unreadable offline report"),
                    }
                }
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
            }
        }
        clients.shutdown().await;
        Ok(())
    }
}

async fn serve_client(
    stream: TcpStream,
    map: Arc<Mutex<FilterServerMap>>,
    reporting: SocketAddr,
) -> Result<()> {
    let remote = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();
    let mut queries = FramedRead::new(
        read_half,
        RecordCodec::<TrackerQuery>::new(MAX_CONTROL_FRAME),
    );
    let query = match timeout(HANDSHAKE_TIMEOUT, queries.next()).await {
        Err(_) => bail!("query timed out"),
        Ok(None) => bail!("client closed without a query"),
        Ok(Some(query)) => query.context("unreadable query")?,
    };
    let network = {
        let mut map = map.lock().expect("tracker map lock");
        if query.filter != Filter::Nothing {
            debug!(%remote, server = %query.server, filter = %query.filter, "registering server");
            map.insert(query.filter.clone(), query.server);
        }
        map.clone()
    };
    let mut sink = FramedWrite::new(
        write_half,
        RecordCodec::<TrackerReply>::new(MAX_CONTROL_FRAME),
    );
    sink.send(TrackerReply {
        network,
        reporting,
    })
    .await
    .context("couldn't send reply")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use sruth_archive::{Archive, ArchiveConfig};
    use sruth_core::{ArchivePath, Filter};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::{topology_archive_path, Tracker, TrackerProxy};

    #[test]
    fn topology_path_is_admin_and_valid() {
        let path = topology_archive_path("127.0.0.1:38800".parse().unwrap());
        assert!(path.is_admin());
        assert_eq!(path.as_str(), "SRUTH/127.0.0.1_38800/FilterServerMap");
    }

    #[tokio::test]
    async fn register_fetch_and_fallback() {
        let root = TempDir::new().unwrap();
        let archive = Archive::open(root.path(), ArchiveConfig::default()).unwrap();

        let tracker = Tracker::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let tracker_addr = tracker.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let tracker_task = tokio::spawn(tracker.run(cancel.clone()));

        let proxy = TrackerProxy::new(tracker_addr, archive.clone()).await.unwrap();
        let filter = Filter::Prefix(ArchivePath::new("data").unwrap());
        let local_server = "127.0.0.1:39000".parse().unwrap();

        let network = proxy
            .get_network(true, &filter, local_server)
            .await
            .unwrap();
        // Our own registration is part of the returned topology.
        assert!(network.servers_for(&filter).contains(&local_server));

        // Kill the tracker; the proxy falls back to the snapshot it saved.
        cancel.cancel();
        tracker_task.await.unwrap().unwrap();
        let network = proxy
            .get_network(true, &filter, local_server)
            .await
            .unwrap();
        assert!(network.servers_for(&filter).contains(&local_server));
    }

    #[tokio::test]
    async fn closed_proxy_refuses_queries() {
        let root = TempDir::new().unwrap();
        let archive = Archive::open(root.path(), ArchiveConfig::default()).unwrap();
        let proxy = TrackerProxy::new("127.0.0.1:1".parse().unwrap(), archive)
            .await
            .unwrap();
        proxy.close().await;
        proxy.close().await;
        let result = proxy
            .get_network(true, &Filter::Everything, "127.0.0.1:39000".parse().unwrap())
            .await;
        assert!(result.is_err());
    }
}
