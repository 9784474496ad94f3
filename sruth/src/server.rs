use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clearing_house::ClearingHouse;
use crate::connection::{
    read_preamble, Connection, Dial, DATA_STREAM, HANDSHAKE_TIMEOUT, NOTICE_STREAM,
    REQUEST_STREAM, SOCKET_COUNT,
};
use crate::peer::Peer;

/// Accepts inbound peers on three consecutive ports.
///
/// A client dials the ports in ascending order and announces each socket
/// with a dial preamble; sockets are matched into triples by remote host
/// and dial token, and a peer is spawned once all three streams of a
/// triple are present.
pub struct Server {
    listeners: Vec<TcpListener>,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the first run of three consecutive free ports in
    /// `[range_start, range_end]`.
    pub async fn bind(bind_ip: IpAddr, range_start: u16, range_end: u16) -> Result<Self> {
        for base in range_start..=range_end.saturating_sub(SOCKET_COUNT - 1) {
            match Self::try_bind(bind_ip, base).await {
                Ok(listeners) => {
                    let local_addr = SocketAddr::new(bind_ip, base);
                    info!(%local_addr, "server listening");
                    return Ok(Self {
                        listeners,
                        local_addr,
                    });
                }
                Err(err) => {
                    debug!(base, %err, "ports busy, scanning on");
                }
            }
        }
        bail!("no run of {SOCKET_COUNT} consecutive free ports in {range_start}..={range_end}")
    }

    async fn try_bind(bind_ip: IpAddr, base: u16) -> Result<Vec<TcpListener>> {
        let mut listeners = Vec::with_capacity(SOCKET_COUNT as usize);
        for offset in 0..SOCKET_COUNT {
            let addr = SocketAddr::new(bind_ip, base + offset);
            listeners.push(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("couldn't bind {addr}"))?,
            );
        }
        Ok(listeners)
    }

    /// The server's first (request-stream) address; the advertised identity
    /// of this node.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts sockets until cancelled, spawning a peer per completed
    /// triple.
    pub async fn run(self, house: Arc<ClearingHouse>, cancel: CancellationToken) -> Result<()> {
        let (socket_tx, mut socket_rx) = mpsc::channel::<(Dial, TcpStream, SocketAddr)>(16);
        let mut accept_tasks: JoinSet<Result<()>> = JoinSet::new();
        for (slot, listener) in self.listeners.into_iter().enumerate() {
            let socket_tx = socket_tx.clone();
            accept_tasks.spawn(async move {
                let mut preambles: JoinSet<()> = JoinSet::new();
                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            let (socket, remote) = accepted.context("accept failed")?;
                            let socket_tx = socket_tx.clone();
                            // Read the preamble off the accept path so a
                            // stalled client cannot hold up the listener.
                            preambles.spawn(async move {
                                match timeout(HANDSHAKE_TIMEOUT, read_preamble_checked(socket, slot)).await {
                                    Ok(Ok((dial, socket))) => {
                                        let _ = socket_tx.send((dial, socket, remote)).await;
                                    }
                                    Ok(Err(err)) => debug!(%remote, %err, "bad dial preamble"),
                                    Err(_) => debug!(%remote, "dial preamble timed out"),
                                }
                            });
                        }
                        Some(_) = preambles.join_next(), if !preambles.is_empty() => {}
                    }
                }
            });
        }
        drop(socket_tx);

        let mut pending: HashMap<(IpAddr, u64), Assembly> = HashMap::new();
        let mut peer_tasks: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(result) = accept_tasks.join_next() => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => return Err(err),
                        Err(join_err) if join_err.is_cancelled() => {}
                        Err(join_err) => return Err(join_err).context("accept task panicked"),
                    }
                }
                Some(_) = peer_tasks.join_next(), if !peer_tasks.is_empty() => {}
                received = socket_rx.recv() => {
                    let Some((dial, socket, remote)) = received else { break };
                    pending.retain(|(host, _), assembly| {
                        if assembly.expired() {
                            warn!(%host, "discarding half-assembled connection");
                            false
                        } else {
                            true
                        }
                    });
                    let assembly = pending.entry((remote.ip(), dial.token)).or_default();
                    assembly.slots[dial.slot as usize] = Some(socket);
                    if let Some(sockets) = assembly.take_triple() {
                        pending.remove(&(remote.ip(), dial.token));
                        let connection = Connection::from_sockets(remote, sockets);
                        let house = house.clone();
                        peer_tasks.spawn(async move {
                            if let Err(err) = Peer::run(connection, house).await {
                                debug!(%remote, %err, "inbound peer ended");
                            }
                        });
                    }
                }
            }
        }
        peer_tasks.shutdown().await;
        accept_tasks.shutdown().await;
        Ok(())
    }
}

/// Reads and validates a socket's dial preamble; the slot it names must
/// belong to the listener that accepted it.
async fn read_preamble_checked(
    mut socket: TcpStream,
    expected_slot: usize,
) -> Result<(Dial, TcpStream)> {
    let dial = read_preamble(&mut socket).await?;
    if dial.slot as usize != expected_slot {
        bail!(
            "stream {} dialed the port of stream {expected_slot}",
            dial.slot
        );
    }
    Ok((dial, socket))
}

/// Sockets of one dialing client, grouped by stream slot until the triple
/// is present. Abandoned after the handshake window to shed clients that
/// died mid-dial.
struct Assembly {
    slots: [Option<TcpStream>; SOCKET_COUNT as usize],
    started: Instant,
}

impl Default for Assembly {
    fn default() -> Self {
        Self {
            slots: Default::default(),
            started: Instant::now(),
        }
    }
}

impl Assembly {
    fn take_triple(&mut self) -> Option<[TcpStream; SOCKET_COUNT as usize]> {
        if self.slots.iter().any(Option::is_none) {
            return None;
        }
        let request = self.slots[REQUEST_STREAM].take().expect("slot checked");
        let notice = self.slots[NOTICE_STREAM].take().expect("slot checked");
        let data = self.slots[DATA_STREAM].take().expect("slot checked");
        Some([request, notice, data])
    }

    fn expired(&self) -> bool {
        self.started.elapsed() > 2 * HANDSHAKE_TIMEOUT
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Server[{}]", self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::Server;

    #[tokio::test]
    async fn bind_scans_past_occupied_ports() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let first = Server::bind(ip, 40500, 40520).await.unwrap();
        let second = Server::bind(ip, 40500, 40520).await.unwrap();
        assert_ne!(first.local_addr().port(), second.local_addr().port());
        assert!(second.local_addr().port() >= first.local_addr().port() + 3);
    }

    #[tokio::test]
    async fn bind_fails_when_range_is_exhausted() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let _first = Server::bind(ip, 40530, 40535).await.unwrap();
        let _second = Server::bind(ip, 40530, 40535).await.unwrap();
        assert!(Server::bind(ip, 40530, 40535).await.is_err());
    }
}
