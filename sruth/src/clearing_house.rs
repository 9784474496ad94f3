use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use sruth_archive::Archive;
use sruth_core::{
    FileId, Notice, Piece, PieceSpec, PieceSpecSet, Predicate,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Identifies a live peer within one node.
pub type PeerId = u64;

/// One piece of one file version.
type PieceKey = (FileId, u32);

/// Capacity of each peer's outbound notice and request queues; a slow
/// socket pushes back on whoever is producing for it.
const PEER_QUEUE: usize = 64;

/// The channel ends handed to a newly registered peer: the receivers its
/// sender tasks drain, plus a handle for enqueueing its own notices.
pub struct PeerIo {
    pub notice_tx: mpsc::Sender<Notice>,
    pub notice_rx: mpsc::Receiver<Notice>,
    pub request_rx: mpsc::Receiver<PieceSpecSet>,
}

/// Node-wide broker between the archive and the peers.
///
/// Holds the local predicate, tracks which peer every outstanding request
/// was sent to, and routes archive events to the peers whose remote
/// predicate wants them. Decisions happen under one lock; channel sends
/// happen after it is released.
pub struct ClearingHouse {
    archive: Archive,
    inner: Mutex<Inner>,
}

struct Inner {
    predicate: Predicate,
    peers: HashMap<PeerId, PeerEntry>,
    /// For every requested-but-unreceived piece, the one peer asked for it.
    outstanding: HashMap<PieceKey, PeerId>,
    next_peer: PeerId,
}

struct PeerEntry {
    remote_predicate: Predicate,
    notice_tx: mpsc::Sender<Notice>,
    request_tx: mpsc::Sender<PieceSpecSet>,
    /// Pieces this peer has claimed to hold and we still care about; the
    /// fallback supply when another peer dies with requests in flight.
    offered: HashMap<PieceKey, PieceSpec>,
}

impl ClearingHouse {
    pub fn new(archive: Archive, predicate: Predicate) -> Arc<Self> {
        Arc::new(Self {
            archive,
            inner: Mutex::new(Inner {
                predicate,
                peers: HashMap::new(),
                outstanding: HashMap::new(),
                next_peer: 0,
            }),
        })
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn local_predicate(&self) -> Predicate {
        self.lock().predicate.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("clearing house lock")
    }

    pub fn register_peer(&self, remote_predicate: Predicate) -> (PeerId, PeerIo) {
        let (notice_tx, notice_rx) = mpsc::channel(PEER_QUEUE);
        let (request_tx, request_rx) = mpsc::channel(PEER_QUEUE);
        let mut inner = self.lock();
        let id = inner.next_peer;
        inner.next_peer += 1;
        inner.peers.insert(
            id,
            PeerEntry {
                remote_predicate,
                notice_tx: notice_tx.clone(),
                request_tx,
                offered: HashMap::new(),
            },
        );
        debug!(peer = id, "peer registered");
        (
            id,
            PeerIo {
                notice_tx,
                notice_rx,
                request_rx,
            },
        )
    }

    /// Reclaims a dead peer's outstanding requests, reassigning each piece
    /// to another live peer that has offered it; the rest return to the
    /// pool of unsatisfied demand.
    pub async fn peer_disconnected(&self, peer: PeerId) {
        let mut sends: Vec<(mpsc::Sender<PieceSpecSet>, PieceSpecSet)> = Vec::new();
        {
            let mut inner = self.lock();
            if inner.peers.remove(&peer).is_none() {
                return;
            }
            let reclaimed: Vec<PieceKey> = inner
                .outstanding
                .iter()
                .filter(|(_, owner)| **owner == peer)
                .map(|(key, _)| key.clone())
                .collect();
            debug!(peer, reclaimed = reclaimed.len(), "peer disconnected");
            let mut reassigned: HashMap<PeerId, PieceSpecSet> = HashMap::new();
            for key in reclaimed {
                inner.outstanding.remove(&key);
                let supplier = inner
                    .peers
                    .iter()
                    .find(|(_, entry)| entry.offered.contains_key(&key))
                    .map(|(id, entry)| (*id, entry.offered[&key].clone()));
                if let Some((supplier, spec)) = supplier {
                    inner.outstanding.insert(key, supplier);
                    reassigned.entry(supplier).or_default().add(spec);
                }
            }
            for (supplier, set) in reassigned {
                if let Some(entry) = inner.peers.get(&supplier) {
                    sends.push((entry.request_tx.clone(), set));
                }
            }
        }
        for (tx, set) in sends {
            let _ = tx.send(set).await;
        }
    }

    /// Handles a notice from a remote peer: records its offers and requests
    /// every offered piece the local predicate wants, the archive lacks,
    /// and nobody has been asked for yet.
    pub async fn process_notice(&self, peer: PeerId, notice: Notice) -> Result<()> {
        match notice {
            Notice::Available(specs) => self.process_offer(peer, specs).await,
            Notice::Removed(id) => self.process_removal(peer, id).await,
        }
    }

    async fn process_offer(&self, peer: PeerId, specs: PieceSpecSet) -> Result<()> {
        // Expand the wire record before taking the broker lock; nothing
        // fallible runs while it is held.
        let pieces: Vec<PieceSpec> = specs.iter_pieces().collect();

        // First pass: remember the offers and pick the candidates the
        // predicate wants and nobody was asked for.
        let mut candidates: Vec<PieceSpec> = Vec::new();
        {
            let mut inner = self.lock();
            let predicate = inner.predicate.clone();
            let Some(entry) = inner.peers.get_mut(&peer) else {
                return Ok(());
            };
            for spec in pieces {
                if !predicate.matches(spec.info.path()) {
                    continue;
                }
                entry.offered.insert(spec.id(), spec.clone());
                candidates.push(spec);
            }
        }

        // Archive lookups happen without the broker lock held.
        let mut wanted = Vec::new();
        for spec in candidates {
            if !self
                .archive
                .exists(&spec)
                .context("couldn't check archive for offered piece")?
            {
                wanted.push(spec);
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }

        // Second pass: claim whatever is still unclaimed.
        let mut requests = PieceSpecSet::new();
        let tx = {
            let mut inner = self.lock();
            if !inner.peers.contains_key(&peer) {
                return Ok(());
            }
            for spec in wanted {
                let key = spec.id();
                if inner.outstanding.contains_key(&key) {
                    continue;
                }
                inner.outstanding.insert(key, peer);
                requests.add(spec);
            }
            if requests.is_empty() {
                return Ok(());
            }
            inner.peers[&peer].request_tx.clone()
        };
        trace!(peer, "requesting offered pieces");
        tx.send(requests)
            .await
            .context("peer request queue closed")?;
        Ok(())
    }

    async fn process_removal(&self, peer: PeerId, id: FileId) -> Result<()> {
        {
            // The pathname is gone; drop every version's bookkeeping.
            let mut inner = self.lock();
            inner
                .outstanding
                .retain(|(file, _), _| file.path() != id.path());
            for entry in inner.peers.values_mut() {
                entry.offered.retain(|(file, _), _| file.path() != id.path());
            }
        }
        let removed = self
            .archive
            .remove(&id)
            .with_context(|| format!("couldn't remove {id}"))?;
        if removed {
            debug!(file = %id, "removed on notice");
            self.broadcast_removed(id, Some(peer)).await;
        }
        Ok(())
    }

    /// Handles a delivered piece. Unrequested pieces are dropped without
    /// penalty; corrupt ones fail the peer.
    pub async fn process_piece(&self, peer: PeerId, piece: Piece) -> Result<()> {
        if !piece.is_consistent() {
            bail!("corrupt piece from peer {peer}: {piece:?}");
        }
        let key = (piece.info().id().clone(), piece.index());
        {
            let mut inner = self.lock();
            if inner.outstanding.remove(&key).is_none() {
                trace!(peer, piece = ?piece, "dropping unrequested piece");
                return Ok(());
            }
            for entry in inner.peers.values_mut() {
                entry.offered.remove(&key);
            }
        }

        let complete = self
            .archive
            .put_piece(&piece)
            .with_context(|| format!("couldn't store {piece:?}"))?;
        if !complete {
            return Ok(());
        }

        // The file is whole: narrow the predicate, drop any leftover
        // bookkeeping for it and for superseded versions of the same
        // pathname, and offer it onwards.
        let info = piece.info().clone();
        {
            let mut inner = self.lock();
            let path = info.path().clone();
            let time = info.time();
            inner
                .outstanding
                .retain(|(id, _), _| id.path() != &path || id.time().newer_than(&time));
            for entry in inner.peers.values_mut() {
                entry
                    .offered
                    .retain(|(id, _), _| id.path() != &path || id.time().newer_than(&time));
            }
            if inner.predicate.satisfied_by(info.path()) {
                debug!(file = %info.id(), "predicate narrowed");
            }
        }
        self.broadcast_available(PieceSpecSet::whole_file(info), Some(peer))
            .await;
        Ok(())
    }

    /// Offers pieces to every peer whose remote predicate matches,
    /// excluding the peer the data came from.
    pub async fn broadcast_available(&self, specs: PieceSpecSet, exclude: Option<PeerId>) {
        let mut sends: Vec<(mpsc::Sender<Notice>, Notice)> = Vec::new();
        {
            let inner = self.lock();
            for (id, entry) in &inner.peers {
                if Some(*id) == exclude || entry.remote_predicate.matches_nothing() {
                    continue;
                }
                let mut subset = PieceSpecSet::new();
                for file in specs.files() {
                    if entry.remote_predicate.matches(file.info.path()) {
                        subset.merge(file.clone());
                    }
                }
                if !subset.is_empty() {
                    sends.push((entry.notice_tx.clone(), Notice::Available(subset)));
                }
            }
        }
        for (tx, notice) in sends {
            let _ = tx.send(notice).await;
        }
    }

    /// Propagates a removal to every peer whose remote predicate matches.
    pub async fn broadcast_removed(&self, id: FileId, exclude: Option<PeerId>) {
        let mut sends: Vec<(mpsc::Sender<Notice>, Notice)> = Vec::new();
        {
            let inner = self.lock();
            for (peer, entry) in &inner.peers {
                if Some(*peer) == exclude || entry.remote_predicate.matches_nothing() {
                    continue;
                }
                if entry.remote_predicate.matches(id.path()) {
                    sends.push((entry.notice_tx.clone(), Notice::Removed(id.clone())));
                }
            }
        }
        for (tx, notice) in sends {
            let _ = tx.send(notice).await;
        }
    }

    /// Number of requests currently in flight; zero at quiescence.
    pub fn outstanding_count(&self) -> usize {
        self.lock().outstanding.len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use sruth_archive::{Archive, ArchiveConfig};
    use sruth_core::{
        ArchivePath, ArchiveTime, FileId, FileInfo, Filter, Notice, Piece, PieceSpecSet,
        Predicate,
    };
    use tempfile::TempDir;

    use super::ClearingHouse;

    const PIECE: u32 = 8;

    fn archive(root: &TempDir) -> Archive {
        Archive::open(
            root.path(),
            ArchiveConfig {
                active_file_cache_size: 8,
                default_ttl_seconds: 3600,
                piece_size: PIECE,
            },
        )
        .unwrap()
    }

    fn info(name: &str, size: u64) -> FileInfo {
        let id = FileId::new(ArchivePath::new(name).unwrap(), ArchiveTime::from_millis(1_000));
        FileInfo::new(id, size, PIECE, 3600)
    }

    fn piece(info: &FileInfo, index: u32, fill: u8) -> Piece {
        Piece::new(
            info.clone(),
            index,
            Bytes::from(vec![fill; info.piece_len(index) as usize]),
        )
    }

    #[tokio::test]
    async fn offer_produces_one_request_per_piece() {
        let root = TempDir::new().unwrap();
        let house = ClearingHouse::new(archive(&root), Predicate::everything());
        let (first, mut first_io) = house.register_peer(Predicate::nothing());
        let (second, _second_io) = house.register_peer(Predicate::nothing());

        let offer = PieceSpecSet::whole_file(info("a/b.bin", 12));
        house
            .process_notice(first, Notice::Available(offer.clone()))
            .await
            .unwrap();
        // A second peer offering the same pieces is not asked again.
        house
            .process_notice(second, Notice::Available(offer))
            .await
            .unwrap();

        let requested = first_io.request_rx.recv().await.unwrap();
        assert_eq!(requested.iter_pieces().count(), 2);
        assert_eq!(house.outstanding_count(), 2);
    }

    #[tokio::test]
    async fn delivered_piece_clears_bookkeeping_and_renotifies() {
        let root = TempDir::new().unwrap();
        let house = ClearingHouse::new(archive(&root), Predicate::everything());
        let (supplier, _supplier_io) = house.register_peer(Predicate::nothing());
        let (downstream, mut downstream_io) = house.register_peer(Predicate::everything());

        let info = info("a/b.bin", 4);
        house
            .process_notice(
                supplier,
                Notice::Available(PieceSpecSet::whole_file(info.clone())),
            )
            .await
            .unwrap();
        assert_eq!(house.outstanding_count(), 1);

        house
            .process_piece(supplier, piece(&info, 0, 7))
            .await
            .unwrap();
        assert_eq!(house.outstanding_count(), 0);

        // The completed file is offered to the interested peer.
        let notice = downstream_io.notice_rx.recv().await.unwrap();
        assert!(matches!(notice, Notice::Available(_)));
    }

    #[tokio::test]
    async fn unrequested_piece_is_dropped_silently() {
        let root = TempDir::new().unwrap();
        let house = ClearingHouse::new(archive(&root), Predicate::everything());
        let (peer, _io) = house.register_peer(Predicate::nothing());

        let info = info("a/b.bin", 4);
        house.process_piece(peer, piece(&info, 0, 7)).await.unwrap();
        assert!(!house.archive().exists(&sruth_core::PieceSpec::new(info, 0)).unwrap());
    }

    #[tokio::test]
    async fn disconnect_reassigns_to_another_offerer() {
        let root = TempDir::new().unwrap();
        let house = ClearingHouse::new(archive(&root), Predicate::everything());
        let (first, _first_io) = house.register_peer(Predicate::nothing());
        let (second, mut second_io) = house.register_peer(Predicate::nothing());

        let offer = PieceSpecSet::whole_file(info("a/b.bin", 4));
        house
            .process_notice(first, Notice::Available(offer.clone()))
            .await
            .unwrap();
        house
            .process_notice(second, Notice::Available(offer))
            .await
            .unwrap();

        house.peer_disconnected(first).await;
        let reassigned = second_io.request_rx.recv().await.unwrap();
        assert_eq!(reassigned.iter_pieces().count(), 1);
        assert_eq!(house.outstanding_count(), 1);
    }

    #[tokio::test]
    async fn offers_outside_predicate_are_ignored() {
        let root = TempDir::new().unwrap();
        let predicate = Predicate::new(vec![Filter::Prefix(
            ArchivePath::new("wanted").unwrap(),
        )]);
        let house = ClearingHouse::new(archive(&root), predicate);
        let (peer, mut io) = house.register_peer(Predicate::nothing());

        house
            .process_notice(
                peer,
                Notice::Available(PieceSpecSet::whole_file(info("other/file", 4))),
            )
            .await
            .unwrap();
        assert_eq!(house.outstanding_count(), 0);
        assert!(io.request_rx.try_recv().is_err());
    }
}
