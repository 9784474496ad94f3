use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use sruth_archive::Archive;
use sruth_core::{Notice, Piece, PieceSpecSet, Predicate, Request};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::clearing_house::{ClearingHouse, PeerId, PeerIo};
use crate::connection::{
    Connection, DataSink, DataStream, NoticeSink, NoticeStream, RequestSink, RequestStream,
    HANDSHAKE_TIMEOUT, SO_TIMEOUT,
};

/// Capacity of the local queue between the request receiver and the piece
/// sender; a slow data socket pushes back on request processing.
const PIECE_QUEUE: usize = 16;

/// Label distinguishing the short-lived initial-offer task from the six
/// stream tasks whose termination ends the peer.
const OFFER_TASK: &str = "offer";

/// A full-duplex protocol engine over one connection.
///
/// After exchanging predicates, six tasks run until the first of them
/// finishes or fails: three senders draining outbound queues and three
/// receivers dispatching inbound records. The clearing house reclaims the
/// peer's outstanding requests afterwards.
pub struct Peer;

impl Peer {
    pub async fn run(connection: Connection, house: Arc<ClearingHouse>) -> Result<()> {
        let remote = connection.remote();
        let ((mut request_sink, mut request_stream), notice_pair, data_pair) =
            connection.split();

        // Handshake: each side writes its predicate on the request stream
        // and reads the remote's before normal operation begins.
        let local = house.local_predicate();
        request_sink
            .send(Request::Handshake(local))
            .await
            .context("couldn't send handshake")?;
        let remote_predicate = match timeout(HANDSHAKE_TIMEOUT, request_stream.next()).await {
            Err(_) => bail!("handshake with {remote} timed out"),
            Ok(None) => bail!("{remote} closed during handshake"),
            Ok(Some(record)) => match record.context("handshake read failed")? {
                Request::Handshake(predicate) => predicate,
                Request::Pieces(_) => bail!("{remote} sent a request before its predicate"),
            },
        };
        debug!(%remote, predicate = %remote_predicate, "peer connected");

        let (peer_id, io) = house.register_peer(remote_predicate.clone());
        let result = Self::exchange(
            peer_id,
            &house,
            remote_predicate,
            (request_sink, request_stream),
            notice_pair,
            data_pair,
            io,
        )
        .await;
        house.peer_disconnected(peer_id).await;
        match &result {
            Ok(()) => debug!(%remote, "peer closed"),
            Err(err) => debug!(%remote, %err, "peer failed"),
        }
        result
    }

    async fn exchange(
        peer_id: PeerId,
        house: &Arc<ClearingHouse>,
        remote_predicate: Predicate,
        (request_sink, request_stream): (RequestSink, RequestStream),
        (notice_sink, notice_stream): (NoticeSink, NoticeStream),
        (data_sink, data_stream): (DataSink, DataStream),
        io: PeerIo,
    ) -> Result<()> {
        let PeerIo {
            notice_tx,
            notice_rx,
            request_rx,
        } = io;
        let (piece_tx, piece_rx) = mpsc::channel::<Piece>(PIECE_QUEUE);

        let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

        // Everything the archive already holds that the remote wants is
        // offered up front; live updates follow through the clearing house.
        if !remote_predicate.matches_nothing() {
            let archive = house.archive().clone();
            let offer_tx = notice_tx.clone();
            tasks.spawn(async move {
                (
                    OFFER_TASK,
                    offer_existing(archive, remote_predicate, offer_tx).await,
                )
            });
        }
        drop(notice_tx);

        tasks.spawn(async move { ("request sender", request_sender(request_sink, request_rx).await) });
        tasks.spawn(async move { ("notice sender", notice_sender(notice_sink, notice_rx).await) });
        tasks.spawn(async move { ("piece sender", piece_sender(data_sink, piece_rx).await) });
        {
            let archive = house.archive().clone();
            tasks.spawn(async move {
                (
                    "request receiver",
                    request_receiver(request_stream, archive, piece_tx).await,
                )
            });
        }
        {
            let house = house.clone();
            tasks.spawn(async move {
                (
                    "notice receiver",
                    notice_receiver(notice_stream, house, peer_id).await,
                )
            });
        }
        {
            let house = house.clone();
            tasks.spawn(async move {
                (
                    "piece receiver",
                    piece_receiver(data_stream, house, peer_id).await,
                )
            });
        }

        // The first stream task to finish, for any reason, ends the peer;
        // the initial-offer task is allowed to run to completion.
        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((OFFER_TASK, Ok(()))) => continue,
                Ok((task, Ok(()))) => {
                    trace!(task, "peer task finished");
                    break;
                }
                Ok((task, Err(err))) => {
                    result = Err(err.context(format!("{task} failed")));
                    break;
                }
                Err(join_err) if join_err.is_cancelled() => continue,
                Err(join_err) => {
                    result = Err(anyhow!(join_err).context("peer task panicked"));
                    break;
                }
            }
        }
        // Cancel the survivors; dropping their halves closes the sockets.
        tasks.shutdown().await;
        result
    }
}

/// Walks the archive for data matching the remote predicate and offers it.
async fn offer_existing(
    archive: Archive,
    predicate: Predicate,
    notice_tx: mpsc::Sender<Notice>,
) -> Result<()> {
    let filter = predicate.as_filter();
    let mut offers: Vec<PieceSpecSet> = Vec::new();
    archive.walk(&filter, &mut |specs| {
        // The walk filter over-approximates a multi-filter predicate, so
        // re-check each file against the predicate itself.
        let mut subset = PieceSpecSet::new();
        for file in specs.files() {
            if predicate.matches(file.info.path()) {
                subset.merge(file.clone());
            }
        }
        if !subset.is_empty() {
            offers.push(subset);
        }
    })?;
    for specs in offers {
        if notice_tx
            .send(Notice::Available(specs))
            .await
            .is_err()
        {
            break;
        }
    }
    Ok(())
}

async fn request_sender(
    mut sink: RequestSink,
    mut requests: mpsc::Receiver<PieceSpecSet>,
) -> Result<()> {
    while let Some(specs) = requests.recv().await {
        sink.send(Request::Pieces(specs))
            .await
            .context("couldn't send request")?;
    }
    Ok(())
}

async fn notice_sender(mut sink: NoticeSink, mut notices: mpsc::Receiver<Notice>) -> Result<()> {
    while let Some(notice) = notices.recv().await {
        sink.send(notice).await.context("couldn't send notice")?;
    }
    Ok(())
}

async fn piece_sender(mut sink: DataSink, mut pieces: mpsc::Receiver<Piece>) -> Result<()> {
    while let Some(piece) = pieces.recv().await {
        sink.send(piece).await.context("couldn't send piece")?;
    }
    Ok(())
}

/// Serves inbound requests from the archive. Pieces the archive no longer
/// holds are silently skipped; the offer was stale.
async fn request_receiver(
    mut stream: RequestStream,
    archive: Archive,
    piece_tx: mpsc::Sender<Piece>,
) -> Result<()> {
    loop {
        let record = match timeout(SO_TIMEOUT, stream.next()).await {
            Err(_) => bail!("request stream idle past timeout"),
            Ok(None) => return Ok(()),
            Ok(Some(record)) => record.context("request stream failed")?,
        };
        match record {
            Request::Handshake(_) => {
                warn!("ignoring repeated handshake");
            }
            Request::Pieces(specs) => {
                for spec in specs.iter_pieces() {
                    match archive.get_piece(&spec) {
                        Ok(Some(piece)) => {
                            if piece_tx.send(piece).await.is_err() {
                                return Ok(());
                            }
                        }
                        Ok(None) => trace!(?spec, "requested piece unavailable"),
                        Err(err) => return Err(err.context("couldn't read requested piece")),
                    }
                }
            }
        }
    }
}

async fn notice_receiver(
    mut stream: NoticeStream,
    house: Arc<ClearingHouse>,
    peer_id: PeerId,
) -> Result<()> {
    loop {
        let notice = match timeout(SO_TIMEOUT, stream.next()).await {
            Err(_) => bail!("notice stream idle past timeout"),
            Ok(None) => return Ok(()),
            Ok(Some(record)) => record.context("notice stream failed")?,
        };
        house.process_notice(peer_id, notice).await?;
    }
}

async fn piece_receiver(
    mut stream: DataStream,
    house: Arc<ClearingHouse>,
    peer_id: PeerId,
) -> Result<()> {
    loop {
        let piece = match timeout(SO_TIMEOUT, stream.next()).await {
            Err(_) => bail!("data stream idle past timeout"),
            Ok(None) => return Ok(()),
            Ok(Some(record)) => record.context("data stream failed")?,
        };
        house.process_piece(peer_id, piece).await?;
    }
}
