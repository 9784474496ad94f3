use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sruth_core::{from_cbor, to_cbor, Notice, Piece, RecordCodec, Request, PIECE_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::trace;

/// Number of TCP sockets bundled into one connection: one per stream.
pub const SOCKET_COUNT: u16 = 3;

/// Stream indexes, in the order the client dials the server's consecutive
/// ports.
pub const REQUEST_STREAM: usize = 0;
pub const NOTICE_STREAM: usize = 1;
pub const DATA_STREAM: usize = 2;

/// Soft read timeout shared by all three streams; silence this long is
/// treated as a dead peer.
pub const SO_TIMEOUT: Duration = Duration::from_secs(120);

/// Bound on how long the predicate exchange may take.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Frame limits: control records are small, data records carry one piece.
pub const MAX_CONTROL_FRAME: usize = 1 << 20;
pub const MAX_DATA_FRAME: usize = PIECE_SIZE as usize + 4096;

/// First record on every freshly dialed socket: which connection it
/// belongs to and which stream it carries. The random token disambiguates
/// concurrent clients behind one host.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Dial {
    pub token: u64,
    pub slot: u8,
}

/// Writes one length-prefixed CBOR record directly onto a raw socket, for
/// the dial preamble exchanged before the typed codecs take over.
async fn write_preamble(socket: &mut TcpStream, dial: &Dial) -> Result<()> {
    let body = to_cbor(dial)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    socket.write_all(&frame).await?;
    Ok(())
}

/// Counterpart of [`write_preamble`]; used by the server on every accepted
/// socket.
pub(crate) async fn read_preamble(socket: &mut TcpStream) -> Result<Dial> {
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > 64 {
        bail!("oversized dial preamble ({len} bytes)");
    }
    let mut body = vec![0u8; len];
    socket.read_exact(&mut body).await?;
    let dial: Dial = from_cbor(&body).context("unreadable dial preamble")?;
    if dial.slot >= SOCKET_COUNT as u8 {
        bail!("dial preamble names stream {}", dial.slot);
    }
    Ok(dial)
}

pub type RequestChannel = Framed<TcpStream, RecordCodec<Request>>;
pub type NoticeChannel = Framed<TcpStream, RecordCodec<Notice>>;
pub type DataChannel = Framed<TcpStream, RecordCodec<Piece>>;

pub type RequestSink = futures_util::stream::SplitSink<RequestChannel, Request>;
pub type RequestStream = futures_util::stream::SplitStream<RequestChannel>;
pub type NoticeSink = futures_util::stream::SplitSink<NoticeChannel, Notice>;
pub type NoticeStream = futures_util::stream::SplitStream<NoticeChannel>;
pub type DataSink = futures_util::stream::SplitSink<DataChannel, Piece>;
pub type DataStream = futures_util::stream::SplitStream<DataChannel>;

/// A bundle of three TCP sockets between the same two endpoints, one per
/// typed stream. Separating control records from bulk piece payloads keeps
/// requests and notices from starving behind a multi-megabyte transfer.
pub struct Connection {
    remote: SocketAddr,
    request: RequestChannel,
    notice: NoticeChannel,
    data: DataChannel,
}

impl Connection {
    /// Dials the three consecutive ports of a remote server, in ascending
    /// order: request, notice, data. Each socket announces itself with a
    /// dial preamble so the server can reassemble the triple.
    pub async fn connect(server: SocketAddr) -> Result<Self> {
        let token: u64 = rand::random();
        let mut sockets = Vec::with_capacity(SOCKET_COUNT as usize);
        for offset in 0..SOCKET_COUNT {
            let port = server.port().checked_add(offset).with_context(|| {
                format!(
                    "server port {} leaves no room for {SOCKET_COUNT} streams",
                    server.port()
                )
            })?;
            let mut addr = server;
            addr.set_port(port);
            let mut socket = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
                .await
                .with_context(|| format!("connecting to {addr} timed out"))?
                .with_context(|| format!("couldn't connect to {addr}"))?;
            socket.set_nodelay(true)?;
            write_preamble(
                &mut socket,
                &Dial {
                    token,
                    slot: offset as u8,
                },
            )
            .await
            .with_context(|| format!("couldn't announce stream to {addr}"))?;
            sockets.push(socket);
        }
        trace!(%server, "connected");
        let mut sockets = sockets.into_iter();
        Ok(Self::from_sockets(
            server,
            [
                sockets.next().expect("three sockets"),
                sockets.next().expect("three sockets"),
                sockets.next().expect("three sockets"),
            ],
        ))
    }

    /// Bundles three already-accepted sockets, ordered request, notice,
    /// data.
    pub fn from_sockets(remote: SocketAddr, sockets: [TcpStream; SOCKET_COUNT as usize]) -> Self {
        let [request, notice, data] = sockets;
        let _ = request.set_nodelay(true);
        let _ = notice.set_nodelay(true);
        let _ = data.set_nodelay(true);
        Self {
            remote,
            request: Framed::new(request, RecordCodec::new(MAX_CONTROL_FRAME)),
            notice: Framed::new(notice, RecordCodec::new(MAX_CONTROL_FRAME)),
            data: Framed::new(data, RecordCodec::new(MAX_DATA_FRAME)),
        }
    }

    /// The remote server address this connection was established with (for
    /// outbound connections) or the remote host observed by the acceptor.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Splits every stream into its read and write half, one per peer task.
    #[allow(clippy::type_complexity)]
    pub fn split(
        self,
    ) -> (
        (RequestSink, RequestStream),
        (NoticeSink, NoticeStream),
        (DataSink, DataStream),
    ) {
        (
            self.request.split(),
            self.notice.split(),
            self.data.split(),
        )
    }
}
