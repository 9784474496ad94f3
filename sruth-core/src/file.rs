use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::path::ArchivePath;
use crate::time::ArchiveTime;

/// The canonical size, in bytes, of a piece of data.
pub const PIECE_SIZE: u32 = 0x20000;

/// Immutable identity of a particular version of an archive file.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    path: ArchivePath,
    time: ArchiveTime,
}

impl FileId {
    pub fn new(path: ArchivePath, time: ArchiveTime) -> Self {
        Self { path, time }
    }

    pub fn path(&self) -> &ArchivePath {
        &self.path
    }

    pub fn time(&self) -> ArchiveTime {
        self.time
    }
}

impl Ord for FileId {
    fn cmp(&self, other: &Self) -> Ordering {
        // More recent files sort first, then by pathname.
        self.time
            .cmp(&other.time)
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for FileId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:?}", self.path, self.time)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// Everything a peer needs to know about a file before holding any of its
/// bytes: identity, size, piece geometry, and time-to-live.
///
/// Deserialization validates the piece size, so a record off the wire can
/// never carry a zero piece size into the piece-geometry arithmetic.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "WireFileInfo")]
pub struct FileInfo {
    id: FileId,
    size: u64,
    piece_size: u32,
    ttl_seconds: i32,
}

/// Unvalidated wire shape of [`FileInfo`]; field names match so the
/// serialized forms are identical.
#[derive(Deserialize)]
struct WireFileInfo {
    id: FileId,
    size: u64,
    piece_size: u32,
    ttl_seconds: i32,
}

#[derive(Debug, thiserror::Error)]
#[error("piece size must be positive")]
pub struct InvalidFileInfo;

impl TryFrom<WireFileInfo> for FileInfo {
    type Error = InvalidFileInfo;

    fn try_from(wire: WireFileInfo) -> Result<Self, Self::Error> {
        if wire.piece_size == 0 {
            return Err(InvalidFileInfo);
        }
        Ok(Self {
            id: wire.id,
            size: wire.size,
            piece_size: wire.piece_size,
            ttl_seconds: wire.ttl_seconds,
        })
    }
}

impl FileInfo {
    pub fn new(id: FileId, size: u64, piece_size: u32, ttl_seconds: i32) -> Self {
        assert!(piece_size > 0, "piece size must be positive");
        Self {
            id,
            size,
            piece_size,
            ttl_seconds,
        }
    }

    pub fn id(&self) -> &FileId {
        &self.id
    }

    pub fn path(&self) -> &ArchivePath {
        self.id.path()
    }

    pub fn time(&self) -> ArchiveTime {
        self.id.time()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    /// Seconds after arrival at which the file expires; negative means never.
    pub fn ttl_seconds(&self) -> i32 {
        self.ttl_seconds
    }

    pub fn never_expires(&self) -> bool {
        self.ttl_seconds < 0
    }

    /// Number of pieces in the file. An empty file still has one (empty)
    /// piece so that its arrival is observable.
    pub fn piece_count(&self) -> u32 {
        let count = self.size.div_ceil(u64::from(self.piece_size));
        count.max(1) as u32
    }

    pub fn offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.piece_size)
    }

    /// Payload length of the piece at `index`; the final piece may be short.
    pub fn piece_len(&self, index: u32) -> u32 {
        let offset = self.offset(index);
        u64::from(self.piece_size).min(self.size - offset.min(self.size)) as u32
    }

    pub fn valid_index(&self, index: u32) -> bool {
        index < self.piece_count()
    }
}

impl fmt::Debug for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileInfo[{:?}, size={}, pieces={}]",
            self.id,
            self.size,
            self.piece_count()
        )
    }
}

/// A contiguous byte range of a file: the unit of transfer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    info: FileInfo,
    index: u32,
    data: Bytes,
}

impl Piece {
    pub fn new(info: FileInfo, index: u32, data: Bytes) -> Self {
        assert!(info.valid_index(index), "piece index out of range");
        assert_eq!(
            data.len(),
            info.piece_len(index) as usize,
            "piece payload length mismatch"
        );
        Self { info, index, data }
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.info.offset(self.index)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Declared-size vs payload-length consistency check for records that
    /// arrived off the wire.
    pub fn is_consistent(&self) -> bool {
        self.info.valid_index(self.index)
            && self.data.len() == self.info.piece_len(self.index) as usize
    }
}

impl fmt::Debug for Piece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Piece[{:?}#{}]", self.info.id(), self.index)
    }
}
