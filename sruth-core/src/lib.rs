mod bitset;
mod codec;
mod file;
mod filter;
mod message;
mod network;
mod path;
mod predicate;
mod spec;
mod time;

pub use bitset::FiniteBitSet;
pub use codec::{from_cbor, to_cbor, CodecError, RecordCodec};
pub use file::{FileId, FileInfo, InvalidFileInfo, Piece, PIECE_SIZE};
pub use filter::{Filter, PathPattern};
pub use message::{Notice, Request, TrackerQuery, TrackerReply};
pub use network::FilterServerMap;
pub use path::{ArchivePath, PathError, ADMIN_DIR, HIDDEN_DIR};
pub use predicate::Predicate;
pub use spec::{FilePieceSpecs, PieceSpec, PieceSpecSet};
pub use time::ArchiveTime;
