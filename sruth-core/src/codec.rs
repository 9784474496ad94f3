use std::io;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Bytes of length prefix on every wire record.
const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("record of {len} bytes exceeds the {max}-byte frame limit")]
    Oversized { len: usize, max: usize },
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Codec for one typed stream: each record is a `u32` big-endian body length
/// followed by the CBOR encoding of the record. CBOR bodies are
/// self-describing, so unknown input fails decoding instead of being
/// misread.
#[derive(Debug, Clone)]
pub struct RecordCodec<T> {
    max_frame: usize,
    _marker: PhantomData<T>,
}

impl<T> RecordCodec<T> {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize> Encoder<T> for RecordCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, record: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = Vec::new();
        ciborium::into_writer(&record, &mut body)
            .map_err(|err| CodecError::Corrupt(err.to_string()))?;
        if body.len() > self.max_frame {
            return Err(CodecError::Oversized {
                len: body.len(),
                max: self.max_frame,
            });
        }
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

impl<T: DeserializeOwned> Decoder for RecordCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame {
            return Err(CodecError::Oversized {
                len,
                max: self.max_frame,
            });
        }
        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX);
        let body = src.split_to(len);
        let record = ciborium::from_reader(body.as_ref())
            .map_err(|err: ciborium::de::Error<io::Error>| {
                CodecError::Corrupt(err.to_string())
            })?;
        Ok(Some(record))
    }
}

/// Bare CBOR encoding without the length prefix, used for on-disk snapshots
/// and single-datagram payloads.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|err| CodecError::Corrupt(err.to_string()))?;
    Ok(bytes)
}

pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(bytes)
        .map_err(|err: ciborium::de::Error<io::Error>| CodecError::Corrupt(err.to_string()))
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use super::{CodecError, RecordCodec};
    use crate::file::{FileId, FileInfo, Piece, PIECE_SIZE};
    use crate::message::{Notice, Request};
    use crate::path::ArchivePath;
    use crate::predicate::Predicate;
    use crate::spec::PieceSpecSet;
    use crate::time::ArchiveTime;

    fn info() -> FileInfo {
        let id = FileId::new(
            ArchivePath::new("a/b.txt").unwrap(),
            ArchiveTime::from_millis(42),
        );
        FileInfo::new(id, 200_000, PIECE_SIZE, 3600)
    }

    #[test]
    fn notice_round_trip() {
        let mut codec = RecordCodec::<Notice>::new(1 << 20);
        let notice = Notice::Available(PieceSpecSet::whole_file(info()));

        let mut buffer = BytesMut::new();
        codec.encode(notice.clone(), &mut buffer).unwrap();
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, notice);
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = RecordCodec::<Request>::new(1 << 20);
        let mut buffer = BytesMut::new();
        codec
            .encode(Request::Handshake(Predicate::everything()), &mut buffer)
            .unwrap();

        let mut partial = buffer.split_to(buffer.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buffer);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn piece_payload_survives() {
        let info = info();
        let payload: Vec<u8> = (0..info.piece_len(1)).map(|i| (i % 256) as u8).collect();
        let piece = Piece::new(info, 1, payload.clone().into());

        let mut codec = RecordCodec::<Piece>::new(PIECE_SIZE as usize + 4096);
        let mut buffer = BytesMut::new();
        codec.encode(piece.clone(), &mut buffer).unwrap();
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded.data().as_ref(), payload.as_slice());
        assert!(decoded.is_consistent());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = RecordCodec::<Vec<u8>>::new(16);
        let mut buffer = BytesMut::new();
        let result = codec.encode(vec![0u8; 64], &mut buffer);
        assert!(matches!(result, Err(CodecError::Oversized { .. })));
    }
}
