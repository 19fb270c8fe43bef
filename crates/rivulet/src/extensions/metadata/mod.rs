//! Types for the Metadata protocol, used to download the info dictionary of
//! a torrent from other peers when all we have is a magnet link.
//!
//! <http://www.bittorrent.org/beps/bep_0009.html>

mod codec;

pub use codec::*;

use hashbrown::HashSet;
use tracing::{debug, warn};

use crate::{
    bencode::{self, Dict, Value},
    error::Error,
    extensions::{ExtMsg, ExtensionKind},
    metainfo::InfoHash,
};

/// The info dictionary is split in pieces of 16 KiB, the last one may be
/// smaller.
pub const METADATA_PIECE_LEN: usize = 16384;

/// Remotes advertising an info larger than this are ignored.
pub const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetadataMsgType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl TryFrom<u64> for MetadataMsgType {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        use MetadataMsgType::*;
        match value {
            v if v == Request as u64 => Ok(Request),
            v if v == Data as u64 => Ok(Data),
            v if v == Reject as u64 => Ok(Reject),
            _ => Err(Error::MessageInvalid("ut_metadata msg_type")),
        }
    }
}

/// Messages of the extended metadata protocol, used to exchange pieces of the
/// `Info` of a metadata file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMsg {
    /// id: 0 Request(piece)
    Request(u32),

    /// id: 1, the bencoded dict is followed by the bytes of the piece.
    Data { piece: u32, total_size: u32, payload: Vec<u8> },

    /// id: 2, Reject(piece)
    Reject(u32),
}

impl MetadataMsg {
    pub const fn msg_type(&self) -> MetadataMsgType {
        match self {
            Self::Request(..) => MetadataMsgType::Request,
            Self::Data { .. } => MetadataMsgType::Data,
            Self::Reject(..) => MetadataMsgType::Reject,
        }
    }

    pub const fn piece(&self) -> u32 {
        match self {
            Self::Request(piece) | Self::Reject(piece) => *piece,
            Self::Data { piece, .. } => *piece,
        }
    }

    /// Build a data message with the `piece` of the raw info.
    pub fn data(piece: u32, raw_info: &[u8]) -> Option<Self> {
        let start = piece as usize * METADATA_PIECE_LEN;
        if start >= raw_info.len() {
            return None;
        }
        let end = (start + METADATA_PIECE_LEN).min(raw_info.len());

        Some(Self::Data {
            piece,
            total_size: raw_info.len() as u32,
            payload: raw_info[start..end].to_vec(),
        })
    }
}

impl ExtMsg for MetadataMsg {
    const ID: u8 = ExtensionKind::Metadata.local_id();

    fn to_payload(&self) -> Result<Vec<u8>, Error> {
        let mut dict = Dict::new();
        dict.insert("msg_type", self.msg_type() as u8);
        dict.insert("piece", self.piece());

        match self {
            Self::Data { total_size, payload, .. } => {
                dict.insert("total_size", *total_size);
                let mut buf = bencode::encode(&dict.into());
                buf.extend_from_slice(payload);
                Ok(buf)
            }
            _ => Ok(bencode::encode(&dict.into())),
        }
    }

    fn from_payload(payload: &[u8]) -> Result<Self, Error> {
        // the dict of a data message is followed by the raw piece.
        let (value, consumed) = bencode::decode_prefix(payload)?;

        let uint = |key: &'static str| {
            value
                .get(key.as_bytes())
                .and_then(Value::as_uint)
                .ok_or(Error::MessageInvalid("ut_metadata dict"))
        };

        let msg_type = MetadataMsgType::try_from(uint("msg_type")?)?;
        let piece = u32::try_from(uint("piece")?)
            .map_err(|_| Error::MessageInvalid("ut_metadata piece"))?;

        Ok(match msg_type {
            MetadataMsgType::Request => Self::Request(piece),
            MetadataMsgType::Reject => Self::Reject(piece),
            MetadataMsgType::Data => {
                let total_size = u32::try_from(uint("total_size")?)
                    .map_err(|_| Error::MessageInvalid("ut_metadata size"))?;
                Self::Data {
                    piece,
                    total_size,
                    payload: payload[consumed..].to_vec(),
                }
            }
        })
    }
}

/// Outcome of [`MetadataAssembler::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataProgress {
    /// The piece was stored, more are missing.
    Pending,
    /// The piece is not expected, has the wrong length, or was already
    /// received.
    Ignored,
    /// Every piece arrived and the info hashes to the info hash of the
    /// torrent.
    Complete(Vec<u8>),
    /// Every piece arrived but the hash doesn't match, the assembler starts
    /// over.
    Mismatch,
}

/// Collects the pieces of the info dictionary sent by peers.
#[derive(Debug, Clone)]
pub struct MetadataAssembler {
    info_hash: InfoHash,
    buf: Vec<u8>,
    received: HashSet<u32>,
}

impl MetadataAssembler {
    pub fn new(info_hash: InfoHash, size: usize) -> Option<Self> {
        if size == 0 || size > MAX_METADATA_SIZE {
            warn!("ignoring metadata_size of {size}");
            return None;
        }
        Some(Self { info_hash, buf: vec![0; size], received: HashSet::new() })
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn pieces(&self) -> u32 {
        self.buf.len().div_ceil(METADATA_PIECE_LEN) as u32
    }

    fn piece_len(&self, piece: u32) -> usize {
        let start = piece as usize * METADATA_PIECE_LEN;
        (self.buf.len() - start).min(METADATA_PIECE_LEN)
    }

    /// Pieces not received yet, in order.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.pieces()).filter(|p| !self.received.contains(p)).collect()
    }

    pub fn insert(&mut self, piece: u32, data: &[u8]) -> MetadataProgress {
        if piece >= self.pieces()
            || data.len() != self.piece_len(piece)
            || self.received.contains(&piece)
        {
            return MetadataProgress::Ignored;
        }

        let start = piece as usize * METADATA_PIECE_LEN;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.received.insert(piece);

        if self.received.len() < self.pieces() as usize {
            return MetadataProgress::Pending;
        }

        if InfoHash::of(&self.buf) == self.info_hash {
            debug!("metadata of {} bytes verified", self.buf.len());
            MetadataProgress::Complete(self.buf.clone())
        } else {
            warn!("assembled metadata does not match the info hash");
            self.received.clear();
            MetadataProgress::Mismatch
        }
    }
}
