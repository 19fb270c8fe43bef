//! Metainfo is a .torrent file with information about the Torrent.
//! From the magnet link, we get the Info from other peers.

use std::{fmt::Display, ops::Deref};

use speedy::{Readable, Writable};
use thiserror::Error;

use crate::{
    bencode::{self, Decoder, Value},
    extensions::core::{BlockInfo, BLOCK_LEN},
};

/// A piece is buffered whole in memory while it is downloaded.
pub const MAX_PIECE_LENGTH: u64 = 256 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetainfoError {
    #[error("metainfo is not valid bencode: {0}")]
    Bencode(#[from] bencode::DecodeError),

    #[error("metainfo is not a dictionary")]
    NotADict,

    #[error("missing or malformed key `{0}`")]
    MissingKey(&'static str),

    #[error("the info has neither `length` nor `files`")]
    NoFiles,

    #[error("`pieces` has {0} bytes, not a multiple of 20")]
    PiecesLength(usize),

    #[error("{pieces} piece hashes for {total_size} bytes of content")]
    PieceCount { pieces: usize, total_size: u64 },

    #[error("the info does not hash to the expected info hash")]
    InfoHashMismatch,

    #[error("the files of the info add up to more than 2^64 bytes")]
    SizeOverflow,

    #[error("piece length of {0} bytes is too large")]
    PieceLength(u64),
}

/// SHA-1 of the raw bencoded info dictionary, the identity of a torrent.
#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn of(raw_info: &[u8]) -> Self {
        InfoHash(sha1_smol::Sha1::from(raw_info).digest().bytes())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let buf = hex::decode(s).ok()?;
        InfoHash::try_from(buf).ok()
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let buff: [u8; 20] = value
            .try_into()
            .map_err(|_| "The infohash must have exactly 20 bytes")?;
        Ok(InfoHash(buff))
    }
}

/// Metainfo is a .torrent file with information about the Torrent.
#[derive(Debug, PartialEq, Clone)]
pub struct MetaInfo {
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
    pub info: Info,
    /// The info dictionary exactly as it was in the file.
    pub raw_info: Vec<u8>,
}

impl MetaInfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetainfoError> {
        let root = bencode::decode(buf)?;
        let dict = root.as_dict().ok_or(MetainfoError::NotADict)?;

        let raw_info = Decoder::raw_dict_value(buf, b"info")?
            .ok_or(MetainfoError::MissingKey("info"))?
            .to_vec();
        let info = Info::from_bytes(&raw_info, None)?;

        let string = |key: &[u8]| {
            dict.get(key).and_then(Value::as_str).map(str::to_owned)
        };

        let announce_list = dict
            .get(b"announce-list")
            .and_then(Value::as_list)
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(Value::as_list)
                    .map(|tier| {
                        tier.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_owned)
                            .collect::<Vec<_>>()
                    })
                    .filter(|tier| !tier.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            announce: string(b"announce"),
            announce_list,
            comment: string(b"comment"),
            created_by: string(b"created by"),
            creation_date: dict.get(b"creation date").and_then(Value::as_int),
            info,
            raw_info,
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info.info_hash.clone()
    }

    /// The flat `announce` followed by every tier of `announce-list`,
    /// deduplicated in order, with the tier of each url.
    pub fn announce_urls(&self) -> Vec<(String, usize)> {
        let mut urls: Vec<(String, usize)> = Vec::new();

        let flat = self.announce.iter().map(|a| (a, 0));
        let tiers = self
            .announce_list
            .iter()
            .enumerate()
            .flat_map(|(tier, urls)| urls.iter().map(move |u| (u, tier)));

        for (url, tier) in flat.chain(tiers) {
            if !urls.iter().any(|(u, _)| u == url) {
                urls.push((url.clone(), tier));
            }
        }

        urls
    }
}

/// Files in the [`Info`] are relative to the root folder name,
/// but do not contain them as the first item in the vector.
#[derive(Debug, PartialEq, Clone, Default, Hash, Eq)]
pub struct File {
    /// Path of the file, excluding the parent name.
    pub path: Vec<String>,
    /// Length of the file in bytes.
    pub length: u64,
    /// Offset of the first byte of the file in the concatenated piece space.
    pub offset: u64,
}

/// The info dictionary. In the single file format `files` has one entry
/// whose path is the name of the torrent.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    pub name: String,

    /// length in bytes of each piece, the last piece may have a smaller length
    pub piece_length: u64,

    /// SHA-1 of every piece.
    pub pieces: Vec<[u8; 20]>,

    pub files: Vec<File>,

    /// If the torrent has only one file, `files` is synthesized from `length`.
    pub single_file: bool,

    pub private: bool,

    // computed, not part of the bencoded info
    pub metadata_size: usize,
    pub info_hash: InfoHash,
}

impl Info {
    /// Parse a bare info dictionary, the product of ut_metadata, and check
    /// its hash against `expected` when given.
    pub fn from_bytes(
        raw: &[u8],
        expected: Option<&InfoHash>,
    ) -> Result<Self, MetainfoError> {
        let info_hash = InfoHash::of(raw);
        if let Some(expected) = expected {
            if *expected != info_hash {
                return Err(MetainfoError::InfoHashMismatch);
            }
        }

        let value = bencode::decode(raw)?;
        let dict = value.as_dict().ok_or(MetainfoError::NotADict)?;

        let name = dict
            .get(b"name")
            .and_then(Value::as_str)
            .ok_or(MetainfoError::MissingKey("name"))?
            .to_owned();

        let piece_length = dict
            .get(b"piece length")
            .and_then(Value::as_uint)
            .filter(|l| *l > 0)
            .ok_or(MetainfoError::MissingKey("piece length"))?;

        if piece_length > MAX_PIECE_LENGTH {
            return Err(MetainfoError::PieceLength(piece_length));
        }

        let raw_pieces = dict
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or(MetainfoError::MissingKey("pieces"))?;

        if raw_pieces.len() % 20 != 0 {
            return Err(MetainfoError::PiecesLength(raw_pieces.len()));
        }

        let pieces: Vec<[u8; 20]> = raw_pieces
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let (files, single_file) = if let Some(length) =
            dict.get(b"length").and_then(Value::as_uint)
        {
            let file = File { path: vec![name.clone()], length, offset: 0 };
            (vec![file], true)
        } else if let Some(list) = dict.get(b"files").and_then(Value::as_list)
        {
            (Self::parse_files(list)?, false)
        } else {
            return Err(MetainfoError::NoFiles);
        };

        let private = dict.get(b"private").and_then(Value::as_int) == Some(1);

        let info = Self {
            name,
            piece_length,
            pieces,
            files,
            single_file,
            private,
            metadata_size: raw.len(),
            info_hash,
        };

        let total_size = info.total_size();
        if info.pieces() as u64 != total_size.div_ceil(piece_length) {
            return Err(MetainfoError::PieceCount {
                pieces: info.pieces(),
                total_size,
            });
        }

        Ok(info)
    }

    fn parse_files(list: &[Value]) -> Result<Vec<File>, MetainfoError> {
        let mut offset = 0;
        let mut files = Vec::with_capacity(list.len());

        for f in list {
            let length = f
                .get(b"length")
                .and_then(Value::as_uint)
                .ok_or(MetainfoError::MissingKey("files.length"))?;

            let path: Vec<String> = f
                .get(b"path")
                .and_then(Value::as_list)
                .ok_or(MetainfoError::MissingKey("files.path"))?
                .iter()
                .map(|p| p.as_str().map(str::to_owned))
                .collect::<Option<_>>()
                .ok_or(MetainfoError::MissingKey("files.path"))?;

            if path.is_empty() {
                return Err(MetainfoError::MissingKey("files.path"));
            }

            files.push(File { path, length, offset });
            offset = offset
                .checked_add(length)
                .ok_or(MetainfoError::SizeOverflow)?;
        }

        if files.is_empty() {
            return Err(MetainfoError::NoFiles);
        }

        Ok(files)
    }

    /// Calculate how many pieces there are.
    #[inline]
    pub fn pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Get the size in bytes of the files of the torrent.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Get the size (in bytes) of a piece.
    pub fn piece_size(&self, piece_index: usize) -> u64 {
        let start = piece_index as u64 * self.piece_length;
        let end =
            start.saturating_add(self.piece_length).min(self.total_size());
        end.saturating_sub(start)
    }

    pub fn piece_hash(&self, piece_index: usize) -> Option<&[u8; 20]> {
        self.pieces.get(piece_index)
    }

    /// Offset of the piece in the concatenated piece space.
    pub fn piece_offset(&self, piece_index: usize) -> u64 {
        piece_index as u64 * self.piece_length
    }

    /// Every block of a piece, the last one may be smaller than
    /// [`BLOCK_LEN`].
    pub fn block_infos_of_piece(&self, piece_index: usize) -> Vec<BlockInfo> {
        let piece_size = self.piece_size(piece_index) as u32;
        let num_blocks = piece_size.div_ceil(BLOCK_LEN);

        (0..num_blocks)
            .map(|b| {
                let begin = b * BLOCK_LEN;
                BlockInfo {
                    index: piece_index as u32,
                    begin,
                    len: BLOCK_LEN.min(piece_size - begin),
                }
            })
            .collect()
    }

    /// The range of pieces that overlap the file at `file_index`.
    pub fn pieces_of_file(
        &self,
        file_index: usize,
    ) -> Option<std::ops::Range<usize>> {
        let file = self.files.get(file_index)?;
        if file.length == 0 {
            return Some(0..0);
        }
        let first = file.offset / self.piece_length;
        let last = (file.offset + file.length - 1) / self.piece_length;
        Some(first as usize..last as usize + 1)
    }
}
