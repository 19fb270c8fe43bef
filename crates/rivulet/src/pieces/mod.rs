//! The piece and block bookkeeping shared by every connection of a torrent.
//!
//! Connections claim blocks to request, submit the blocks they receive and
//! release the claims they won't fulfill. Once every block of a piece
//! arrives, the piece is hashed outside of the lock and reported as either
//! complete or corrupt.

mod picker;

pub use picker::*;

use std::{
    mem,
    net::SocketAddr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    bitfield::{Bitfield, RvtBitfield},
    extensions::{BlockInfo, BLOCK_LEN},
    metainfo::Info,
};

/// Status of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceStatus {
    #[default]
    Missing,
    /// At least one block was claimed or received.
    Requested,
    /// Every block arrived, the hash is being checked.
    Verifying,
    Complete,
}

/// Result of [`PieceTracker::submit_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockResult {
    Accepted,
    /// The block was already received or the piece is not downloading.
    Duplicate,
    /// Out of range or not aligned with the block grid.
    Invalid,
    /// The last block of the piece arrived and the hash matches. The data
    /// must be written to storage and [`PieceTracker::mark_stored`] called.
    PieceComplete { index: u32, data: Bytes },
    /// The hash didn't match, the piece was reset to missing.
    PieceCorrupt(u32),
}

/// Download progress of the wanted pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub pieces_complete: u32,
    pub pieces_total: u32,
    pub bytes_done: u64,
}

#[derive(Debug, Default)]
struct BlockSlot {
    received: bool,
    /// Connections with the block outstanding, more than one only in
    /// endgame.
    owners: Vec<SocketAddr>,
}

impl BlockSlot {
    fn is_free(&self) -> bool {
        !self.received && self.owners.is_empty()
    }
}

#[derive(Debug)]
struct PieceState {
    status: PieceStatus,
    wanted: bool,
    /// Verified and written to storage.
    stored: bool,
    size: u32,
    blocks: Vec<BlockSlot>,
    received: u32,
    /// Allocated on the first received block.
    buf: Vec<u8>,
}

impl PieceState {
    fn new(size: u32) -> Self {
        let blocks =
            (0..size.div_ceil(BLOCK_LEN)).map(|_| BlockSlot::default()).collect();
        Self {
            status: PieceStatus::Missing,
            wanted: true,
            stored: false,
            size,
            blocks,
            received: 0,
            buf: Vec::new(),
        }
    }

    fn block_len(&self, block: usize) -> u32 {
        let begin = block as u32 * BLOCK_LEN;
        BLOCK_LEN.min(self.size - begin)
    }

    fn is_downloading(&self) -> bool {
        self.wanted
            && matches!(self.status, PieceStatus::Missing | PieceStatus::Requested)
    }

    fn is_partial(&self) -> bool {
        self.status == PieceStatus::Requested
    }

    /// Back to missing, every block discarded.
    fn reset(&mut self) {
        self.status = PieceStatus::Missing;
        self.received = 0;
        self.buf = Vec::new();
        for b in &mut self.blocks {
            b.received = false;
            b.owners.clear();
        }
    }

    /// A requested piece with nothing received and nothing outstanding is
    /// missing again.
    fn settle(&mut self) {
        if self.status == PieceStatus::Requested
            && self.received == 0
            && self.blocks.iter().all(|b| b.owners.is_empty())
        {
            self.status = PieceStatus::Missing;
        }
    }
}

#[derive(Debug)]
struct Inner {
    pieces: Vec<PieceState>,
    /// How many connected remotes have each piece.
    availability: Vec<u32>,
}

impl Inner {
    fn has_free_block(&self) -> bool {
        self.pieces
            .iter()
            .any(|p| p.is_downloading() && p.blocks.iter().any(BlockSlot::is_free))
    }

    fn block_info(&self, index: usize, block: usize) -> BlockInfo {
        BlockInfo {
            index: index as u32,
            begin: block as u32 * BLOCK_LEN,
            len: self.pieces[index].block_len(block),
        }
    }
}

/// Bookkeeping of the pieces of one torrent, shared by every connection.
#[derive(Debug)]
pub struct PieceTracker {
    hashes: Vec<[u8; 20]>,
    piece_length: u64,
    picker: Box<dyn PiecePicker>,
    inner: Mutex<Inner>,
}

impl PieceTracker {
    pub fn new(info: &Info, picker: Box<dyn PiecePicker>) -> Self {
        let pieces = (0..info.pieces())
            .map(|i| PieceState::new(info.piece_size(i) as u32))
            .collect();

        Self {
            hashes: info.pieces.clone(),
            piece_length: info.piece_length,
            picker,
            inner: Mutex::new(Inner {
                pieces,
                availability: vec![0; info.pieces()],
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pieces(&self) -> usize {
        self.hashes.len()
    }

    /// Only download the pieces that overlap the files in `files`. Pieces
    /// already complete are kept.
    pub fn select_files(&self, info: &Info, files: &[usize]) {
        let mut wanted = Bitfield::from_piece(self.pieces());
        for range in files.iter().filter_map(|f| info.pieces_of_file(*f)) {
            for i in range {
                wanted.safe_set(i);
            }
        }

        let mut inner = self.lock();
        for (i, piece) in inner.pieces.iter_mut().enumerate() {
            piece.wanted = wanted[i];
        }
    }

    /// Claim a block that the remote with `remote` pieces can give us, and
    /// that nobody else is downloading.
    ///
    /// When every block is either received or outstanding, the torrent is in
    /// endgame and a block outstanding on another connection is returned.
    pub fn claim_block(
        &self,
        owner: SocketAddr,
        remote: &Bitfield,
    ) -> Option<BlockInfo> {
        let mut inner = self.lock();
        let has = |i: usize| remote.get(i).map(|b| *b).unwrap_or(false);

        let best = inner
            .pieces
            .iter()
            .enumerate()
            .filter(|(i, p)| {
                p.is_downloading()
                    && has(*i)
                    && p.blocks.iter().any(BlockSlot::is_free)
            })
            .map(|(i, p)| Candidate {
                index: i as u32,
                availability: inner.availability[i],
                partial: p.is_partial(),
            })
            .min_by(|a, b| self.picker.cmp(a, b));

        if let Some(c) = best {
            let i = c.index as usize;
            let piece = &mut inner.pieces[i];
            let b = piece.blocks.iter().position(BlockSlot::is_free)?;
            piece.blocks[b].owners.push(owner);
            piece.status = PieceStatus::Requested;
            return Some(inner.block_info(i, b));
        }

        if inner.has_free_block() {
            return None;
        }

        // endgame, the block with the fewest owners that isn't ours
        let (i, b) = inner
            .pieces
            .iter()
            .enumerate()
            .filter(|(i, p)| p.is_downloading() && has(*i))
            .flat_map(|(i, p)| {
                p.blocks.iter().enumerate().filter_map(move |(b, slot)| {
                    (!slot.received && !slot.owners.contains(&owner))
                        .then_some((i, b, slot.owners.len()))
                })
            })
            .min_by_key(|(i, b, owners)| (*owners, *i, *b))
            .map(|(i, b, _)| (i, b))?;

        inner.pieces[i].blocks[b].owners.push(owner);
        Some(inner.block_info(i, b))
    }

    /// Store a block received from a remote.
    pub fn submit_block(&self, index: u32, begin: u32, data: &[u8]) -> BlockResult {
        let i = index as usize;
        let mut inner = self.lock();

        let Some(piece) = inner.pieces.get_mut(i) else {
            return BlockResult::Invalid;
        };

        if begin % BLOCK_LEN != 0 {
            return BlockResult::Invalid;
        }
        let b = (begin / BLOCK_LEN) as usize;
        if b >= piece.blocks.len() || data.len() != piece.block_len(b) as usize {
            return BlockResult::Invalid;
        }

        piece.blocks[b].owners.clear();

        if !piece.is_downloading() || piece.blocks[b].received {
            return BlockResult::Duplicate;
        }

        if piece.buf.is_empty() {
            piece.buf = vec![0; piece.size as usize];
        }
        let begin = begin as usize;
        piece.buf[begin..begin + data.len()].copy_from_slice(data);
        piece.blocks[b].received = true;
        piece.received += 1;
        piece.status = PieceStatus::Requested;

        if piece.received < piece.blocks.len() as u32 {
            return BlockResult::Accepted;
        }

        piece.status = PieceStatus::Verifying;
        let buf = mem::take(&mut piece.buf);
        drop(inner);

        let hash = sha1_smol::Sha1::from(&buf).digest().bytes();
        let valid = self.hashes.get(i).is_some_and(|h| *h == hash);

        let mut inner = self.lock();
        let piece = &mut inner.pieces[i];

        if valid {
            piece.status = PieceStatus::Complete;
            debug!("piece {index} verified");
            BlockResult::PieceComplete { index, data: Bytes::from(buf) }
        } else {
            piece.reset();
            warn!("piece {index} is corrupt");
            BlockResult::PieceCorrupt(index)
        }
    }

    /// The verified piece was written to storage, it can be uploaded and
    /// counts towards progress.
    pub fn mark_stored(&self, index: u32) {
        if let Some(p) = self.lock().pieces.get_mut(index as usize) {
            if p.status == PieceStatus::Complete {
                p.stored = true;
            }
        }
    }

    /// A piece that was found on storage with a valid hash.
    pub fn mark_verified(&self, index: u32) {
        if let Some(p) = self.lock().pieces.get_mut(index as usize) {
            p.reset();
            p.status = PieceStatus::Complete;
            p.stored = true;
        }
    }

    /// Writing a verified piece failed, download it again.
    pub fn fail_piece(&self, index: u32) {
        if let Some(p) = self.lock().pieces.get_mut(index as usize) {
            p.reset();
            p.stored = false;
        }
    }

    /// Void every block outstanding on `owner`.
    pub fn release_blocks(&self, owner: SocketAddr) {
        let mut inner = self.lock();
        for piece in &mut inner.pieces {
            for b in &mut piece.blocks {
                b.owners.retain(|o| *o != owner);
            }
            piece.settle();
        }
    }

    pub fn release_block(&self, owner: SocketAddr, block: &BlockInfo) {
        let mut inner = self.lock();
        let Some(piece) = inner.pieces.get_mut(block.index as usize) else {
            return;
        };
        if let Some(slot) = piece.blocks.get_mut((block.begin / BLOCK_LEN) as usize)
        {
            slot.owners.retain(|o| *o != owner);
        }
        piece.settle();
    }

    /// Drop every partially downloaded piece.
    pub fn release_buffers(&self) {
        let mut inner = self.lock();
        for piece in &mut inner.pieces {
            if piece.status != PieceStatus::Complete {
                piece.reset();
            }
        }
    }

    pub fn add_remote_bitmap(&self, remote: &Bitfield) {
        let mut inner = self.lock();
        for i in remote.iter_ones() {
            if let Some(a) = inner.availability.get_mut(i) {
                *a += 1;
            }
        }
    }

    pub fn add_remote_piece(&self, index: u32) {
        if let Some(a) = self.lock().availability.get_mut(index as usize) {
            *a += 1;
        }
    }

    pub fn remove_remote_bitmap(&self, remote: &Bitfield) {
        let mut inner = self.lock();
        for i in remote.iter_ones() {
            if let Some(a) = inner.availability.get_mut(i) {
                *a = a.saturating_sub(1);
            }
        }
    }

    /// Every wanted piece is stored.
    pub fn is_complete(&self) -> bool {
        self.lock().pieces.iter().all(|p| !p.wanted || p.stored)
    }

    /// The pieces that can be given to remotes.
    pub fn bitmap_snapshot(&self) -> Bitfield {
        let inner = self.lock();
        inner.pieces.iter().map(|p| p.stored).collect()
    }

    /// Whether any wanted piece that `remote` has is still downloading.
    pub fn wants_from(&self, remote: &Bitfield) -> bool {
        let inner = self.lock();
        remote
            .iter_ones()
            .any(|i| inner.pieces.get(i).is_some_and(PieceState::is_downloading))
    }

    pub fn in_endgame(&self) -> bool {
        let inner = self.lock();
        let downloading = inner.pieces.iter().any(PieceState::is_downloading);
        downloading && !inner.has_free_block()
    }

    pub fn piece_status(&self, index: u32) -> Option<PieceStatus> {
        self.lock().pieces.get(index as usize).map(|p| p.status)
    }

    pub fn is_stored(&self, index: u32) -> bool {
        self.lock().pieces.get(index as usize).is_some_and(|p| p.stored)
    }

    pub fn progress(&self) -> Progress {
        let inner = self.lock();
        let mut progress = Progress::default();
        for piece in inner.pieces.iter().filter(|p| p.wanted) {
            progress.pieces_total += 1;
            if piece.stored {
                progress.pieces_complete += 1;
                progress.bytes_done += piece.size as u64;
            }
        }
        progress
    }

    /// Bytes of the wanted pieces that are not stored yet.
    pub fn bytes_left(&self) -> u64 {
        let inner = self.lock();
        inner
            .pieces
            .iter()
            .filter(|p| p.wanted && !p.stored)
            .map(|p| p.size as u64)
            .sum()
    }

    /// Offset of the piece in the concatenated piece space.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.hashes.get(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use hashbrown::HashSet;

    use super::*;
    use crate::metainfo::{File, Info};

    fn info(content: &[u8], piece_length: u64) -> Info {
        let pieces = content
            .chunks(piece_length as usize)
            .map(|c| sha1_smol::Sha1::from(c).digest().bytes())
            .collect();
        Info {
            name: "test".to_owned(),
            piece_length,
            pieces,
            files: vec![File {
                path: vec!["test".to_owned()],
                length: content.len() as u64,
                offset: 0,
            }],
            single_file: true,
            ..Default::default()
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn all(pieces: usize) -> Bitfield {
        let mut b = Bitfield::from_piece(pieces);
        b.fill(true);
        b
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn block<'a>(data: &'a [u8], info: &Info, b: &BlockInfo) -> &'a [u8] {
        let start = info.piece_offset(b.index as usize) as usize + b.begin as usize;
        &data[start..start + b.len as usize]
    }

    #[test]
    fn claims_blocks_of_the_remote() {
        let data = content(3 * 32768);
        let info = info(&data, 32768);
        let tracker = PieceTracker::new(&info, Box::new(RarestFirst));

        let mut remote = Bitfield::from_piece(3);
        remote.set(2, true);

        let a = tracker.claim_block(addr(1), &remote).unwrap();
        let b = tracker.claim_block(addr(1), &remote).unwrap();
        assert_eq!((a.index, a.begin, a.len), (2, 0, BLOCK_LEN));
        assert_eq!((b.index, b.begin), (2, BLOCK_LEN));
        assert_eq!(tracker.piece_status(2), Some(PieceStatus::Requested));

        // blocks of piece 2 are all outstanding, but the remote can't give
        // us the others, so this is not endgame
        assert_eq!(tracker.claim_block(addr(2), &remote), None);
        assert!(!tracker.in_endgame());

        tracker.release_blocks(addr(1));
        assert_eq!(tracker.piece_status(2), Some(PieceStatus::Missing));
    }

    #[test]
    fn prefers_rare_and_partial_pieces() {
        let data = content(3 * 32768);
        let info = info(&data, 32768);
        let tracker = PieceTracker::new(&info, Box::new(RarestFirst));

        let mut common = Bitfield::from_piece(3);
        common.set(0, true);
        common.set(1, true);
        tracker.add_remote_bitmap(&common);
        tracker.add_remote_bitmap(&all(3));

        // piece 2 has one holder
        let first = tracker.claim_block(addr(1), &all(3)).unwrap();
        assert_eq!(first.index, 2);

        // 0 and 1 have two holders, 1 becomes partial
        tracker.add_remote_piece(2);
        tracker.add_remote_piece(2);
        let mut only_one = Bitfield::from_piece(3);
        only_one.set(1, true);
        assert_eq!(tracker.claim_block(addr(2), &only_one).unwrap().index, 1);
        assert_eq!(tracker.claim_block(addr(3), &all(3)).unwrap().index, 1);
    }

    #[test]
    fn sequential_picker() {
        let data = content(3 * 16384);
        let info = info(&data, 16384);
        let tracker = PieceTracker::new(&info, Box::new(Sequential));

        let mut rare = Bitfield::from_piece(3);
        rare.set(2, true);
        tracker.add_remote_bitmap(&all(3));
        tracker.add_remote_bitmap(&all(3));
        tracker.add_remote_bitmap(&rare);

        let order: Vec<u32> = (0..3)
            .map(|_| tracker.claim_block(addr(1), &all(3)).unwrap().index)
            .collect();
        assert_eq!(order, [0, 1, 2]);
    }

    #[test]
    fn downloads_and_verifies() {
        let data = content(2 * 32768 - 100);
        let info = info(&data, 32768);
        let tracker = PieceTracker::new(&info, Box::new(RarestFirst));
        let remote = all(2);

        let mut completed = vec![];
        while let Some(b) = tracker.claim_block(addr(1), &remote) {
            match tracker.submit_block(b.index, b.begin, block(&data, &info, &b)) {
                BlockResult::Accepted => {}
                BlockResult::PieceComplete { index, data: piece } => {
                    assert_eq!(piece.len() as u64, info.piece_size(index as usize));
                    tracker.mark_stored(index);
                    completed.push(index);
                }
                r => panic!("unexpected {r:?}"),
            }
        }

        assert_eq!(completed.len(), 2);
        assert!(tracker.is_complete());
        assert_eq!(
            tracker.progress(),
            Progress {
                pieces_complete: 2,
                pieces_total: 2,
                bytes_done: data.len() as u64
            }
        );
        assert_eq!(tracker.bytes_left(), 0);
        assert!(tracker.bitmap_snapshot().all());
    }

    #[test]
    fn complete_only_when_stored() {
        let data = content(16384);
        let info = info(&data, 16384);
        let tracker = PieceTracker::new(&info, Box::new(RarestFirst));

        let b = tracker.claim_block(addr(1), &all(1)).unwrap();
        let r = tracker.submit_block(b.index, b.begin, &data);
        assert!(matches!(r, BlockResult::PieceComplete { index: 0, .. }));

        assert_eq!(tracker.piece_status(0), Some(PieceStatus::Complete));
        assert!(!tracker.is_complete());
        assert!(tracker.bitmap_snapshot().not_any());

        tracker.mark_stored(0);
        assert!(tracker.is_complete());
    }

    #[test]
    fn invalid_and_duplicate_blocks() {
        let data = content(32768);
        let info = info(&data, 32768);
        let tracker = PieceTracker::new(&info, Box::new(RarestFirst));

        assert_eq!(tracker.submit_block(1, 0, &data[..16384]), BlockResult::Invalid);
        assert_eq!(tracker.submit_block(0, 1, &data[..16384]), BlockResult::Invalid);
        assert_eq!(tracker.submit_block(0, 0, &data[..100]), BlockResult::Invalid);
        assert_eq!(
            tracker.submit_block(0, 32768, &data[..16384]),
            BlockResult::Invalid
        );

        assert_eq!(tracker.submit_block(0, 0, &data[..16384]), BlockResult::Accepted);
        assert_eq!(tracker.submit_block(0, 0, &data[..16384]), BlockResult::Duplicate);
        assert_eq!(tracker.progress().pieces_complete, 0);

        assert!(matches!(
            tracker.submit_block(0, 16384, &data[16384..]),
            BlockResult::PieceComplete { .. }
        ));
        assert_eq!(
            tracker.submit_block(0, 16384, &data[16384..]),
            BlockResult::Duplicate
        );
    }

    #[test]
    fn corruption_recovery() {
        let data = content(32768);
        let info = info(&data, 32768);
        let tracker = PieceTracker::new(&info, Box::new(RarestFirst));
        let remote = all(1);

        let a = tracker.claim_block(addr(1), &remote).unwrap();
        let b = tracker.claim_block(addr(1), &remote).unwrap();
        let bad = vec![0xFF; 16384];
        assert_eq!(tracker.submit_block(a.index, a.begin, &bad), BlockResult::Accepted);
        assert_eq!(
            tracker.submit_block(b.index, b.begin, block(&data, &info, &b)),
            BlockResult::PieceCorrupt(0)
        );
        assert_eq!(tracker.piece_status(0), Some(PieceStatus::Missing));

        // every block can be claimed again
        let a = tracker.claim_block(addr(2), &remote).unwrap();
        let b = tracker.claim_block(addr(2), &remote).unwrap();
        assert_eq!(
            tracker.submit_block(a.index, a.begin, block(&data, &info, &a)),
            BlockResult::Accepted
        );
        assert!(matches!(
            tracker.submit_block(b.index, b.begin, block(&data, &info, &b)),
            BlockResult::PieceComplete { index: 0, .. }
        ));
    }

    #[test]
    fn endgame() {
        let data = content(32768);
        let info = info(&data, 32768);
        let tracker = PieceTracker::new(&info, Box::new(RarestFirst));
        let remote = all(1);

        let a = tracker.claim_block(addr(1), &remote).unwrap();
        assert!(!tracker.in_endgame());
        let b = tracker.claim_block(addr(2), &remote).unwrap();
        assert!(tracker.in_endgame());

        // never the block the connection already has outstanding
        let dup = tracker.claim_block(addr(1), &remote).unwrap();
        assert_eq!(dup, b);
        assert_eq!(tracker.claim_block(addr(1), &remote), None);
        assert_eq!(tracker.claim_block(addr(2), &remote).unwrap(), a);

        // the first to arrive wins, the other copy is a duplicate
        assert_eq!(
            tracker.submit_block(b.index, b.begin, block(&data, &info, &b)),
            BlockResult::Accepted
        );
        assert_eq!(
            tracker.submit_block(b.index, b.begin, block(&data, &info, &b)),
            BlockResult::Duplicate
        );
    }

    #[test]
    fn no_double_claim_under_concurrency() {
        let data = content(64 * 32768);
        let info = info(&data, 32768);
        let tracker = Arc::new(PieceTracker::new(&info, Box::new(RarestFirst)));
        let remote = Arc::new(all(64));

        // 8 claimers of 16 blocks take all the 128 blocks
        let handles: Vec<_> = (0..8u16)
            .map(|n| {
                let tracker = tracker.clone();
                let remote = remote.clone();
                thread::spawn(move || {
                    (0..16)
                        .filter_map(|_| tracker.claim_block(addr(n), &remote))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for b in h.join().unwrap() {
                total += 1;
                seen.insert(b);
            }
        }

        assert_eq!(total, 128);
        assert_eq!(seen.len(), 128);
        assert!(tracker.in_endgame());
    }

    #[test]
    fn concurrent_submits() {
        let data = Arc::new(content(4 * 32768));
        let info = Arc::new(info(&data, 32768));
        let tracker = Arc::new(PieceTracker::new(&info, Box::new(RarestFirst)));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (tracker, data, info) =
                    (tracker.clone(), data.clone(), info.clone());
                thread::spawn(move || {
                    let mut complete = 0;
                    for index in 0..4u32 {
                        for b in info.block_infos_of_piece(index as usize) {
                            let r = tracker.submit_block(
                                b.index,
                                b.begin,
                                block(&data, &info, &b),
                            );
                            if let BlockResult::PieceComplete { index, .. } = r {
                                tracker.mark_stored(index);
                                complete += 1;
                            }
                        }
                    }
                    complete
                })
            })
            .collect();

        let complete: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(complete, 4);
        assert!(tracker.is_complete());
    }

    #[test]
    fn file_selection() {
        let data = content(4 * 16384);
        let mut info = info(&data, 16384);
        info.single_file = false;
        info.files = vec![
            File { path: vec!["a".into()], length: 16384, offset: 0 },
            File { path: vec!["b".into()], length: 3 * 16384, offset: 16384 },
        ];
        let tracker = PieceTracker::new(&info, Box::new(RarestFirst));
        tracker.select_files(&info, &[0]);

        assert_eq!(tracker.progress().pieces_total, 1);
        assert_eq!(tracker.bytes_left(), 16384);
        assert!(!tracker.wants_from(&{
            let mut b = Bitfield::from_piece(4);
            b.set(3, true);
            b
        }));

        let b = tracker.claim_block(addr(1), &all(4)).unwrap();
        assert_eq!(b.index, 0);
        assert_eq!(tracker.claim_block(addr(1), &all(4)), None);

        assert!(matches!(
            tracker.submit_block(0, 0, &data[..16384]),
            BlockResult::PieceComplete { .. }
        ));
        tracker.mark_stored(0);
        assert!(tracker.is_complete());
    }
}
