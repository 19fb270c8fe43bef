use std::{
    fmt::Display,
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch, Semaphore},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, info};

use crate::{
    config::ResolvedConfig,
    counter::Counter,
    disk::{recheck, Storage, StorageTarget},
    error::Error,
    extensions::{
        Handshake, HandshakeCodec, MetadataAssembler, MetadataProgress,
        PexFlags,
    },
    magnet::Magnet,
    metainfo::{Info, InfoHash, MetaInfo},
    peer::{
        ConnectionState, Direction, PeerBrMsg, PeerCtx, PeerId, PeerSource,
    },
    pieces::{PieceStrategy, PieceTracker, Progress},
    tracker::{AnnounceParams, Event},
};

/// Messages used to control the local peer or the state of the torrent.
#[derive(Debug)]
pub enum TorrentMsg {
    /// A connection was routed to this torrent by the listener, with the
    /// handshake that the remote sent.
    Incoming(Box<(Framed<TcpStream, HandshakeCodec>, Handshake)>),

    /// Sent by trackers, PEX and holepunch with peers to connect to.
    AddPeers(Vec<SocketAddr>, PeerSource),

    /// Add one peer, answers if it was new.
    AddPeer(SocketAddr, PeerSource, oneshot::Sender<bool>),

    /// The TCP connection was made and the handshake is being exchanged.
    PeerHandshaking(SocketAddr),

    PeerConnected(Arc<PeerCtx>),

    /// The task of a peer ended. `failure` is set when it ended with an
    /// error that is the fault of the remote.
    PeerClosed { addr: SocketAddr, peer_id: Option<PeerId>, failure: bool },

    /// A piece was verified and written by a peer.
    PieceVerified(u32),

    /// The last block of a corrupted piece came from this peer.
    PeerCorrupt(SocketAddr),

    /// Connected peers to advertise with PEX.
    GetPexPeers(oneshot::Sender<Vec<(SocketAddr, PexFlags)>>),

    /// Sent when the peer is acting as a relay for the holepunch protocol.
    ReadPeerByAddr(SocketAddr, oneshot::Sender<Option<Arc<PeerCtx>>>),

    /// The info was assembled from ut_metadata and its hash matches.
    InfoComplete(Vec<u8>),

    GetState(oneshot::Sender<TorrentState>),

    GetPeers(oneshot::Sender<Vec<PeerSnapshot>>),

    /// Start announcing and connecting, or resume after a pause.
    Start,

    Pause,

    /// When torrent is being gracefully shutdown
    Quit,
}

/// Observed through [`TorrentCtx::completion`], it only moves away from
/// `Pending` once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    #[default]
    Pending,
    Complete,
    Cancelled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TorrentStatus {
    #[default]
    ConnectingTrackers,
    DownloadingMetainfo,
    Downloading,
    Seeding,
    Paused,
    Error,
}

impl From<TorrentStatus> for &str {
    fn from(val: TorrentStatus) -> Self {
        use TorrentStatus::*;
        match val {
            ConnectingTrackers => "Connecting to trackers",
            DownloadingMetainfo => "Downloading metainfo",
            Downloading => "Downloading",
            Seeding => "Seeding",
            Paused => "Paused",
            Error => "Error",
        }
    }
}

impl Display for TorrentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).into())
    }
}

/// State of a torrent, used by the CLI to present data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentState {
    pub name: String,
    pub info_hash: InfoHash,
    pub status: TorrentStatus,
    pub progress: Progress,
    /// Size of the wanted files, 0 while the info is not known.
    pub size: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub connected_peers: u32,
    pub connecting_peers: u32,
    pub idle_peers: u32,
    /// Peers that unchoked us and that we are interested in.
    pub downloading_from: u32,
}

/// One known peer identity, connected or not.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    pub source: PeerSource,
    /// `None` until the peer is dialed.
    pub state: Option<ConnectionState>,
    pub failures: u32,
    pub excluded: bool,
    pub id: Option<PeerId>,
    pub client: Option<&'static str>,
    pub direction: Option<Direction>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub is_seed: bool,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
}

impl PeerSnapshot {
    pub fn idle(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            source,
            state: None,
            failures: 0,
            excluded: false,
            id: None,
            client: None,
            direction: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            is_seed: false,
            downloaded: 0,
            uploaded: 0,
            download_rate: 0,
            upload_rate: 0,
        }
    }

    /// Copy the live state of a connected peer.
    pub fn with_ctx(mut self, ctx: &PeerCtx) -> Self {
        self.state = Some(ctx.state());
        self.id = Some(ctx.id);
        self.client = Some(ctx.id.client_name());
        self.direction = Some(ctx.direction);
        self.am_choking = ctx.am_choking.load(Ordering::Relaxed);
        self.am_interested = ctx.am_interested.load(Ordering::Relaxed);
        self.peer_choking = ctx.peer_choking.load(Ordering::Relaxed);
        self.peer_interested = ctx.peer_interested.load(Ordering::Relaxed);
        self.is_seed = ctx.is_seed.load(Ordering::Relaxed);
        self.downloaded = ctx.counter.downloaded();
        self.uploaded = ctx.counter.uploaded();
        self.download_rate = ctx.counter.download_rate();
        self.upload_rate = ctx.counter.upload_rate();
        self
    }
}

/// Where a torrent comes from.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    MetaInfo(Box<MetaInfo>),
    Magnet(Magnet),
}

impl TorrentSource {
    /// A `magnet:` link, or the path of a torrent file.
    pub fn parse(input: &str) -> Result<Self, Error> {
        if input.starts_with("magnet:") {
            return Ok(Self::Magnet(Magnet::new(input)?));
        }
        let buf = std::fs::read(Path::new(input))?;
        Ok(Self::MetaInfo(Box::new(MetaInfo::from_bytes(&buf)?)))
    }

    pub fn info_hash(&self) -> InfoHash {
        match self {
            Self::MetaInfo(m) => m.info_hash(),
            Self::Magnet(m) => m.info_hash(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::MetaInfo(m) => m.info.name.clone(),
            Self::Magnet(m) => m.display_name(),
        }
    }

    /// Announce urls with their tier.
    pub fn trackers(&self) -> Vec<(String, usize)> {
        match self {
            Self::MetaInfo(m) => m.announce_urls(),
            Self::Magnet(m) => {
                m.trackers().into_iter().map(|url| (url, 0)).collect()
            }
        }
    }
}

/// The info of a torrent and everything built from it.
#[derive(Debug)]
pub struct Content {
    pub info: Info,
    /// The bencoded info, served to ut_metadata requests.
    pub raw_info: Vec<u8>,
    pub pieces: PieceTracker,
    pub storage: Arc<dyn Storage>,
}

impl Content {
    /// Open the storage and mark the pieces that are already on it. It does
    /// blocking I/O and hashing.
    pub fn new(
        info: Info,
        raw_info: Vec<u8>,
        target: &StorageTarget,
        selection: Option<&[usize]>,
        strategy: PieceStrategy,
    ) -> Self {
        let pieces = PieceTracker::new(&info, strategy.picker());
        if let Some(files) = selection {
            pieces.select_files(&info, files);
        }

        let storage = target.open(&info, selection);

        let verified = recheck(storage.as_ref(), &info);
        if !verified.is_empty() {
            info!("{} pieces found on storage", verified.len());
        }
        for index in verified {
            pieces.mark_verified(index);
        }

        Self { info, raw_info, pieces, storage }
    }
}

/// Context of a torrent that can be shared between other types.
#[derive(Debug)]
pub struct TorrentCtx {
    pub info_hash: InfoHash,
    pub local_peer_id: PeerId,
    /// Port we listen on, advertised to peers and trackers.
    pub local_port: u16,
    pub tx: mpsc::Sender<TorrentMsg>,
    pub btx: broadcast::Sender<PeerBrMsg>,
    pub config: Arc<ResolvedConfig>,
    pub counter: Counter,
    /// One permit for each unchoked peer.
    pub upload_slots: Arc<Semaphore>,
    /// Cancelled on release, ends every task of the torrent.
    pub cancel: CancellationToken,
    pub completion: watch::Sender<Completion>,
    pub paused: AtomicBool,
    /// Length given by the magnet link, `left` of announces before the info
    /// is known.
    pub size_hint: Option<u64>,
    content: OnceLock<Arc<Content>>,
    metadata: Mutex<Option<MetadataAssembler>>,
}

impl TorrentCtx {
    pub fn new(
        info_hash: InfoHash,
        local_peer_id: PeerId,
        config: Arc<ResolvedConfig>,
        tx: mpsc::Sender<TorrentMsg>,
        size_hint: Option<u64>,
    ) -> Self {
        let (btx, _) = broadcast::channel(500);
        let (completion, _) = watch::channel(Completion::Pending);

        Self {
            info_hash,
            local_peer_id,
            local_port: config.local_peer_port,
            tx,
            btx,
            upload_slots: Arc::new(Semaphore::new(
                config.upload_slots as usize,
            )),
            config,
            counter: Counter::new(),
            cancel: CancellationToken::new(),
            completion,
            paused: AtomicBool::new(false),
            size_hint,
            content: OnceLock::new(),
            metadata: Mutex::new(None),
        }
    }

    pub fn content(&self) -> Option<Arc<Content>> {
        self.content.get().cloned()
    }

    /// Set the content once, returns false if it was already set.
    pub fn set_content(&self, content: Content) -> bool {
        let set = self.content.set(Arc::new(content)).is_ok();
        if set {
            *self.lock_metadata() = None;
        }
        set
    }

    fn lock_metadata(&self) -> MutexGuard<'_, Option<MetadataAssembler>> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A peer told us the size of the info, the first valid size is kept.
    pub fn init_metadata(&self, size: u32) {
        if self.content.get().is_some() {
            return;
        }
        let mut metadata = self.lock_metadata();
        if metadata.is_none() {
            let info_hash = self.info_hash.clone();
            *metadata = MetadataAssembler::new(info_hash, size as usize);
            if metadata.is_some() {
                debug!("metadata_size is {size}");
            }
        }
    }

    /// Pieces of the info to request.
    pub fn metadata_missing(&self) -> Vec<u32> {
        self.lock_metadata()
            .as_ref()
            .map(MetadataAssembler::missing)
            .unwrap_or_default()
    }

    pub fn insert_metadata(
        &self,
        piece: u32,
        total_size: u32,
        data: &[u8],
    ) -> MetadataProgress {
        if self.content.get().is_some() {
            return MetadataProgress::Ignored;
        }
        let mut metadata = self.lock_metadata();
        match metadata.as_mut() {
            Some(m) if m.size() == total_size as usize => m.insert(piece, data),
            _ => MetadataProgress::Ignored,
        }
    }

    /// Move the completion away from pending, once. True if this call
    /// did it.
    pub fn finish(&self, completion: Completion) -> bool {
        self.completion.send_if_modified(|c| {
            let pending = *c == Completion::Pending;
            if pending {
                *c = completion;
            }
            pending
        })
    }

    pub fn is_complete(&self) -> bool {
        *self.completion.borrow() == Completion::Complete
    }

    /// What we tell trackers. `left` is unknown until the info is, it is
    /// the size of the magnet link or the max.
    pub fn announce_params(&self, event: Event) -> AnnounceParams {
        let left = match self.content() {
            Some(content) => content.pieces.bytes_left(),
            None => self.size_hint.unwrap_or(u64::MAX),
        };

        AnnounceParams {
            info_hash: self.info_hash.clone(),
            peer_id: self.local_peer_id,
            port: self.local_port,
            uploaded: self.counter.uploaded(),
            downloaded: self.counter.downloaded(),
            left,
            event,
            key: self.config.key,
            num_want: Some(self.config.max_torrent_peers),
        }
    }
}
