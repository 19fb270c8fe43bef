//! Torrent that is spawned by the Daemon
//!
//! A torrent will manage multiple peers, peers can send messages to the torrent
//! using [`TorrentMsg`], and torrent can send messages to the Peers using
//! [`PeerMsg`] and [`PeerBrMsg`].

mod types;

// re-exports
pub use types::*;

use std::{
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use hashbrown::HashMap;
use tokio::{
    net::TcpStream,
    select, spawn,
    sync::{mpsc, oneshot},
    task::{spawn_blocking, JoinHandle},
    time::{interval, Instant},
};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    config::ResolvedConfig,
    disk::StorageTarget,
    error::Error,
    extensions::{Handshake, HandshakeCodec, PexFlags},
    metainfo::Info,
    peer::{
        ConnectionState, Direction, Peer, PeerBrMsg, PeerCtx, PeerId, PeerMsg,
        PeerSource,
    },
    pieces::Progress,
    tracker::TrackerGroup,
};

/// Interval of the connect loop.
const CONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// A known peer identity, keyed by its address.
#[derive(Debug)]
struct PeerEntry {
    source: PeerSource,
    state: Option<ConnectionState>,
    failures: u32,
    peer_id: Option<PeerId>,
    /// Set while the peer is connected.
    ctx: Option<Arc<PeerCtx>>,
    /// A task is running for this peer.
    live: bool,
    last_attempt: Option<Instant>,
}

impl PeerEntry {
    fn new(source: PeerSource) -> Self {
        Self {
            source,
            state: None,
            failures: 0,
            peer_id: None,
            ctx: None,
            live: false,
            last_attempt: None,
        }
    }

    fn snapshot(&self, addr: SocketAddr, max_failures: u32) -> PeerSnapshot {
        let mut snapshot = PeerSnapshot::idle(addr, self.source);
        snapshot.state = self.state;
        snapshot.failures = self.failures;
        snapshot.excluded = self.failures >= max_failures;
        snapshot.id = self.peer_id;
        snapshot.client = self.peer_id.map(|id| id.client_name());
        match &self.ctx {
            Some(ctx) => snapshot.with_ctx(ctx),
            None => snapshot,
        }
    }
}

/// This is the main entity responsible for the high-level management of
/// a torrent download or upload. It owns the identity of every peer, the
/// peers themselves run on their own tasks.
pub struct Torrent {
    pub ctx: Arc<TorrentCtx>,
    pub name: String,
    rx: mpsc::Receiver<TorrentMsg>,
    peers: HashMap<SocketAddr, PeerEntry>,
    trackers: TrackerGroup,
    tracker_handles: Vec<JoinHandle<()>>,
    storage: StorageTarget,
    selection: Option<Vec<usize>>,
    started: bool,
    /// A tracker answered, or a peer was added by other means.
    announced: bool,
    error: bool,
}

impl Torrent {
    /// Spawn the torrent and return its session. When the info is known the
    /// storage is opened and checked before this returns.
    pub async fn spawn(
        source: TorrentSource,
        storage: StorageTarget,
        selection: Option<Vec<usize>>,
        local_peer_id: PeerId,
        config: Arc<ResolvedConfig>,
    ) -> Result<TorrentSession, Error> {
        let (tx, rx) = mpsc::channel::<TorrentMsg>(300);

        let size_hint = match &source {
            TorrentSource::MetaInfo(m) => Some(m.info.total_size()),
            TorrentSource::Magnet(m) => m.length(),
        };

        let ctx = Arc::new(TorrentCtx::new(
            source.info_hash(),
            local_peer_id,
            config,
            tx,
            size_hint,
        ));

        if let TorrentSource::MetaInfo(meta_info) = &source {
            let meta_info = (**meta_info).clone();
            let content = Self::open_content(
                meta_info.info,
                meta_info.raw_info,
                &storage,
                selection.clone(),
                &ctx,
            )
            .await?;
            ctx.set_content(content);
            if ctx.content().is_some_and(|c| c.pieces.is_complete()) {
                info!("{} is already complete", source.name());
                ctx.finish(Completion::Complete);
            }
        }

        let torrent = Torrent {
            name: source.name(),
            trackers: TrackerGroup::new(source.trackers()),
            ctx: ctx.clone(),
            rx,
            peers: HashMap::new(),
            tracker_handles: Vec::new(),
            storage,
            selection,
            started: false,
            announced: false,
            error: false,
        };

        let span = tracing::info_span!("torrent", name = %torrent.name);
        spawn(torrent.run().instrument(span));

        Ok(TorrentSession { ctx })
    }

    async fn open_content(
        info: Info,
        raw_info: Vec<u8>,
        storage: &StorageTarget,
        selection: Option<Vec<usize>>,
        ctx: &TorrentCtx,
    ) -> Result<Content, Error> {
        let storage = storage.clone();
        let strategy = ctx.config.piece_strategy;
        let content = spawn_blocking(move || {
            let selection = selection.as_deref();
            Content::new(info, raw_info, &storage, selection, strategy)
        })
        .await?;
        Ok(content)
    }

    /// Run the Torrent main event loop to listen to internal [`TorrentMsg`].
    async fn run(mut self) {
        debug!("running torrent {}", self.ctx.info_hash);

        let cancel = self.ctx.cancel.clone();
        let mut connect_interval = interval(CONNECT_INTERVAL);

        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = connect_interval.tick(), if self.started => {
                    self.dial_idle();
                }
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let TorrentMsg::Quit = msg {
                        break;
                    }
                    self.handle_msg(msg).await;
                }
            }
        }

        info!("quitting torrent {}", self.name);
        self.ctx.cancel.cancel();
        let _ = self.ctx.btx.send(PeerBrMsg::Quit);
        for handle in self.tracker_handles.drain(..) {
            // the loops announce stopped on cancel
            if let Err(e) = handle.await {
                debug!("tracker task ended with {e}");
            }
        }
    }

    async fn handle_msg(&mut self, msg: TorrentMsg) {
        match msg {
            TorrentMsg::Incoming(incoming) => {
                let (socket, handshake) = *incoming;
                self.accept(socket, handshake);
            }
            TorrentMsg::AddPeers(addrs, source) => {
                self.announced = true;
                let added = addrs
                    .into_iter()
                    .filter(|a| self.add_peer(*a, source))
                    .count();
                if added > 0 {
                    debug!("{added} new peers from {source}");
                    self.dial_idle();
                }
            }
            TorrentMsg::AddPeer(addr, source, otx) => {
                let added = self.add_peer(addr, source);
                let _ = otx.send(added);
                if added {
                    self.announced = true;
                    self.dial_idle();
                }
            }
            TorrentMsg::PeerHandshaking(addr) => {
                if let Some(entry) = self.peers.get_mut(&addr) {
                    entry.state = Some(ConnectionState::Handshaking);
                }
            }
            TorrentMsg::PeerConnected(ctx) => self.peer_connected(ctx),
            TorrentMsg::PeerClosed { addr, peer_id, failure } => {
                self.peer_closed(addr, peer_id, failure);
            }
            TorrentMsg::PieceVerified(index) => self.piece_verified(index),
            TorrentMsg::PeerCorrupt(addr) => {
                if self.add_failure(addr) {
                    self.send_to(addr, PeerMsg::Quit);
                }
            }
            TorrentMsg::GetPexPeers(otx) => {
                let _ = otx.send(self.pex_peers());
            }
            TorrentMsg::ReadPeerByAddr(addr, otx) => {
                let ctx = self
                    .connected()
                    .find(|c| c.remote_addr == addr || c.listen_addr() == addr)
                    .cloned();
                let _ = otx.send(ctx);
            }
            TorrentMsg::InfoComplete(raw_info) => {
                self.info_complete(raw_info).await
            }
            TorrentMsg::GetState(otx) => {
                let _ = otx.send(self.state());
            }
            TorrentMsg::GetPeers(otx) => {
                let max = self.ctx.config.max_peer_failures;
                let peers = self
                    .peers
                    .iter()
                    .map(|(addr, entry)| entry.snapshot(*addr, max))
                    .collect();
                let _ = otx.send(peers);
            }
            TorrentMsg::Start => self.start(),
            TorrentMsg::Pause => self.pause(),
            TorrentMsg::Quit => {}
        }
    }

    fn start(&mut self) {
        if self.ctx.paused.swap(false, Ordering::Relaxed) {
            info!("resuming {}", self.name);
            let _ = self.ctx.btx.send(PeerBrMsg::Resume);
        }
        if self.started {
            return;
        }
        info!(
            "starting {} with {} trackers",
            self.name,
            self.trackers.endpoints().len()
        );
        self.started = true;
        self.tracker_handles = self.trackers.spawn(self.ctx.clone());
        self.dial_idle();
    }

    fn pause(&mut self) {
        if !self.started || self.ctx.paused.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("pausing {}", self.name);
        let _ = self.ctx.btx.send(PeerBrMsg::Pause);
    }

    fn is_excluded(&self, entry: &PeerEntry) -> bool {
        entry.failures >= self.ctx.config.max_peer_failures
    }

    /// Remember a new peer, false if it is known.
    fn add_peer(&mut self, addr: SocketAddr, source: PeerSource) -> bool {
        if addr.port() == 0 || addr.ip().is_unspecified() {
            return false;
        }
        if self.peers.contains_key(&addr) {
            return false;
        }
        self.peers.insert(addr, PeerEntry::new(source));
        true
    }

    fn live_count(&self) -> usize {
        self.peers.values().filter(|e| e.live).count()
    }

    fn connected(&self) -> impl Iterator<Item = &Arc<PeerCtx>> {
        self.peers.values().filter_map(|e| e.ctx.as_ref())
    }

    /// Dial known peers that are not connected, up to the peer limit.
    fn dial_idle(&mut self) {
        if !self.started
            || self.ctx.paused.load(Ordering::Relaxed)
            || self.ctx.cancel.is_cancelled()
        {
            return;
        }

        let max = self.ctx.config.max_torrent_peers as usize;
        let free = max.saturating_sub(self.live_count());
        if free == 0 {
            return;
        }

        let now = Instant::now();
        let reconnect_after = self.ctx.config.reconnect_after;
        let to_dial: Vec<(SocketAddr, PeerSource)> = self
            .peers
            .iter()
            .filter(|(_, e)| !e.live && !self.is_excluded(e))
            .filter(|(_, e)| {
                e.last_attempt
                    .map_or(true, |t| now.duration_since(t) >= reconnect_after)
            })
            .take(free)
            .map(|(addr, e)| (*addr, e.source))
            .collect();

        for (addr, source) in to_dial {
            if let Some(entry) = self.peers.get_mut(&addr) {
                entry.live = true;
                entry.state = Some(ConnectionState::Connecting);
                entry.last_attempt = Some(now);
            }
            let ctx = self.ctx.clone();
            spawn(run_peer(ctx, addr, source, None));
        }
    }

    /// Run a connection that the remote initiated.
    fn accept(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    ) {
        let Ok(addr) = socket.get_ref().peer_addr() else {
            return;
        };

        if self.ctx.paused.load(Ordering::Relaxed) {
            debug!("{addr} dropping inbound connection, paused");
            return;
        }
        if self.live_count() >= self.ctx.config.max_torrent_peers as usize {
            debug!("{addr} dropping inbound connection, too many peers");
            return;
        }

        let known = self.peers.get(&addr);
        if known.is_some_and(|e| e.live || self.is_excluded(e)) {
            debug!("{addr} dropping inbound connection");
            return;
        }

        // the same identity behind another port
        let excluded_id = self.peers.values().any(|e| {
            e.peer_id == Some(handshake.peer_id) && self.is_excluded(e)
        });
        if excluded_id {
            debug!(
                "{addr} dropping inbound connection of excluded {}",
                handshake.peer_id
            );
            return;
        }

        let entry = self
            .peers
            .entry(addr)
            .or_insert_with(|| PeerEntry::new(PeerSource::Incoming));
        entry.live = true;
        entry.state = Some(ConnectionState::Handshaking);
        entry.last_attempt = Some(Instant::now());

        let ctx = self.ctx.clone();
        let incoming = Some((socket, handshake));
        spawn(run_peer(ctx, addr, PeerSource::Incoming, incoming));
    }

    fn peer_connected(&mut self, ctx: Arc<PeerCtx>) {
        let addr = ctx.remote_addr;

        let duplicate = self
            .connected()
            .any(|c| c.id == ctx.id && c.remote_addr != addr);

        if duplicate {
            debug!("{addr} is already connected as {}", ctx.id);
            let _ = ctx.tx.try_send(PeerMsg::Quit);
            return;
        }

        info!("{addr} connected, {}", ctx.id.client_name());

        let entry = self
            .peers
            .entry(addr)
            .or_insert_with(|| PeerEntry::new(ctx.source));
        entry.peer_id = Some(ctx.id);
        entry.state = Some(ConnectionState::Active);
        entry.ctx = Some(ctx);
        self.announced = true;
    }

    fn peer_closed(
        &mut self,
        addr: SocketAddr,
        peer_id: Option<PeerId>,
        failure: bool,
    ) {
        let max = self.ctx.config.max_peer_failures;
        let Some(entry) = self.peers.get_mut(&addr) else {
            return;
        };

        entry.live = false;
        entry.ctx = None;
        if peer_id.is_some() {
            entry.peer_id = peer_id;
        }

        if failure {
            entry.failures += 1;
            entry.state = Some(ConnectionState::Failed);
            if entry.failures >= max {
                warn!("{addr} excluded after {} failures", entry.failures);
            }
        } else {
            entry.state = Some(ConnectionState::Closed);
        }
        debug!("{addr} closed, failures: {}", entry.failures);

        self.dial_idle();
    }

    /// Count a failure of a peer, true if it is now excluded.
    fn add_failure(&mut self, addr: SocketAddr) -> bool {
        let max = self.ctx.config.max_peer_failures;
        let Some(entry) = self.peers.get_mut(&addr) else {
            return false;
        };
        entry.failures += 1;
        if entry.failures >= max {
            warn!("{addr} excluded after {} failures", entry.failures);
            return true;
        }
        false
    }

    /// Peers never wait on the torrent, and the torrent never waits on them.
    fn send_to(&self, addr: SocketAddr, msg: PeerMsg) {
        let ctx = self.peers.get(&addr).and_then(|e| e.ctx.as_ref());
        if let Some(ctx) = ctx {
            if ctx.tx.try_send(msg).is_err() {
                debug!("{addr} is busy or gone");
            }
        }
    }

    fn piece_verified(&mut self, index: u32) {
        let _ = self.ctx.btx.send(PeerBrMsg::HavePiece(index));

        let Some(content) = self.ctx.content() else {
            return;
        };

        let progress = content.pieces.progress();
        debug!(
            "piece {index} verified, {}/{}",
            progress.pieces_complete, progress.pieces_total
        );

        if content.pieces.is_complete() && !self.ctx.is_complete() {
            info!("downloaded {}", self.name);
            self.ctx.finish(Completion::Complete);
            let _ = self.ctx.btx.send(PeerBrMsg::SeedOnly);
        }
    }

    fn pex_peers(&self) -> Vec<(SocketAddr, PexFlags)> {
        self.connected()
            .filter(|c| c.state() == ConnectionState::Active)
            .map(|c| {
                let flags = PexFlags::default()
                    .with(PexFlags::SEED, c.is_seed.load(Ordering::Relaxed))
                    .with(
                        PexFlags::HOLEPUNCH,
                        c.supports_holepunch.load(Ordering::Relaxed),
                    )
                    .with(
                        PexFlags::CONNECTABLE,
                        c.direction == Direction::Outbound,
                    );
                (c.listen_addr(), flags)
            })
            .collect()
    }

    async fn info_complete(&mut self, raw_info: Vec<u8>) {
        if self.ctx.content().is_some() {
            return;
        }

        let expected = Some(&self.ctx.info_hash);
        let info = match Info::from_bytes(&raw_info, expected) {
            Ok(info) => info,
            Err(e) => {
                error!("the info of {} is invalid: {e}", self.name);
                self.error = true;
                self.ctx.finish(Completion::Cancelled);
                self.ctx.cancel.cancel();
                return;
            }
        };

        info!(
            "info of {} has {} pieces of {} bytes",
            info.name,
            info.pieces(),
            info.piece_length
        );
        self.name = info.name.clone();

        let content = match Self::open_content(
            info,
            raw_info,
            &self.storage,
            self.selection.clone(),
            &self.ctx,
        )
        .await
        {
            Ok(content) => content,
            Err(e) => {
                error!("could not open the storage of {}: {e}", self.name);
                self.error = true;
                return;
            }
        };

        if !self.ctx.set_content(content) {
            return;
        }
        let _ = self.ctx.btx.send(PeerBrMsg::HaveInfo);

        if self.ctx.content().is_some_and(|c| c.pieces.is_complete()) {
            self.ctx.finish(Completion::Complete);
            let _ = self.ctx.btx.send(PeerBrMsg::SeedOnly);
        }
    }

    fn status(&self) -> TorrentStatus {
        if self.error {
            TorrentStatus::Error
        } else if self.ctx.paused.load(Ordering::Relaxed) {
            TorrentStatus::Paused
        } else if !self.announced {
            TorrentStatus::ConnectingTrackers
        } else if self.ctx.content().is_none() {
            TorrentStatus::DownloadingMetainfo
        } else if self.ctx.is_complete() {
            TorrentStatus::Seeding
        } else {
            TorrentStatus::Downloading
        }
    }

    fn state(&self) -> TorrentState {
        let (progress, size) = match self.ctx.content() {
            Some(content) => {
                let progress = content.pieces.progress();
                let size = content.pieces.bytes_left() + progress.bytes_done;
                (progress, size)
            }
            None => (Progress::default(), 0),
        };

        let mut state = TorrentState {
            name: self.name.clone(),
            info_hash: self.ctx.info_hash.clone(),
            status: self.status(),
            progress,
            size,
            downloaded: self.ctx.counter.downloaded(),
            uploaded: self.ctx.counter.uploaded(),
            download_rate: self.ctx.counter.download_rate(),
            upload_rate: self.ctx.counter.upload_rate(),
            ..Default::default()
        };

        for entry in self.peers.values() {
            match (&entry.ctx, entry.live) {
                (Some(ctx), _) => {
                    state.connected_peers += 1;
                    if !ctx.peer_choking.load(Ordering::Relaxed)
                        && ctx.am_interested.load(Ordering::Relaxed)
                    {
                        state.downloading_from += 1;
                    }
                }
                (None, true) => state.connecting_peers += 1,
                (None, false) if !self.is_excluded(entry) => {
                    state.idle_peers += 1
                }
                _ => {}
            }
        }

        state
    }
}

/// Connect or accept, run the peer and tell the torrent how it ended.
#[tracing::instrument(name = "peer", skip_all, fields(addr = %addr))]
async fn run_peer(
    ctx: Arc<TorrentCtx>,
    addr: SocketAddr,
    source: PeerSource,
    incoming: Option<(Framed<TcpStream, HandshakeCodec>, Handshake)>,
) {
    let peer = match incoming {
        Some((socket, theirs)) => {
            Peer::accept(ctx.clone(), socket, theirs).await
        }
        None => Peer::connect(ctx.clone(), addr, source).await,
    };

    let (peer_id, r) = match peer {
        Ok(peer) => {
            let id = peer.ctx.id;
            (Some(id), peer.run().await)
        }
        Err(e) => (None, Err(e)),
    };

    let failure = match &r {
        Ok(()) => false,
        Err(e) => {
            debug!("session ended: {e}");
            e.counts_as_peer_failure()
        }
    };

    let msg = TorrentMsg::PeerClosed { addr, peer_id, failure };
    let _ = ctx.tx.send(msg).await;
}

/// Handle to a running torrent. Cloning it gives another handle to the
/// same torrent.
#[derive(Debug, Clone)]
pub struct TorrentSession {
    ctx: Arc<TorrentCtx>,
}

impl TorrentSession {
    pub fn ctx(&self) -> &Arc<TorrentCtx> {
        &self.ctx
    }

    pub fn info_hash(&self) -> &crate::metainfo::InfoHash {
        &self.ctx.info_hash
    }

    async fn send(&self, msg: TorrentMsg) -> Result<(), Error> {
        if self.ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.ctx.tx.send(msg).await.map_err(|_| Error::Cancelled)
    }

    /// Start the trackers and the connections. Calling it again does
    /// nothing, unless the torrent is paused, then it resumes.
    pub async fn start(&self) -> Result<(), Error> {
        self.send(TorrentMsg::Start).await
    }

    pub async fn pause(&self) -> Result<(), Error> {
        self.send(TorrentMsg::Pause).await
    }

    /// Add a peer to connect to, false if it is already known.
    pub async fn add_peer(
        &self,
        addr: SocketAddr,
        source: PeerSource,
    ) -> Result<bool, Error> {
        let (otx, orx) = oneshot::channel();
        self.send(TorrentMsg::AddPeer(addr, source, otx)).await?;
        Ok(orx.await?)
    }

    /// Route a connection that the remote initiated.
    pub async fn incoming(
        &self,
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    ) -> Result<(), Error> {
        self.send(TorrentMsg::Incoming(Box::new((socket, handshake)))).await
    }

    /// Progress of the wanted pieces, zeroes while the info is not known.
    pub fn progress(&self) -> Progress {
        self.ctx
            .content()
            .map(|c| c.pieces.progress())
            .unwrap_or_default()
    }

    pub fn is_complete(&self) -> bool {
        self.ctx.is_complete()
    }

    /// Resolves when the torrent is complete, or with
    /// [`Error::Cancelled`] when it is released first.
    pub async fn wait_complete(&self) -> Result<(), Error> {
        let mut rx = self.ctx.completion.subscribe();
        let completion = *rx
            .wait_for(|c| *c != Completion::Pending)
            .await
            .map_err(|_| Error::Cancelled)?;

        match completion {
            Completion::Complete => Ok(()),
            _ => Err(Error::Cancelled),
        }
    }

    pub async fn state(&self) -> Result<TorrentState, Error> {
        let (otx, orx) = oneshot::channel();
        self.send(TorrentMsg::GetState(otx)).await?;
        Ok(orx.await?)
    }

    pub async fn peers(&self) -> Result<Vec<PeerSnapshot>, Error> {
        let (otx, orx) = oneshot::channel();
        self.send(TorrentMsg::GetPeers(otx)).await?;
        Ok(orx.await?)
    }

    /// Stop announcing, close every connection and drop the partial pieces.
    /// Waiters of [`Self::wait_complete`] get [`Error::Cancelled`]. Can be
    /// called many times, from many tasks.
    pub fn release(&self) {
        if self.ctx.cancel.is_cancelled() {
            return;
        }
        self.ctx.cancel.cancel();
        let _ = self.ctx.btx.send(PeerBrMsg::Quit);

        if let Some(content) = self.ctx.content() {
            content.pieces.release_buffers();
        }

        self.ctx.finish(Completion::Cancelled);
        debug!("released {}", self.ctx.info_hash);
    }
}
