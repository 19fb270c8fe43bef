//! A remote peer in the network that downloads and uploads data
mod client;
pub mod session;
mod types;

// re-exports
pub use client::*;
pub use session::Session;
pub use types::*;

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use hashbrown::HashMap;
use tokio::{
    net::TcpStream,
    select,
    sync::{
        broadcast::{self, error::RecvError},
        mpsc, oneshot, OwnedSemaphorePermit,
    },
    task::spawn_blocking,
    time::{interval, interval_at, timeout, Instant},
};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, error, info, warn};

use crate::{
    bitfield::{Bitfield, Reserved, RvtBitfield},
    error::Error,
    extensions::{
        Block, BlockInfo, Core, CoreCodec, ExtMsg, ExtMsgHandler,
        ExtendedMessage, Extension, ExtensionKind, ExtensionTable, Handshake,
        HandshakeCodec, HolepunchMsg, MetadataMsg, PexMsg, PexState,
        MAX_METADATA_SIZE, PEX_INTERVAL,
    },
    pieces::BlockResult,
    torrent::{Content, TorrentCtx, TorrentMsg},
};

/// A block request that is not answered after this is cancelled and the
/// block is given to other peers.
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(15);

/// A metadata piece that is not answered after this is requested again.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Metadata pieces requested at the same time from one peer.
const MAX_METADATA_REQUESTS: usize = 16;

/// Requests of the remote that we queue, the rest are dropped.
const MAX_INCOMING_REQUESTS: usize = 500;

/// The largest piece count that an info of [`MAX_METADATA_SIZE`] can have,
/// bounds the Have messages accepted before the info is known.
const MAX_PIECES: usize = MAX_METADATA_SIZE / 20;

/// Handle peer messages.
/// Each extension will use this type to implement a trait to handle messages of
/// its extension.
pub struct MsgHandler;

/// A peer that completed the handshake, with the state of the peer wire
/// protocol session.
pub struct Peer {
    pub ctx: Arc<PeerCtx>,
    pub torrent_ctx: Arc<TorrentCtx>,

    sink: SplitSink<Framed<TcpStream, CoreCodec>, Core>,
    stream: SplitStream<Framed<TcpStream, CoreCodec>>,
    rx: mpsc::Receiver<PeerMsg>,
    brx: broadcast::Receiver<PeerBrMsg>,

    pub session: Session,

    /// Reserved bytes of the remote handshake.
    pub reserved: Reserved,

    /// Ids that the remote chose for each extension.
    pub ext: ExtensionTable,

    /// Pieces that the remote has.
    pub pieces: Bitfield,

    /// Bitfield received before the info was known, it is validated once
    /// the piece count is known.
    raw_bitfield: Option<Vec<u8>>,

    /// The bits of `pieces` are counted on the availability of the
    /// torrent. Only true after the info is known.
    counted: bool,

    /// Blocks that we requested, with the time of the request.
    pub outgoing_requests: HashMap<BlockInfo, Instant>,

    /// Blocks that the remote requested and were not served yet.
    pub incoming_requests: VecDeque<BlockInfo>,

    /// Metadata pieces that we requested, with the time of the request.
    pub metadata_requests: HashMap<u32, Instant>,

    pex: PexState,

    /// Held while the remote is unchoked.
    upload_permit: Option<OwnedSemaphorePermit>,
}

impl Peer {
    /// Connect to `addr` and handshake as the initiator of the connection.
    pub async fn connect(
        torrent_ctx: Arc<TorrentCtx>,
        addr: SocketAddr,
        source: PeerSource,
    ) -> Result<Self, Error> {
        let connect_timeout = torrent_ctx.config.connect_timeout;

        let socket = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;

        debug!("{addr} connected, handshaking");
        torrent_ctx.tx.send(TorrentMsg::PeerHandshaking(addr)).await?;

        let socket = Framed::new(socket, HandshakeCodec);
        Self::handshake(torrent_ctx, socket, source, None).await
    }

    /// Finish the handshake of a connection that the remote initiated, their
    /// handshake was already read by the daemon.
    pub async fn accept(
        torrent_ctx: Arc<TorrentCtx>,
        socket: Framed<TcpStream, HandshakeCodec>,
        theirs: Handshake,
    ) -> Result<Self, Error> {
        Self::handshake(torrent_ctx, socket, PeerSource::Incoming, Some(theirs))
            .await
    }

    async fn handshake(
        torrent_ctx: Arc<TorrentCtx>,
        socket: Framed<TcpStream, HandshakeCodec>,
        source: PeerSource,
        theirs: Option<Handshake>,
    ) -> Result<Self, Error> {
        let handshake_timeout = torrent_ctx.config.handshake_timeout;

        timeout(
            handshake_timeout,
            Self::exchange_handshakes(torrent_ctx, socket, source, theirs),
        )
        .await
        .map_err(|_| Error::HandshakeTimeout)?
    }

    async fn exchange_handshakes(
        torrent_ctx: Arc<TorrentCtx>,
        mut socket: Framed<TcpStream, HandshakeCodec>,
        source: PeerSource,
        theirs: Option<Handshake>,
    ) -> Result<Self, Error> {
        let local = socket.get_ref().local_addr()?;
        let remote = socket.get_ref().peer_addr()?;

        let info_hash = torrent_ctx.info_hash.clone();
        let ours = Handshake::new(info_hash, torrent_ctx.local_peer_id);

        let (direction, theirs) = match theirs {
            // if inbound, he have already received their first handshake,
            // send our second handshake here.
            Some(theirs) => {
                ours.validate(&theirs)?;
                debug!("{remote} sending the second handshake");
                socket.send(ours.clone()).await?;
                (Direction::Inbound, theirs)
            }
            // if we are connecting, send the first handshake
            None => {
                debug!("{remote} sending the first handshake");
                socket.send(ours.clone()).await?;

                let theirs = match socket.next().await {
                    Some(theirs) => theirs?,
                    None => {
                        warn!("{remote} did not send a handshake");
                        return Err(Error::PeerClosedSocket);
                    }
                };
                ours.validate(&theirs)?;
                (Direction::Outbound, theirs)
            }
        };

        if theirs.peer_id == ours.peer_id {
            warn!("{remote} is ourselves, dropping connection");
            return Err(Error::HandshakeInvalid);
        }

        let reserved = theirs.reserved();
        info!(
            "{remote} handshaked {direction:?} with {} extended: {}",
            theirs.peer_id.client_name(),
            reserved.supports_extended(),
        );

        // switch codecs without losing what was already buffered
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new::<Core>(old_parts.io, CoreCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel(100);

        let ctx = Arc::new(PeerCtx::new(
            theirs.peer_id,
            remote,
            local,
            direction,
            source,
            tx,
        ));

        Ok(Self {
            ctx,
            brx: torrent_ctx.btx.subscribe(),
            torrent_ctx,
            sink,
            stream,
            rx,
            session: Session::default(),
            reserved,
            ext: ExtensionTable::default(),
            pieces: Bitfield::default(),
            raw_bitfield: None,
            counted: false,
            outgoing_requests: HashMap::new(),
            incoming_requests: VecDeque::new(),
            metadata_requests: HashMap::new(),
            pex: PexState::default(),
            upload_permit: None,
        })
    }

    /// Start the event loop of the Peer, listen to messages sent by others
    /// on the peer wire protocol. The blocks of the peer are released when
    /// the loop ends.
    pub async fn run(mut self) -> Result<(), Error> {
        self.ctx.set_state(ConnectionState::Active);
        self.torrent_ctx
            .tx
            .send(TorrentMsg::PeerConnected(self.ctx.clone()))
            .await?;

        let r = self.run_loop().await;

        self.ctx.set_state(ConnectionState::Closing);
        self.free_pending_blocks();
        if self.counted {
            if let Some(content) = self.torrent_ctx.content() {
                content.pieces.remove_remote_bitmap(&self.pieces);
            }
        }

        r
    }

    async fn run_loop(&mut self) -> Result<(), Error> {
        let remote = self.ctx.remote_addr;

        // update the rates of the counter
        let mut tick_interval = interval(Duration::from_secs(1));

        // request info
        let mut info_interval = interval(Duration::from_secs(1));

        // request blocks
        let mut request_interval = interval(Duration::from_millis(500));

        // cancel timed out block requests
        let mut timeout_interval = interval(Duration::from_secs(5));

        // send interested or not interested, and unchoke the remote if an
        // upload slot was freed.
        let mut interested_interval = interval(Duration::from_secs(3));

        let mut pex_interval = interval(Duration::from_secs(5));

        // send message to keep the connection alive
        let mut keep_alive_interval = interval_at(
            Instant::now() + Duration::from_secs(120),
            Duration::from_secs(120),
        );

        // the bitfield must be the first message after the handshake
        if let Some(content) = self.torrent_ctx.content() {
            self.pieces = Bitfield::from_piece(content.pieces.pieces());
            self.counted = true;

            let bitfield = content.pieces.bitmap_snapshot();
            if bitfield.any() {
                debug!("{remote} > bitfield");
                self.send(Core::Bitfield(bitfield)).await?;
            }
        }

        if self.reserved.supports_extended() {
            let metadata_size = self
                .torrent_ctx
                .content()
                .map(|c| c.raw_info.len() as u32);

            let ext = Extension::supported(
                metadata_size,
                Session::DEFAULT_REQUEST_QUEUE_LEN,
                self.torrent_ctx.local_port,
            )
            .yourip(remote.ip());

            debug!("{remote} > extended handshake");
            self.send(ExtendedMessage(Extension::ID, ext.to_payload()?).into())
                .await?;
        }

        loop {
            select! {
                _ = tick_interval.tick() => {
                    self.ctx.counter.update_rates().await;
                }
                _ = info_interval.tick(), if !self.counted => {
                    self.request_metadata().await?;
                }
                _ = request_interval.tick(), if self.can_request() => {
                    self.request_blocks().await?;
                }
                _ = timeout_interval.tick(), if !self.outgoing_requests.is_empty() => {
                    self.check_request_timeout().await?;
                }
                _ = interested_interval.tick() => {
                    // the HaveInfo broadcast might have been lost
                    if !self.counted && self.torrent_ctx.content().is_some() {
                        self.on_info().await?;
                    }
                    self.update_interest().await?;
                    if self.ctx.peer_interested.load(Ordering::Relaxed) {
                        self.try_unchoke().await?;
                    }
                }
                _ = pex_interval.tick() => {
                    self.send_pex().await?;
                }
                _ = keep_alive_interval.tick() => {
                    self.send(Core::KeepAlive).await?;
                }
                _ = std::future::ready(()), if !self.incoming_requests.is_empty() => {
                    self.serve_request().await?;
                }
                msg = self.stream.next() => {
                    match msg {
                        Some(Ok(msg)) => self.handle_message(msg).await?,
                        Some(Err(e)) => return Err(e),
                        None => return Err(Error::PeerClosedSocket),
                    }
                }
                Some(msg) = self.rx.recv() => {
                    match msg {
                        PeerMsg::SendToSink(msg) => {
                            self.send(msg).await?;
                        }
                        PeerMsg::Holepunch(msg) => {
                            self.send_ext(ExtensionKind::Holepunch, &msg).await?;
                        }
                        PeerMsg::CancelBlock(block_info) => {
                            self.cancel_block(block_info).await?;
                        }
                        PeerMsg::Quit => {
                            debug!("{remote} quit");
                            return Ok(());
                        }
                    }
                }
                msg = self.brx.recv() => {
                    match msg {
                        Ok(PeerBrMsg::HavePiece(piece)) => {
                            self.have_piece(piece).await?;
                        }
                        Ok(PeerBrMsg::Cancel(block_info)) => {
                            self.cancel_block(block_info).await?;
                        }
                        Ok(PeerBrMsg::HaveInfo) => {
                            self.on_info().await?;
                        }
                        Ok(PeerBrMsg::Pause) => {
                            self.pause().await?;
                        }
                        Ok(PeerBrMsg::Resume) => {
                            self.resume().await?;
                        }
                        Ok(PeerBrMsg::SeedOnly) => {
                            debug!("{remote} seed_only");
                            self.session.seed_only = true;
                            self.update_interest().await?;
                        }
                        Ok(PeerBrMsg::Quit) | Err(RecvError::Closed) => {
                            debug!("{remote} quit");
                            return Ok(());
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!("{remote} lagged {n} torrent messages");
                        }
                    }
                }
                _ = self.torrent_ctx.cancel.cancelled() => {
                    debug!("{remote} torrent cancelled");
                    return Ok(());
                }
            }
        }
    }

    /// Dispatch a message to the handler of its protocol.
    async fn handle_message(&mut self, msg: Core) -> Result<(), Error> {
        let Core::Extended(ExtendedMessage(id, payload)) = msg else {
            return MsgHandler.handle_msg(self, msg).await;
        };

        if !self.reserved.supports_extended() {
            debug!(
                "{} sent an extended message without advertising it",
                self.ctx.remote_addr
            );
            return Ok(());
        }

        if id == Extension::ID {
            let msg = Extension::from_payload(&payload)?;
            return MsgHandler.handle_msg(self, msg).await;
        }

        match self.ext.local_kind(id) {
            Some(ExtensionKind::Metadata) => {
                let msg = MetadataMsg::from_payload(&payload)?;
                MsgHandler.handle_msg(self, msg).await
            }
            Some(ExtensionKind::Pex) => {
                let msg = PexMsg::from_payload(&payload)?;
                MsgHandler.handle_msg(self, msg).await
            }
            Some(ExtensionKind::Holepunch) => {
                let msg = HolepunchMsg::from_payload(&payload)?;
                MsgHandler.handle_msg(self, msg).await
            }
            None => {
                debug!("{} unknown extension id {id}", self.ctx.remote_addr);
                Ok(())
            }
        }
    }

    pub async fn send(&mut self, msg: Core) -> Result<(), Error> {
        self.sink.send(msg).await
    }

    /// Send a message of an extension with the id that the remote chose for
    /// it. Nothing is sent if the remote doesn't support the extension.
    pub async fn send_ext<M: ExtMsg>(
        &mut self,
        kind: ExtensionKind,
        msg: &M,
    ) -> Result<(), Error> {
        let Some(id) = self.ext.remote_id(kind) else {
            debug!("{} does not support {}", self.ctx.remote_addr, kind.name());
            return Ok(());
        };
        let payload = msg.to_payload()?;
        self.send(ExtendedMessage(id, payload).into()).await
    }

    /// Check if we can request new blocks, if:
    /// - We are not being choked by the peer
    /// - We are interested in the peer
    /// - We have the downloaded the info of the torrent
    /// - The torrent is not fully downloaded (peer is not in seed-only mode)
    /// - The torrent is not paused
    /// - The capacity of inflight blocks is not full (len of outgoing_requests)
    pub fn can_request(&self) -> bool {
        let am_interested = self.ctx.am_interested.load(Ordering::Relaxed);
        let peer_choking = self.ctx.peer_choking.load(Ordering::Relaxed);
        let have_capacity = self.outgoing_requests.len()
            < self.session.target_request_queue_len as usize;

        am_interested
            && !peer_choking
            && self.counted
            && have_capacity
            && !self.session.seed_only
            && !self.session.paused
    }

    /// Request new blocks to this Peer's remote address.
    /// Must be used after checking that the Peer is able to send blocks with
    /// [`Self::can_request`].
    pub async fn request_blocks(&mut self) -> Result<(), Error> {
        let Some(content) = self.torrent_ctx.content() else {
            return Ok(());
        };
        let remote = self.ctx.remote_addr;

        // the number of blocks we can request right now
        let request_len = (self.session.target_request_queue_len as usize)
            .saturating_sub(self.outgoing_requests.len());

        let now = Instant::now();
        let mut requested = 0;

        for _ in 0..request_len {
            let claimed = content.pieces.claim_block(remote, &self.pieces);
            let Some(block_info) = claimed else {
                break;
            };
            self.outgoing_requests.insert(block_info, now);
            self.sink.feed(Core::Request(block_info)).await?;
            requested += 1;
        }

        if requested > 0 {
            debug!(
                "{remote} > {requested} requests, inflight: {}",
                self.outgoing_requests.len()
            );
            self.sink.flush().await?;
        }

        self.session.in_endgame = content.pieces.in_endgame();

        Ok(())
    }

    /// Handle a new Piece msg from the peer, a Piece msg actually sends
    /// a block, and not a piece.
    pub async fn handle_block(&mut self, block: Block) -> Result<(), Error> {
        let remote = self.ctx.remote_addr;
        let block_info = BlockInfo::from(&block);

        if self.outgoing_requests.remove(&block_info).is_none() {
            debug!("{remote} < unrequested block {block_info:?}");
        }

        let len = block.block.len() as u64;
        self.ctx.counter.record_download(len);
        self.torrent_ctx.counter.record_download(len);

        let Some(content) = self.torrent_ctx.content() else {
            return Ok(());
        };

        let in_endgame = self.session.in_endgame;
        let Block { index, begin, block } = block;

        let result =
            spawn_blocking(move || store_block(&content, index, begin, &block))
                .await?;

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                error!("could not write piece {index}: {e}");
                return Ok(());
            }
        };

        match result {
            BlockResult::Accepted | BlockResult::Duplicate => {}
            BlockResult::Invalid => {
                warn!("{remote} sent an invalid block {block_info:?}");
                return Err(Error::MessageInvalid("block out of range"));
            }
            BlockResult::PieceComplete { index, .. } => {
                debug!("{remote} completed piece {index}");
                self.torrent_ctx
                    .tx
                    .send(TorrentMsg::PieceVerified(index))
                    .await?;
            }
            BlockResult::PieceCorrupt(index) => {
                warn!("{remote} piece {index} is corrupted");
                let msg = TorrentMsg::PeerCorrupt(remote);
                self.torrent_ctx.tx.send(msg).await?;
            }
        }

        // other peers with the same block outstanding can cancel it
        if in_endgame {
            let _ = self.torrent_ctx.btx.send(PeerBrMsg::Cancel(block_info));
        }

        if self.can_request() {
            self.request_blocks().await?;
        }

        Ok(())
    }

    /// Cancel requests that were not answered in [`BLOCK_TIMEOUT`] and give
    /// the blocks back to the torrent.
    async fn check_request_timeout(&mut self) -> Result<(), Error> {
        let Some(content) = self.torrent_ctx.content() else {
            return Ok(());
        };
        let remote = self.ctx.remote_addr;
        let now = Instant::now();

        let timed_out: Vec<BlockInfo> = self
            .outgoing_requests
            .iter()
            .filter(|(_, t)| now.duration_since(**t) >= BLOCK_TIMEOUT)
            .map(|(block_info, _)| *block_info)
            .collect();

        if timed_out.is_empty() {
            return Ok(());
        }

        debug!("{remote} {} requests timed out", timed_out.len());

        for block_info in timed_out {
            self.outgoing_requests.remove(&block_info);
            content.pieces.release_block(remote, &block_info);
            self.sink.feed(Core::Cancel(block_info)).await?;
        }
        self.sink.flush().await?;

        if self.can_request() {
            self.request_blocks().await?;
        }

        Ok(())
    }

    /// Give the outgoing requests back to the torrent so that other peers
    /// can request those blocks.
    pub fn free_pending_blocks(&mut self) {
        if let Some(content) = self.torrent_ctx.content() {
            content.pieces.release_blocks(self.ctx.remote_addr);
        }
        if !self.outgoing_requests.is_empty() {
            debug!(
                "{} freeing {} blocks",
                self.ctx.remote_addr,
                self.outgoing_requests.len()
            );
        }
        self.outgoing_requests.clear();
    }

    /// Cancel a block that is no longer needed from this peer.
    async fn cancel_block(
        &mut self,
        block_info: BlockInfo,
    ) -> Result<(), Error> {
        if self.outgoing_requests.remove(&block_info).is_none() {
            return Ok(());
        }
        if let Some(content) = self.torrent_ctx.content() {
            content.pieces.release_block(self.ctx.remote_addr, &block_info);
        }
        debug!("{} > cancel {block_info:?}", self.ctx.remote_addr);
        self.send(Core::Cancel(block_info)).await
    }

    /// Send interested or not interested.
    /// - 1. if the peer has at least 1 piece which we want, send interested.
    /// - 2. later, if we already have all pieces which the peer has, and we
    ///   are interested, send not interested.
    pub async fn update_interest(&mut self) -> Result<(), Error> {
        let should_be_interested = match self.torrent_ctx.content() {
            Some(content)
                if self.counted
                    && !self.session.paused
                    && !self.session.seed_only =>
            {
                content.pieces.wants_from(&self.pieces)
            }
            _ => false,
        };

        let am_interested = self.ctx.am_interested.load(Ordering::Relaxed);
        let remote = self.ctx.remote_addr;

        if should_be_interested && !am_interested {
            info!("{remote} > interested");
            self.ctx.am_interested.store(true, Ordering::Relaxed);
            self.send(Core::Interested).await?;
        }

        // sorry, you're not the problem, it's me.
        if !should_be_interested && am_interested {
            info!("{remote} > not interested");
            self.ctx.am_interested.store(false, Ordering::Relaxed);
            self.send(Core::NotInterested).await?;
        }

        Ok(())
    }

    /// The remote has a new piece.
    pub async fn remote_have(&mut self, piece: u32) -> Result<(), Error> {
        let index = piece as usize;

        match self.torrent_ctx.content() {
            Some(content) if self.counted => {
                if index >= content.pieces.pieces() {
                    return Err(Error::MessageInvalid("have out of range"));
                }
                if !self.pieces[index] {
                    self.pieces.set(index, true);
                    content.pieces.add_remote_piece(piece);
                }
            }
            // validated when the info arrives
            _ => {
                if index >= MAX_PIECES {
                    return Err(Error::MessageInvalid("have out of range"));
                }
                self.pieces.safe_set(index);
            }
        }

        self.update_is_seed();
        self.update_interest().await
    }

    /// The remote sent the pieces that it has.
    pub async fn remote_bitfield(
        &mut self,
        bitfield: Bitfield,
    ) -> Result<(), Error> {
        let raw = bitfield.into_vec();

        match self.torrent_ctx.content() {
            Some(content) if self.counted => {
                let bitfield = Bitfield::from_wire(raw, content.pieces.pieces())
                    .ok_or(Error::MessageInvalid("bitfield"))?;

                content.pieces.remove_remote_bitmap(&self.pieces);
                content.pieces.add_remote_bitmap(&bitfield);
                self.pieces = bitfield;
            }
            _ => self.raw_bitfield = Some(raw),
        }

        self.update_is_seed();
        self.update_interest().await
    }

    fn update_is_seed(&self) {
        let is_seed = self.counted && self.pieces.all();
        self.ctx.is_seed.store(is_seed, Ordering::Relaxed);
    }

    /// The info of the torrent was downloaded, validate what the remote
    /// told us before and start the piece exchange.
    async fn on_info(&mut self) -> Result<(), Error> {
        self.metadata_requests.clear();

        if self.counted {
            return Ok(());
        }
        let Some(content) = self.torrent_ctx.content() else {
            return Ok(());
        };
        let n = content.pieces.pieces();

        let mut pieces = match self.raw_bitfield.take() {
            Some(raw) => Bitfield::from_wire(raw, n)
                .ok_or(Error::MessageInvalid("bitfield"))?,
            None => Bitfield::from_piece(n),
        };

        for index in self.pieces.iter_ones() {
            if index >= n {
                return Err(Error::MessageInvalid("have out of range"));
            }
            pieces.set(index, true);
        }

        content.pieces.add_remote_bitmap(&pieces);
        self.pieces = pieces;
        self.counted = true;
        self.update_is_seed();

        // a bitfield can't be sent at this point of the connection
        let ours = content.pieces.bitmap_snapshot();
        for piece in ours.iter_ones() {
            self.sink.feed(Core::Have(piece as u32)).await?;
        }
        self.sink.flush().await?;

        self.update_interest().await
    }

    /// We downloaded a piece, tell the remote if it doesn't have it.
    async fn have_piece(&mut self, piece: u32) -> Result<(), Error> {
        let has = self.pieces.get(piece as usize).map(|b| *b).unwrap_or(false);
        if !has {
            self.send(Core::Have(piece)).await?;
        }
        self.update_interest().await
    }

    /// Request the pieces of the info that are missing, and request again
    /// the ones that timed out.
    async fn request_metadata(&mut self) -> Result<(), Error> {
        if !self.ext.supports(ExtensionKind::Metadata) {
            return Ok(());
        }

        let now = Instant::now();
        let before = self.metadata_requests.len();
        self.metadata_requests
            .retain(|_, t| now.duration_since(*t) < METADATA_TIMEOUT);

        let timed_out = before - self.metadata_requests.len();
        if timed_out > 0 {
            info!(
                "{} rerequesting {timed_out} timed-out meta pieces",
                self.ctx.remote_addr
            );
        }

        for piece in self.torrent_ctx.metadata_missing() {
            if self.metadata_requests.len() >= MAX_METADATA_REQUESTS {
                break;
            }
            if self.metadata_requests.contains_key(&piece) {
                continue;
            }
            debug!("{} > metadata req {piece}", self.ctx.remote_addr);
            self.send_ext(ExtensionKind::Metadata, &MetadataMsg::Request(piece))
                .await?;
            self.metadata_requests.insert(piece, now);
        }

        Ok(())
    }

    /// Send the peers that were connected or dropped since the last PEX
    /// message. Private torrents never use PEX.
    async fn send_pex(&mut self) -> Result<(), Error> {
        let Some(content) = self.torrent_ctx.content() else {
            return Ok(());
        };
        if content.info.private || !self.ext.supports(ExtensionKind::Pex) {
            return Ok(());
        }
        if self.session.last_pex.is_some_and(|t| t.elapsed() < PEX_INTERVAL) {
            return Ok(());
        }

        let (otx, orx) = oneshot::channel();
        self.torrent_ctx.tx.send(TorrentMsg::GetPexPeers(otx)).await?;

        let remote = self.ctx.remote_addr;
        let listen = self.ctx.listen_addr();
        let peers: Vec<_> = orx
            .await?
            .into_iter()
            .filter(|(addr, _)| *addr != remote && *addr != listen)
            .collect();

        self.session.last_pex = Some(Instant::now());

        if let Some(msg) = self.pex.delta(&peers) {
            debug!(
                "{remote} > pex added {} dropped {}",
                msg.added.len(),
                msg.dropped.len()
            );
            self.send_ext(ExtensionKind::Pex, &msg).await?;
        }

        Ok(())
    }

    /// Unchoke the remote if there is a free upload slot.
    pub async fn try_unchoke(&mut self) -> Result<(), Error> {
        if !self.ctx.am_choking.load(Ordering::Relaxed)
            || self.session.paused
            || !self.counted
        {
            return Ok(());
        }

        match self.torrent_ctx.upload_slots.clone().try_acquire_owned() {
            Ok(permit) => {
                debug!("{} > unchoke", self.ctx.remote_addr);
                self.upload_permit = Some(permit);
                self.ctx.am_choking.store(false, Ordering::Relaxed);
                self.send(Core::Unchoke).await?;
            }
            Err(_) => {
                debug!("{} no free upload slots", self.ctx.remote_addr);
            }
        }

        Ok(())
    }

    /// Choke the remote and free its upload slot.
    pub async fn choke(&mut self) -> Result<(), Error> {
        if self.ctx.am_choking.load(Ordering::Relaxed) {
            return Ok(());
        }
        debug!("{} > choke", self.ctx.remote_addr);
        self.ctx.am_choking.store(true, Ordering::Relaxed);
        self.upload_permit = None;
        self.incoming_requests.clear();
        self.send(Core::Choke).await
    }

    /// Queue a request of the remote, if we advertised the piece.
    pub fn queue_request(&mut self, block_info: BlockInfo) {
        let remote = self.ctx.remote_addr;

        if self.ctx.am_choking.load(Ordering::Relaxed) {
            debug!("{remote} requested while choked");
            return;
        }
        let Some(content) = self.torrent_ctx.content() else {
            return;
        };

        let end = block_info.begin as u64 + block_info.len as u64;
        let valid = block_info.is_valid()
            && content.pieces.is_stored(block_info.index)
            && end <= content.info.piece_size(block_info.index as usize);

        if !valid {
            debug!("{remote} invalid request {block_info:?}");
            return;
        }

        if self.incoming_requests.len() >= MAX_INCOMING_REQUESTS
            || self.incoming_requests.contains(&block_info)
        {
            return;
        }

        self.incoming_requests.push_back(block_info);
    }

    /// Read and send the oldest request of the remote.
    async fn serve_request(&mut self) -> Result<(), Error> {
        let Some(block_info) = self.incoming_requests.pop_front() else {
            return Ok(());
        };
        let Some(content) = self.torrent_ctx.content() else {
            return Ok(());
        };
        let remote = self.ctx.remote_addr;

        let offset = content.pieces.piece_offset(block_info.index)
            + block_info.begin as u64;
        let storage = content.storage.clone();
        let len = block_info.len as usize;

        let data = spawn_blocking(move || storage.read_at(offset, len)).await?;

        match data {
            Ok(block) => {
                let len = block.len() as u64;
                self.send(Core::Piece(Block {
                    index: block_info.index,
                    begin: block_info.begin,
                    block,
                }))
                .await?;
                self.ctx.counter.record_upload(len);
                self.torrent_ctx.counter.record_upload(len);
            }
            Err(e) => warn!("{remote} could not read {block_info:?}: {e}"),
        }

        Ok(())
    }

    async fn pause(&mut self) -> Result<(), Error> {
        let remote = self.ctx.remote_addr;
        debug!("{remote} pause");
        self.session.paused = true;

        if self.ctx.am_interested.load(Ordering::Relaxed) {
            self.ctx.am_interested.store(false, Ordering::Relaxed);
            self.send(Core::NotInterested).await?;
        }

        self.choke().await?;

        let outgoing: Vec<BlockInfo> =
            self.outgoing_requests.keys().copied().collect();
        for block_info in outgoing {
            self.sink.feed(Core::Cancel(block_info)).await?;
        }
        self.sink.flush().await?;

        self.free_pending_blocks();
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), Error> {
        debug!("{} resume", self.ctx.remote_addr);
        self.session.paused = false;
        self.update_interest().await?;
        if self.ctx.peer_interested.load(Ordering::Relaxed) {
            self.try_unchoke().await?;
        }
        Ok(())
    }
}

/// Submit a block and write the piece that it completes, runs on the
/// blocking pool.
fn store_block(
    content: &Content,
    index: u32,
    begin: u32,
    data: &[u8],
) -> Result<BlockResult, Error> {
    let result = content.pieces.submit_block(index, begin, data);

    if let BlockResult::PieceComplete { index, data } = &result {
        let offset = content.pieces.piece_offset(*index);
        if let Err(e) = content.storage.write_at(offset, data) {
            content.pieces.fail_piece(*index);
            return Err(e);
        }
        content.pieces.mark_stored(*index);
    }

    Ok(result)
}
