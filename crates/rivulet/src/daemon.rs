//! The registry of every torrent of the client, and the listener of inbound
//! peer connections.
//!
//! The daemon is built by the entry point and passed by reference, nothing
//! in the library is global.
use std::{net::SocketAddr, sync::Arc};

use futures::StreamExt;
use hashbrown::HashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    select, spawn,
    sync::RwLock,
    time::timeout,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, info, warn};

use crate::{
    config::ResolvedConfig,
    disk::StorageTarget,
    error::Error,
    extensions::HandshakeCodec,
    metainfo::InfoHash,
    peer::PeerId,
    torrent::{Torrent, TorrentSession, TorrentState},
};

pub use crate::torrent::TorrentSource;

/// Context of the [`Daemon`] that may be shared between other types.
#[derive(Debug)]
pub struct DaemonCtx {
    pub config: Arc<ResolvedConfig>,
    /// The same for every torrent of the client.
    pub local_peer_id: PeerId,
    /// Stops the listener.
    pub cancel: CancellationToken,
    torrents: RwLock<HashMap<InfoHash, TorrentSession>>,
}

impl DaemonCtx {
    pub async fn session(
        &self,
        info_hash: &InfoHash,
    ) -> Option<TorrentSession> {
        self.torrents.read().await.get(info_hash).cloned()
    }
}

/// Owns every [`TorrentSession`], keyed by info hash.
#[derive(Debug, Clone)]
pub struct Daemon {
    pub ctx: Arc<DaemonCtx>,
}

impl Daemon {
    pub fn new(config: ResolvedConfig) -> Self {
        let local_peer_id = PeerId::generate();
        debug!("local peer id {local_peer_id:?}");

        Self {
            ctx: Arc::new(DaemonCtx {
                config: Arc::new(config),
                local_peer_id,
                cancel: CancellationToken::new(),
                torrents: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Add a torrent, it is not started. `selection` are the indices of the
    /// files to download, all of them when `None`.
    pub async fn submit(
        &self,
        source: TorrentSource,
        target: StorageTarget,
        selection: Option<Vec<usize>>,
    ) -> Result<InfoHash, Error> {
        let info_hash = source.info_hash();

        if self.ctx.torrents.read().await.contains_key(&info_hash) {
            return Err(Error::NoDuplicateTorrent);
        }

        info!("adding torrent {} {info_hash}", source.name());

        let session = Torrent::spawn(
            source,
            target,
            selection,
            self.ctx.local_peer_id,
            self.ctx.config.clone(),
        )
        .await?;

        let mut torrents = self.ctx.torrents.write().await;
        if torrents.contains_key(&info_hash) {
            session.release();
            return Err(Error::NoDuplicateTorrent);
        }
        torrents.insert(info_hash.clone(), session);

        Ok(info_hash)
    }

    pub async fn session(
        &self,
        info_hash: &InfoHash,
    ) -> Result<TorrentSession, Error> {
        self.ctx.session(info_hash).await.ok_or(Error::TorrentDoesNotExist)
    }

    pub async fn start(&self, info_hash: &InfoHash) -> Result<(), Error> {
        self.session(info_hash).await?.start().await
    }

    pub async fn pause(&self, info_hash: &InfoHash) -> Result<(), Error> {
        self.session(info_hash).await?.pause().await
    }

    /// Release the torrent and forget it.
    pub async fn delete(&self, info_hash: &InfoHash) -> Result<(), Error> {
        let session = self
            .ctx
            .torrents
            .write()
            .await
            .remove(info_hash)
            .ok_or(Error::TorrentDoesNotExist)?;

        info!("deleting torrent {info_hash}");
        session.release();
        Ok(())
    }

    /// States of every torrent, the ones that were released are skipped.
    pub async fn list(&self) -> Vec<TorrentState> {
        let sessions: Vec<TorrentSession> =
            self.ctx.torrents.read().await.values().cloned().collect();

        let mut states = Vec::with_capacity(sessions.len());
        for session in sessions {
            if let Ok(state) = session.state().await {
                states.push(state);
            }
        }
        states
    }

    /// Bind the peer port and accept inbound connections until
    /// [`Self::shutdown`]. Returns the bound address.
    pub async fn listen(&self) -> Result<SocketAddr, Error> {
        let port = self.ctx.config.local_peer_port;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        info!("accepting peers on {local}");
        spawn(accept_loop(listener, self.ctx.clone()));

        Ok(local)
    }

    /// Stop listening and release every torrent.
    pub async fn shutdown(&self) {
        self.ctx.cancel.cancel();
        let torrents: Vec<_> =
            self.ctx.torrents.write().await.drain().collect();
        for (_, session) in torrents {
            session.release();
        }
    }
}

#[tracing::instrument(name = "listener", skip_all)]
async fn accept_loop(listener: TcpListener, ctx: Arc<DaemonCtx>) {
    loop {
        select! {
            _ = ctx.cancel.cancelled() => return,
            r = listener.accept() => {
                match r {
                    Ok((socket, addr)) => {
                        debug!("{addr} inbound connection");
                        spawn(route_inbound(socket, addr, ctx.clone()));
                    }
                    Err(e) => warn!("could not accept a connection: {e}"),
                }
            }
        }
    }
}

/// Read the handshake of an inbound connection and give it to the torrent
/// of its info hash.
async fn route_inbound(
    socket: TcpStream,
    addr: SocketAddr,
    ctx: Arc<DaemonCtx>,
) {
    let mut socket = Framed::new(socket, HandshakeCodec);

    let handshake =
        match timeout(ctx.config.handshake_timeout, socket.next()).await {
            Ok(Some(Ok(handshake))) => handshake,
            Ok(Some(Err(e))) => {
                debug!("{addr} sent an invalid handshake: {e}");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                debug!("{addr} did not send a handshake");
                return;
            }
        };

    let Some(session) = ctx.session(&handshake.info_hash).await else {
        debug!("{addr} wants unknown torrent {}", handshake.info_hash);
        return;
    };

    if let Err(e) = session.incoming(socket, handshake).await {
        debug!("{addr} could not be routed: {e}");
    }
}
