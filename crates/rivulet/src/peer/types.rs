use std::{
    fmt::Display,
    net::SocketAddr,
    sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering},
};

use rand::Rng;
use speedy::{Readable, Writable};
use tokio::sync::mpsc;

use crate::{
    counter::Counter,
    extensions::{core::BlockInfo, Core, HolepunchMsg},
    peer::client_name,
};

/// Prefix of our peer ids, Azureus-style.
pub const PEER_ID_PREFIX: &[u8; 8] = b"-RV0100-";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// A random peer id with our client prefix.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(PEER_ID_PREFIX);
        rand::thread_rng().fill(&mut id[8..]);
        Self(id)
    }

    /// Name of the client that generated this id, or "unknown".
    pub fn client_name(&self) -> &'static str {
        client_name(&self.0)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self, self.client_name())
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = &'static str;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let buff: [u8; 20] = value
            .try_into()
            .map_err(|_| "The PeerId must have exactly 20 bytes")?;
        Ok(PeerId(buff))
    }
}

/// Messages sent to one peer.
#[derive(Debug)]
pub enum PeerMsg {
    SendToSink(Core),
    /// Introduce the remote to another peer, we are the holepunch relay.
    Holepunch(HolepunchMsg),
    /// Sends a Cancel message to cancel a block info that we
    /// expect the peer to send us, because we requested it previously.
    CancelBlock(BlockInfo),
    Quit,
}

/// Messages broadcasted by the torrent to all of its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerBrMsg {
    /// When we download a full piece, we need to send Have's
    /// to peers that dont Have it.
    HavePiece(u32),
    /// A block that arrived in endgame, peers that requested it too must
    /// cancel it.
    Cancel(BlockInfo),
    /// Sent when the torrent has downloaded the entire info of the torrent.
    HaveInfo,
    /// Sent when the torrent is paused, it makes the peer pause downloads and
    /// uploads
    Pause,
    /// Sent when the torrent was unpaused.
    Resume,
    /// Sent to make this peer read-only, the peer won't download
    /// anymore, but it will still seed.
    /// This usually happens when the torrent is fully downloaded.
    SeedOnly,
    Quit,
}

/// Determines who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Outbound means we initiated the connection
    Outbound,
    /// Inbound means the peer initiated the connection
    Inbound,
}

/// How we learned about a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Tracker,
    Pex,
    Dht,
    /// The peer connected to us.
    Incoming,
    /// Introduced by a holepunch relay.
    Holepunch,
}

impl Display for PeerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeerSource::Tracker => "tracker",
            PeerSource::Pex => "pex",
            PeerSource::Dht => "dht",
            PeerSource::Incoming => "incoming",
            PeerSource::Holepunch => "holepunch",
        };
        f.write_str(s)
    }
}

/// State of the connection with a peer.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected, or the TCP connection is being made.
    #[default]
    Connecting = 0,
    Handshaking = 1,
    /// Handshaked, exchanging messages.
    Active = 2,
    Closing = 3,
    Closed = 4,
    /// Closed because of a protocol violation or an I/O error.
    Failed = 5,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Handshaking,
            2 => Self::Active,
            3 => Self::Closing,
            4 => Self::Closed,
            5 => Self::Failed,
            _ => Self::Connecting,
        }
    }
}

/// Ctx that is shared with the torrent and the other peers of the torrent.
#[derive(Debug)]
pub struct PeerCtx {
    pub direction: Direction,
    pub source: PeerSource,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub id: PeerId,
    pub tx: mpsc::Sender<PeerMsg>,

    /// We are interested in the remote.
    pub am_interested: AtomicBool,
    /// We are choking the remote.
    pub am_choking: AtomicBool,
    /// The remote is interested in us.
    pub peer_interested: AtomicBool,
    /// The remote is choking us.
    pub peer_choking: AtomicBool,

    pub supports_holepunch: AtomicBool,
    pub is_seed: AtomicBool,
    /// Listen port advertised on the extended handshake, 0 if unknown.
    pub listen_port: AtomicU16,
    pub counter: Counter,
    state: AtomicU8,
}

impl PeerCtx {
    pub fn new(
        id: PeerId,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        direction: Direction,
        source: PeerSource,
        tx: mpsc::Sender<PeerMsg>,
    ) -> Self {
        Self {
            direction,
            source,
            remote_addr,
            local_addr,
            id,
            tx,
            am_interested: AtomicBool::new(false),
            am_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            supports_holepunch: AtomicBool::new(false),
            is_seed: AtomicBool::new(false),
            listen_port: AtomicU16::new(0),
            counter: Counter::new(),
            state: AtomicU8::new(ConnectionState::Handshaking as u8),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::Relaxed).into()
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// The address that other peers can connect to. For outbound connections
    /// this is the remote address, for inbound connections the remote port
    /// is ephemeral and the listen port of the extended handshake is used.
    pub fn listen_addr(&self) -> SocketAddr {
        match self.listen_port.load(Ordering::Relaxed) {
            0 => self.remote_addr,
            p if self.direction == Direction::Inbound => {
                SocketAddr::new(self.remote_addr.ip(), p)
            }
            _ => self.remote_addr,
        }
    }
}
