use tokio::time::Instant;

/// Holds and provides facilities to modify the state of a peer session.
#[derive(Debug)]
pub struct Session {
    /// The target request queue size is the number of block requests we keep
    /// outstanding
    pub target_request_queue_len: u16,

    /// Whether the torrent was in endgame on the last request.
    pub in_endgame: bool,

    /// If the torrent was fully downloaded, all peers will become seed only.
    /// They will only seed but not download anything anymore.
    pub seed_only: bool,

    /// The torrent is paused, nothing is downloaded or uploaded.
    pub paused: bool,

    /// The last time a PEX message was sent to the peer.
    pub last_pex: Option<Instant>,

    /// The time the BitTorrent connection was established (i.e. after
    /// handshaking)
    pub connected_time: Instant,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            target_request_queue_len: Session::DEFAULT_REQUEST_QUEUE_LEN,
            in_endgame: false,
            seed_only: false,
            paused: false,
            last_pex: None,
            connected_time: Instant::now(),
        }
    }
}

impl Session {
    /// The value of outstanding blocks for a peer.
    ///
    /// Before we do an extended handshake,
    /// we do not have access to `reqq`.
    /// And so this value is initialized with a sane default,
    /// most clients support 250+ inflight requests.
    ///
    /// After the extended handshake, this value is lowered to the `reqq` of
    /// the peer, if it is smaller.
    pub const DEFAULT_REQUEST_QUEUE_LEN: u16 = 200;

    pub fn set_remote_reqq(&mut self, reqq: u16) {
        self.target_request_queue_len =
            Self::DEFAULT_REQUEST_QUEUE_LEN.min(reqq).max(1);
    }
}
