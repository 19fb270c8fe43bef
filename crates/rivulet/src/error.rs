use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    bencode::DecodeError, metainfo::MetainfoError, peer::PeerMsg,
    torrent::TorrentMsg,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to decode the bencode buffer: {0}")]
    Decode(#[from] DecodeError),

    #[error("Invalid metainfo: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("IO error: {0}")]
    IO(#[from] io::Error),

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("HTTP request to the tracker failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format: {0}"
    )]
    ConfigDeserializeError(#[from] toml::de::Error),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer took to long to send the handshake")]
    HandshakeTimeout,

    #[error("The peer sent a message of {0} bytes, over the limit")]
    MessageTooLarge(usize),

    #[error("The message received from the peer is malformed: {0}")]
    MessageInvalid(&'static str),

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("The peer took to long to respond")]
    Timeout,

    #[error("The operation was cancelled")]
    Cancelled,

    #[error("Tracker resolved to no usable addresses")]
    TrackerNoHosts,

    #[error("Could not connect to the UDP socket of the tracker")]
    TrackerSocketConnect,

    #[error("The response received from the tracker is not valid")]
    TrackerResponse,

    #[error("The tracker refused the announce: {0}")]
    TrackerFailure(String),

    #[error("The peer list returned by the announce request is not valid")]
    TrackerCompactPeerList,

    #[error("Tracker url scheme is not supported: {0}")]
    TrackerUnsupportedScheme(String),

    #[error("Error when reading magnet link")]
    MagnetLinkInvalid,

    #[error("Could not find torrent for the given info_hash")]
    TorrentDoesNotExist,

    #[error("You cannot add a duplicate torrent, only 1 is allowed")]
    NoDuplicateTorrent,

    #[error("Could not send message to Peer")]
    SendErrorPeer(#[from] mpsc::error::SendError<PeerMsg>),

    #[error("Could not send message to Torrent")]
    SendErrorTorrent(#[from] mpsc::error::SendError<TorrentMsg>),

    #[error("A blocking task panicked or was cancelled: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),
}

impl Error {
    /// Errors that are the fault of the remote peer, or of the link to it,
    /// and count towards excluding its identity.
    pub fn counts_as_peer_failure(&self) -> bool {
        matches!(
            self,
            Error::Decode(_)
                | Error::IO(_)
                | Error::HandshakeInvalid
                | Error::HandshakeTimeout
                | Error::MessageTooLarge(_)
                | Error::MessageInvalid(_)
                | Error::PeerClosedSocket
                | Error::Timeout
        )
    }
}
