//! Extensions (protocols) that act on Peers, including the core protocol.
//!
//! Every extension message is carried inside [`Core::Extended`]. The id of
//! the message is the one chosen by the receiver of the message, so outgoing
//! messages use the ids of the remote [`ExtensionTable`] and incoming
//! messages arrive with the ids of [`ExtensionKind::LOCAL_ID`].

pub mod core;
pub mod extended;
pub mod holepunch;
pub mod metadata;
pub mod pex;

pub use core::*;
pub use extended::*;
pub use holepunch::*;
pub use metadata::*;
pub use pex::*;

use std::future::Future;

use crate::{error::Error, peer::Peer};

/// The sub-protocols of the extension protocol that we speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    Metadata,
    Pex,
    Holepunch,
}

impl ExtensionKind {
    pub const ALL: [ExtensionKind; 3] =
        [ExtensionKind::Pex, ExtensionKind::Metadata, ExtensionKind::Holepunch];

    /// Name of the extension in the `m` dictionary.
    pub const fn name(self) -> &'static str {
        match self {
            ExtensionKind::Metadata => "ut_metadata",
            ExtensionKind::Pex => "ut_pex",
            ExtensionKind::Holepunch => "ut_holepunch",
        }
    }

    /// The id that remotes must use to send us messages of this extension.
    pub const fn local_id(self) -> u8 {
        match self {
            ExtensionKind::Pex => 1,
            ExtensionKind::Metadata => 2,
            ExtensionKind::Holepunch => 3,
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name().as_bytes() == name)
    }

    pub fn from_local_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.local_id() == id)
    }
}

/// Messages of an extension, usually an enum.
/// The ID const is the local peer's. The IDs of the remote peers are shared on
/// the [`Extension`] struct, under the "m" dict and they are different from
/// client to client.
pub trait ExtMsg: Sized {
    const ID: u8;

    /// Payload of the extended message, without the id.
    fn to_payload(&self) -> Result<Vec<u8>, Error>;

    fn from_payload(payload: &[u8]) -> Result<Self, Error>;
}

/// Handle the messages of an extension, or of the core protocol, on a
/// connected peer.
pub trait ExtMsgHandler<Msg> {
    fn handle_msg(
        &self,
        peer: &mut Peer,
        msg: Msg,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}
