//! Types for the Extended protocol.
//! BEP 10 <https://www.bittorrent.org/beps/bep_0010.html>

mod codec;

pub use codec::*;

use std::net::IpAddr;

use hashbrown::HashMap;

use crate::{
    bencode::{self, Dict, Value},
    error::Error,
    extensions::{ExtMsg, ExtensionKind},
};

/// Client name and version sent on the `v` key.
pub const CLIENT_VERSION: &str = concat!("Rivulet ", env!("CARGO_PKG_VERSION"));

/// This is the payload of the extension handshake, the message with id 0.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extension {
    /// Extensions supported by the sender, with the id that the sender
    /// wants to receive them with. Names that we don't know are dropped,
    /// and so are extensions disabled with the id 0.
    pub m: HashMap<ExtensionKind, u8>,
    /// a string identifying the client and the version
    pub v: Option<String>,
    /// number of outstanding requests messages this client supports
    /// without dropping any.
    pub reqq: Option<u16>,
    /// local TCP listen port
    pub p: Option<u16>,
    /// added by BEP 9, the size of the info dictionary.
    pub metadata_size: Option<u32>,
    /// the ip of the receiver as seen by the sender.
    pub yourip: Option<IpAddr>,
}

impl Extension {
    /// The extensions that we support, with our own ids.
    pub fn supported(
        metadata_size: Option<u32>,
        reqq: u16,
        port: u16,
    ) -> Self {
        Self {
            m: ExtensionKind::ALL.iter().map(|k| (*k, k.local_id())).collect(),
            v: Some(CLIENT_VERSION.to_owned()),
            reqq: Some(reqq),
            p: Some(port),
            metadata_size,
            yourip: None,
        }
    }

    pub fn yourip(mut self, ip: IpAddr) -> Self {
        self.yourip = Some(ip);
        self
    }
}

impl ExtMsg for Extension {
    /// handshake ID
    const ID: u8 = 0;

    fn to_payload(&self) -> Result<Vec<u8>, Error> {
        // keys are inserted sorted, the output is canonical bencode.
        let mut m = Dict::new();
        let mut kinds: Vec<_> = self.m.iter().collect();
        kinds.sort_by_key(|(k, _)| k.name());
        for (kind, id) in kinds {
            m.insert(kind.name(), *id);
        }

        let mut dict = Dict::new();
        dict.insert("m", m);
        if let Some(size) = self.metadata_size {
            dict.insert("metadata_size", size);
        }
        if let Some(p) = self.p {
            dict.insert("p", p);
        }
        if let Some(reqq) = self.reqq {
            dict.insert("reqq", reqq);
        }
        if let Some(v) = &self.v {
            dict.insert("v", v.as_str());
        }
        if let Some(ip) = self.yourip {
            let compact = match ip {
                IpAddr::V4(ip) => ip.octets().to_vec(),
                IpAddr::V6(ip) => ip.octets().to_vec(),
            };
            dict.insert("yourip", compact);
        }

        Ok(bencode::encode(&dict.into()))
    }

    fn from_payload(payload: &[u8]) -> Result<Self, Error> {
        let value = bencode::decode(payload)?;
        let dict = value
            .as_dict()
            .ok_or(Error::MessageInvalid("extended handshake"))?;

        let mut m = HashMap::new();
        if let Some(remote_m) = dict.get(b"m").and_then(Value::as_dict) {
            for (name, id) in remote_m.iter() {
                let Some(kind) = ExtensionKind::from_name(name) else {
                    continue;
                };
                match id.as_uint().and_then(|id| u8::try_from(id).ok()) {
                    Some(0) | None => {}
                    Some(id) => {
                        m.insert(kind, id);
                    }
                }
            }
        }

        let uint = |key: &[u8]| dict.get(key).and_then(Value::as_uint);

        let yourip = dict.get(b"yourip").and_then(Value::as_bytes).and_then(
            |b| match b.len() {
                4 => <[u8; 4]>::try_from(b).ok().map(IpAddr::from),
                16 => <[u8; 16]>::try_from(b).ok().map(IpAddr::from),
                _ => None,
            },
        );

        Ok(Self {
            m,
            v: dict.get(b"v").and_then(Value::as_str).map(str::to_owned),
            reqq: uint(b"reqq").and_then(|v| u16::try_from(v).ok()),
            p: uint(b"p").and_then(|v| u16::try_from(v).ok()),
            metadata_size: uint(b"metadata_size")
                .and_then(|v| u32::try_from(v).ok()),
            yourip,
        })
    }
}

/// The ids that a remote chose for each extension, learned from its
/// extension handshake. Each connection has its own table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionTable {
    remote: HashMap<ExtensionKind, u8>,
}

impl ExtensionTable {
    pub fn new(ext: &Extension) -> Self {
        Self { remote: ext.m.clone() }
    }

    /// A later handshake may enable, change or disable (id 0) extensions.
    pub fn update(&mut self, ext: &Extension) {
        self.remote = ext.m.clone();
    }

    /// Id to use on messages that we send to the remote.
    pub fn remote_id(&self, kind: ExtensionKind) -> Option<u8> {
        self.remote.get(&kind).copied()
    }

    /// Extension of a message that the remote sent us, the remote uses the
    /// ids that we advertised.
    pub fn local_kind(&self, id: u8) -> Option<ExtensionKind> {
        ExtensionKind::from_local_id(id)
    }

    pub fn supports(&self, kind: ExtensionKind) -> bool {
        self.remote.contains_key(&kind)
    }
}
