//! Types for the Peer Exchange protocol, peers share the addresses of the
//! peers they are connected to.
//!
//! <https://www.bittorrent.org/beps/bep_0011.html>

mod codec;

pub use codec::*;

use std::{net::SocketAddr, time::Duration};

use hashbrown::HashSet;

use crate::{
    bencode::{self, Dict, Value},
    error::Error,
    extensions::{ExtMsg, ExtensionKind},
    utils::{parse_compact_peer_list, put_compact_addr},
};

/// A connection sends at most one PEX message in this interval.
pub const PEX_INTERVAL: Duration = Duration::from_secs(60);

/// Max number of added peers in one message.
pub const MAX_PEX_ADDED: usize = 50;

/// Flags of an added peer, one byte per peer in `added.f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PexFlags(pub u8);

impl PexFlags {
    pub const ENCRYPTION: u8 = 0x01;
    pub const SEED: u8 = 0x02;
    pub const UTP: u8 = 0x04;
    pub const HOLEPUNCH: u8 = 0x08;
    /// The peer accepts incoming connections.
    pub const CONNECTABLE: u8 = 0x10;

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn with(self, flag: u8, on: bool) -> Self {
        if on {
            Self(self.0 | flag)
        } else {
            Self(self.0 & !flag)
        }
    }
}

/// Message of the PEX protocol, both address families in the same list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMsg {
    pub added: Vec<(SocketAddr, PexFlags)>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMsg {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }
}

impl ExtMsg for PexMsg {
    const ID: u8 = ExtensionKind::Pex.local_id();

    fn to_payload(&self) -> Result<Vec<u8>, Error> {
        let mut added = Vec::new();
        let mut added_f = Vec::new();
        let mut added6 = Vec::new();
        let mut added6_f = Vec::new();
        let mut dropped = Vec::new();
        let mut dropped6 = Vec::new();

        for (addr, flags) in &self.added {
            if addr.is_ipv4() {
                put_compact_addr(&mut added, addr);
                added_f.push(flags.0);
            } else {
                put_compact_addr(&mut added6, addr);
                added6_f.push(flags.0);
            }
        }

        for addr in &self.dropped {
            if addr.is_ipv4() {
                put_compact_addr(&mut dropped, addr);
            } else {
                put_compact_addr(&mut dropped6, addr);
            }
        }

        let mut dict = Dict::new();
        dict.insert("added", added);
        dict.insert("added.f", added_f);
        dict.insert("added6", added6);
        dict.insert("added6.f", added6_f);
        dict.insert("dropped", dropped);
        dict.insert("dropped6", dropped6);

        Ok(bencode::encode(&dict.into()))
    }

    fn from_payload(payload: &[u8]) -> Result<Self, Error> {
        let value = bencode::decode(payload)?;
        if value.as_dict().is_none() {
            return Err(Error::MessageInvalid("ut_pex"));
        }

        let bytes = |key: &[u8]| {
            value.get(key).and_then(Value::as_bytes).unwrap_or_default()
        };

        let compact = |key: &[u8], is_ipv6: bool| {
            parse_compact_peer_list(bytes(key), is_ipv6)
                .map_err(|_| Error::MessageInvalid("ut_pex compact list"))
        };

        let families = [
            (compact(b"added", false)?, bytes(b"added.f")),
            (compact(b"added6", true)?, bytes(b"added6.f")),
        ];

        let mut added = Vec::new();
        for (list, flags) in families {
            added.extend(list.into_iter().enumerate().map(|(i, addr)| {
                (addr, PexFlags(flags.get(i).copied().unwrap_or_default()))
            }));
        }

        let mut dropped = compact(b"dropped", false)?;
        dropped.extend(compact(b"dropped6", true)?);

        Ok(Self { added, dropped })
    }
}

/// What was advertised to one remote, so that the next message is a delta.
#[derive(Debug, Clone, Default)]
pub struct PexState {
    sent: HashSet<SocketAddr>,
}

impl PexState {
    /// Message with the peers of `connected` that the remote was not told
    /// about, and the advertised peers that are gone. `None` if nothing
    /// changed.
    pub fn delta(
        &mut self,
        connected: &[(SocketAddr, PexFlags)],
    ) -> Option<PexMsg> {
        let current: HashSet<SocketAddr> =
            connected.iter().map(|(addr, _)| *addr).collect();

        let dropped: Vec<SocketAddr> = self
            .sent
            .iter()
            .filter(|a| !current.contains(*a))
            .copied()
            .collect();

        for addr in &dropped {
            self.sent.remove(addr);
        }

        let added: Vec<(SocketAddr, PexFlags)> = connected
            .iter()
            .filter(|(addr, _)| !self.sent.contains(addr))
            .take(MAX_PEX_ADDED)
            .copied()
            .collect();

        self.sent.extend(added.iter().map(|(addr, _)| *addr));

        let msg = PexMsg { added, dropped };
        (!msg.is_empty()).then_some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn flags() {
        let flags = PexFlags::default()
            .with(PexFlags::SEED, true)
            .with(PexFlags::CONNECTABLE, true);
        assert_eq!(flags.0, 0x12);
        assert!(flags.contains(PexFlags::SEED));
        assert!(!flags.contains(PexFlags::UTP));
        assert_eq!(flags.with(PexFlags::SEED, false).0, 0x10);
    }

    #[test]
    fn pex_msg() {
        let msg = PexMsg {
            added: vec![
                (addr("192.168.1.1:6881"), PexFlags(PexFlags::ENCRYPTION)),
                (addr("[::1]:51413"), PexFlags(PexFlags::HOLEPUNCH)),
                (addr("10.0.0.1:51413"), PexFlags(PexFlags::SEED)),
            ],
            dropped: vec![addr("10.0.0.9:80")],
        };

        let payload = msg.to_payload().unwrap();
        assert!(payload.starts_with(b"d5:added12:"));

        let decoded = PexMsg::from_payload(&payload).unwrap();
        // ipv4 peers come first
        assert_eq!(
            decoded.added,
            [
                (addr("192.168.1.1:6881"), PexFlags(PexFlags::ENCRYPTION)),
                (addr("10.0.0.1:51413"), PexFlags(PexFlags::SEED)),
                (addr("[::1]:51413"), PexFlags(PexFlags::HOLEPUNCH)),
            ]
        );
        assert_eq!(decoded.dropped, [addr("10.0.0.9:80")]);
    }

    #[test]
    fn missing_keys_and_flags() {
        let mut payload = b"d5:added6:".to_vec();
        payload.extend_from_slice(&[1, 2, 3, 4, 0, 80]);
        payload.push(b'e');

        let msg = PexMsg::from_payload(&payload).unwrap();
        assert_eq!(msg.added, [(addr("1.2.3.4:80"), PexFlags(0))]);
        assert!(msg.dropped.is_empty());

        assert!(PexMsg::from_payload(b"d5:added5:12345e").is_err());
        assert!(PexMsg::from_payload(b"le").is_err());
    }

    #[test]
    fn delta() {
        let mut state = PexState::default();
        let a = (addr("1.1.1.1:1"), PexFlags::default());
        let b = (addr("2.2.2.2:2"), PexFlags::default());
        let c = (addr("3.3.3.3:3"), PexFlags::default());

        let msg = state.delta(&[a, b]).unwrap();
        assert_eq!(msg.added, [a, b]);
        assert!(msg.dropped.is_empty());

        assert!(state.delta(&[a, b]).is_none());

        let msg = state.delta(&[b, c]).unwrap();
        assert_eq!(msg.added, [c]);
        assert_eq!(msg.dropped, [a.0]);
    }

    #[test]
    fn delta_is_capped() {
        let mut state = PexState::default();
        let peers: Vec<_> = (0..80u16)
            .map(|p| (SocketAddr::from(([10, 0, 0, 1], p + 1)), PexFlags(0)))
            .collect();

        assert_eq!(state.delta(&peers).unwrap().added.len(), MAX_PEX_ADDED);
        assert_eq!(state.delta(&peers).unwrap().added.len(), 30);
        assert!(state.delta(&peers).is_none());
    }
}
