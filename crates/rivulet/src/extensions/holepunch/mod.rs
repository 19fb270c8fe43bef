//! Types for the Holepunch protocol, a peer behind a NAT asks a relay peer
//! to introduce it to a target peer.
//!
//! <https://www.bittorrent.org/beps/bep_0055.html>
//!
//! 1. The initiating peer sends a rendezvous message to the relaying peer,
//!    containing the endpoint of the target peer.
//! 2. If the relaying peer is connected to the target peer, and the target
//!    peer supports this extension, the relaying peer sends a connect message
//!    to both the initiating peer and the target peer, each containing the
//!    endpoint of the other.
//! 3. Upon receiving the connect message, each peer connects to the other.

mod codec;

pub use codec::*;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use crate::{
    error::Error,
    extensions::{ExtMsg, ExtensionKind},
};

#[repr(u8)]
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum HolepunchMsgType {
    /// Send connect messages to both the initiating peer and target peer
    Rendezvous = 0,

    /// Initiate a connection to designated endpoint
    Connect = 1,

    /// Rendezvous operation cannot be completed
    Error = 2,
}

impl TryFrom<u8> for HolepunchMsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        use HolepunchMsgType::*;
        match value {
            v if v == Rendezvous as u8 => Ok(Rendezvous),
            v if v == Connect as u8 => Ok(Connect),
            v if v == Error as u8 => Ok(Error),
            _ => Err(crate::error::Error::MessageInvalid("holepunch msg_type")),
        }
    }
}

#[repr(u32)]
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum HolepunchErrorCodes {
    /// No error
    NoError = 0,

    /// The target endpoint is invalid.
    NoSuchPeer = 1,

    /// The relaying peer is not connected to the target peer.
    NotConnected = 2,

    /// The target peer does not support the holepunch extension.
    NoSupport = 3,

    /// The target endpoint belongs to the relaying peer.
    NoSelf = 4,
}

impl TryFrom<u32> for HolepunchErrorCodes {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Error> {
        use HolepunchErrorCodes::*;
        Ok(match value {
            0 => NoError,
            1 => NoSuchPeer,
            2 => NotConnected,
            3 => NoSupport,
            4 => NoSelf,
            _ => return Err(Error::MessageInvalid("holepunch err_code")),
        })
    }
}

const ADDR_TYPE_IPV4: u8 = 0;
const ADDR_TYPE_IPV6: u8 = 1;

/// <msg_type u8><addr_type u8><addr 4 or 16><port u16><err_code u32>
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct HolepunchMsg {
    pub msg_type: HolepunchMsgType,
    pub addr: SocketAddr,
    /// 0 if non error messages.
    pub err_code: HolepunchErrorCodes,
}

impl HolepunchMsg {
    /// The initiating peer sends a rendezvous message to the relaying peer,
    /// containing the endpoint (IP address and port) of the target peer
    pub fn rendezvous(addr: SocketAddr) -> Self {
        Self {
            msg_type: HolepunchMsgType::Rendezvous,
            addr,
            err_code: HolepunchErrorCodes::NoError,
        }
    }

    pub fn connect(addr: SocketAddr) -> Self {
        Self {
            msg_type: HolepunchMsgType::Connect,
            addr,
            err_code: HolepunchErrorCodes::NoError,
        }
    }

    /// Error answer to a rendezvous, with the endpoint of the rendezvous.
    pub fn error(addr: SocketAddr, err_code: HolepunchErrorCodes) -> Self {
        Self { msg_type: HolepunchMsgType::Error, addr, err_code }
    }
}

impl ExtMsg for HolepunchMsg {
    const ID: u8 = ExtensionKind::Holepunch.local_id();

    fn to_payload(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(24);
        buf.put_u8(self.msg_type as u8);
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(ADDR_TYPE_IPV4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(ADDR_TYPE_IPV6);
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_u16(self.addr.port());
        buf.put_u32(self.err_code as u32);
        Ok(buf)
    }

    fn from_payload(mut payload: &[u8]) -> Result<Self, Error> {
        if payload.remaining() < 2 {
            return Err(Error::MessageInvalid("holepunch too short"));
        }

        let msg_type = HolepunchMsgType::try_from(payload.get_u8())?;
        let addr_type = payload.get_u8();

        let ip_len = match addr_type {
            ADDR_TYPE_IPV4 => 4,
            ADDR_TYPE_IPV6 => 16,
            _ => return Err(Error::MessageInvalid("holepunch addr_type")),
        };

        if payload.remaining() < ip_len + 6 {
            return Err(Error::MessageInvalid("holepunch too short"));
        }

        let ip = if addr_type == ADDR_TYPE_IPV4 {
            IpAddr::V4(Ipv4Addr::from(payload.get_u32()))
        } else {
            IpAddr::V6(Ipv6Addr::from(payload.get_u128()))
        };
        let port = payload.get_u16();
        let err_code = HolepunchErrorCodes::try_from(payload.get_u32())?;

        Ok(Self { msg_type, addr: SocketAddr::new(ip, port), err_code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_v4() {
        let msg = HolepunchMsg::rendezvous("10.1.2.3:6881".parse().unwrap());
        let payload = msg.to_payload().unwrap();
        assert_eq!(payload, [0, 0, 10, 1, 2, 3, 0x1A, 0xE1, 0, 0, 0, 0]);
        assert_eq!(HolepunchMsg::from_payload(&payload).unwrap(), msg);
    }

    #[test]
    fn error_v6() {
        let msg = HolepunchMsg::error(
            "[2001:db8::7]:51413".parse().unwrap(),
            HolepunchErrorCodes::NoSupport,
        );
        let payload = msg.to_payload().unwrap();
        assert_eq!(payload.len(), 1 + 1 + 16 + 2 + 4);
        assert_eq!(payload[0], 2);
        assert_eq!(payload[1], 1);
        assert_eq!(&payload[payload.len() - 4..], &[0, 0, 0, 3]);
        assert_eq!(HolepunchMsg::from_payload(&payload).unwrap(), msg);
    }

    #[test]
    fn malformed() {
        assert!(HolepunchMsg::from_payload(&[1]).is_err());
        // unknown msg_type
        assert!(HolepunchMsg::from_payload(&[9, 0, 1, 2, 3, 4, 0, 1, 0, 0, 0, 0])
            .is_err());
        // unknown addr_type
        assert!(HolepunchMsg::from_payload(&[1, 5, 1, 2, 3, 4, 0, 1, 0, 0, 0, 0])
            .is_err());
        // truncated ipv6
        assert!(HolepunchMsg::from_payload(&[1, 1, 1, 2, 3, 4, 0, 1, 0, 0, 0, 0])
            .is_err());
        // unknown err_code
        assert!(HolepunchMsg::from_payload(&[2, 0, 1, 2, 3, 4, 0, 1, 0, 0, 0, 9])
            .is_err());
    }
}
