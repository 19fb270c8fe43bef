use speedy::{BigEndian, Readable, Writable};

use crate::{error::Error, metainfo::InfoHash, peer::PeerId};

use super::{action::Action, AnnounceParams};

#[derive(Debug, PartialEq, Readable, Writable)]
pub struct Request {
    pub connection_id: u64,
    pub action: u32,
    pub transaction_id: u32,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: u32,
    /// 0 means the address of the sender.
    pub ip_address: u32,
    pub key: u32,
    /// -1 means the default of the tracker.
    pub num_want: i32,
    pub port: u16,
}

impl Request {
    pub(crate) const LENGTH: usize = 98;

    pub fn new(connection_id: u64, params: &AnnounceParams) -> Self {
        Self {
            connection_id,
            action: Action::Announce as u32,
            transaction_id: rand::random(),
            info_hash: params.info_hash.clone(),
            peer_id: params.peer_id,
            downloaded: params.downloaded,
            left: params.left,
            uploaded: params.uploaded,
            event: params.event as u32,
            ip_address: 0,
            key: params.key,
            num_want: params.num_want.map(|n| n as i32).unwrap_or(-1),
            port: params.port,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec_with_ctx(BigEndian {})?)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::LENGTH {
            return Err(Error::TrackerResponse);
        }
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::LENGTH])?)
    }
}

#[derive(Debug, PartialEq, Writable, Readable)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    // followed by the compact peers
}

impl Response {
    pub(crate) const MIN_LEN: usize = 20;

    /// The response and the compact peer list that follows it.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        if buf.len() < Response::MIN_LEN {
            return Err(Error::TrackerResponse);
        }

        let res = Self::read_from_buffer_with_ctx(
            BigEndian {},
            &buf[..Self::MIN_LEN],
        )?;

        Ok((res, &buf[Self::MIN_LEN..]))
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec_with_ctx(BigEndian {})?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Event;

    #[test]
    fn announce_request() {
        let params = AnnounceParams {
            info_hash: InfoHash([1u8; 20]),
            peer_id: PeerId([2u8; 20]),
            port: 6881,
            uploaded: 10,
            downloaded: 20,
            left: 30,
            event: Event::Started,
            key: 0xabcd,
            num_want: Some(50),
        };
        let req = Request::new(99, &params);
        let buf = req.serialize().unwrap();

        assert_eq!(buf.len(), Request::LENGTH);
        assert_eq!(&buf[..8], &99u64.to_be_bytes());
        assert_eq!(&buf[8..12], &1u32.to_be_bytes());
        assert_eq!(&buf[16..36], &[1u8; 20]);
        assert_eq!(&buf[36..56], &[2u8; 20]);
        // event
        assert_eq!(&buf[80..84], &2u32.to_be_bytes());
        assert_eq!(&buf[92..96], &50i32.to_be_bytes());
        assert_eq!(&buf[96..98], &6881u16.to_be_bytes());

        assert_eq!(Request::deserialize(&buf).unwrap(), req);
    }

    #[test]
    fn announce_response() {
        let res = Response {
            action: 1,
            transaction_id: 3,
            interval: 1800,
            leechers: 4,
            seeders: 5,
        };
        let mut buf = res.serialize().unwrap();
        buf.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);

        let (decoded, peers) = Response::deserialize(&buf).unwrap();
        assert_eq!(decoded, res);
        assert_eq!(peers, &[127, 0, 0, 1, 0x1a, 0xe1]);

        assert!(Response::deserialize(&buf[..19]).is_err());
    }
}
