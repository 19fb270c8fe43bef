//! UDP tracker protocol.
//! BEP 15 <https://www.bittorrent.org/beps/bep_0015.html>

use std::{net::SocketAddr, time::Duration};

use tokio::{
    net::{lookup_host, UdpSocket},
    time::{timeout, Instant},
};
use tracing::debug;

use crate::{error::Error, utils::parse_compact_peer_list};

use super::{
    action::Action, announce, connect, AnnounceParams, AnnounceResponse,
};

/// Retransmissions of a request that got no answer, the timeout of the
/// `n`th attempt is `15 * 2 ^ n` seconds.
pub const MAX_RETRANSMITS: u32 = 3;

/// A connection id can be used for this long after it was received.
pub const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

const RETRANSMIT_BASE: Duration = Duration::from_secs(15);
const ANNOUNCE_RES_BUF_LEN: usize = 8192;

#[derive(Debug)]
pub struct UdpTracker {
    /// `host:port` of the tracker.
    host: String,
    socket: Option<UdpSocket>,
    connection: Option<(u64, Instant)>,
    retransmit_base: Duration,
}

impl UdpTracker {
    /// `url` is `udp://host:port` with an optional path that is ignored.
    pub fn new(url: &str) -> Result<Self, Error> {
        let host = url
            .strip_prefix("udp://")
            .and_then(|rest| rest.split('/').next())
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::TrackerUnsupportedScheme(url.to_owned()))?;

        Ok(Self {
            host: host.to_owned(),
            socket: None,
            connection: None,
            retransmit_base: RETRANSMIT_BASE,
        })
    }

    /// Timeout of the first attempt of each request.
    pub fn with_retransmit_base(mut self, base: Duration) -> Self {
        self.retransmit_base = base;
        self
    }

    /// Resolve the host and connect an UDP socket to the first address that
    /// accepts it.
    async fn socket(&mut self) -> Result<&UdpSocket, Error> {
        if self.socket.is_none() {
            let addrs: Vec<SocketAddr> = lookup_host(&self.host)
                .await
                .map_err(|_| Error::TrackerNoHosts)?
                .collect();

            if addrs.is_empty() {
                return Err(Error::TrackerNoHosts);
            }

            let mut connected = None;
            for addr in addrs {
                let bind = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
                let Ok(socket) = UdpSocket::bind(bind).await else { continue };
                if socket.connect(addr).await.is_ok() {
                    debug!("udp socket connected to {addr}");
                    connected = Some(socket);
                    break;
                }
            }

            self.socket = Some(connected.ok_or(Error::TrackerSocketConnect)?);
        }

        self.socket.as_ref().ok_or(Error::TrackerSocketConnect)
    }

    /// Send `req` and wait for the response, retransmitting on timeouts.
    async fn send_recv(
        &mut self,
        req: &[u8],
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let base = self.retransmit_base;
        let host = self.host.clone();
        let socket = self.socket().await?;

        for n in 0..=MAX_RETRANSMITS {
            socket.send(req).await?;

            match timeout(base * 2u32.pow(n), socket.recv(buf)).await {
                Ok(Ok(len)) => return Ok(len),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    debug!("request to {host} was lost, attempt {n}")
                }
            }
        }

        Err(Error::Timeout)
    }

    /// Before doing an `announce`, a client must perform a connect
    /// exchange, to obtain a connection_id. The id is reused while it is
    /// fresh.
    async fn connect(&mut self) -> Result<u64, Error> {
        if let Some((id, at)) = self.connection {
            if at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let req = connect::Request::new();
        let mut buf = [0u8; 64];
        let len = self.send_recv(&req.serialize()?, &mut buf).await?;
        let buf = &buf[..len];

        check_error(buf, req.transaction_id)?;
        let res = connect::Response::deserialize(buf)?;

        if res.transaction_id != req.transaction_id
            || res.action != Action::Connect as u32
        {
            debug!("response is not valid {res:?}");
            return Err(Error::TrackerResponse);
        }

        self.connection = Some((res.connection_id, Instant::now()));
        Ok(res.connection_id)
    }

    pub async fn announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse, Error> {
        let r = self.try_announce(params).await;
        if r.is_err() {
            // the id might have expired on the tracker side
            self.connection = None;
        }
        r
    }

    async fn try_announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse, Error> {
        let connection_id = self.connect().await?;
        let req = announce::Request::new(connection_id, params);

        let mut buf = vec![0u8; ANNOUNCE_RES_BUF_LEN];
        let len = self.send_recv(&req.serialize()?, &mut buf).await?;
        let buf = &buf[..len];

        check_error(buf, req.transaction_id)?;
        let (res, payload) = announce::Response::deserialize(buf)?;

        if res.transaction_id != req.transaction_id
            || res.action != Action::Announce as u32
        {
            return Err(Error::TrackerResponse);
        }

        let is_ipv6 = self
            .socket
            .as_ref()
            .and_then(|s| s.peer_addr().ok())
            .is_some_and(|addr| addr.is_ipv6());

        Ok(AnnounceResponse {
            interval: Duration::from_secs(res.interval as u64),
            min_interval: None,
            peers: parse_compact_peer_list(payload, is_ipv6)?,
            seeders: Some(res.seeders),
            leechers: Some(res.leechers),
        })
    }
}

/// An error response is the action, the transaction id and a message.
fn check_error(buf: &[u8], transaction_id: u32) -> Result<(), Error> {
    if buf.len() < 8 {
        return Err(Error::TrackerResponse);
    }
    let action = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let tid = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if action == Action::Error as u32 && tid == transaction_id {
        let msg = String::from_utf8_lossy(&buf[8..]).into_owned();
        return Err(Error::TrackerFailure(msg));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_url() {
        let t = UdpTracker::new("udp://tracker.example.org:1337/announce")
            .unwrap();
        assert_eq!(t.host, "tracker.example.org:1337");

        let t = UdpTracker::new("udp://10.0.0.1:80").unwrap();
        assert_eq!(t.host, "10.0.0.1:80");

        assert!(UdpTracker::new("udp:///announce").is_err());
        assert!(UdpTracker::new("http://a:80").is_err());
    }

    #[test]
    fn error_response() {
        let mut buf = 3u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&9u32.to_be_bytes());
        buf.extend_from_slice(b"torrent not registered");

        match check_error(&buf, 9) {
            Err(Error::TrackerFailure(msg)) => {
                assert_eq!(msg, "torrent not registered")
            }
            r => panic!("unexpected {r:?}"),
        }
        // not ours
        assert!(check_error(&buf, 10).is_ok());
        assert!(check_error(&buf[..4], 9).is_err());
    }
}
