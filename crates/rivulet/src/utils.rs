//! Utility functions
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::BufMut;

use crate::error::Error;

/// transform bytes into a human readable format.
pub fn to_human_readable(n: u64) -> String {
    let mut n = n as f64;

    let units = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    let delimiter = 1000_f64;

    if n < delimiter {
        return format!("{} {}", n, "B");
    }

    let mut u: i32 = 0;
    let r = 10_f64;

    while (n * r).round() / r >= delimiter && u < (units.len() as i32) - 1 {
        n /= delimiter;
        u += 1;
    }

    format!("{:.2} {}", n, units[u as usize])
}

/// Parse a list of peers in the compact format, used by trackers and PEX.
///
/// In ipv4 the addresses come in packets of 6 bytes, first 4 for ip and 2
/// for port, in ipv6 it's 16 bytes for the ip and 2 for the port.
pub fn parse_compact_peer_list(
    buf: &[u8],
    is_ipv6: bool,
) -> Result<Vec<SocketAddr>, Error> {
    let stride = if is_ipv6 { 18 } else { 6 };

    let chunks = buf.chunks_exact(stride);
    if !chunks.remainder().is_empty() {
        return Err(Error::TrackerCompactPeerList);
    }

    let peers = chunks
        .map(|hostport| {
            let (ip, port) = hostport.split_at(stride - 2);
            let ip = if is_ipv6 {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(ip);
                IpAddr::from(Ipv6Addr::from(octets))
            } else {
                IpAddr::from(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]))
            };
            let port = u16::from_be_bytes([port[0], port[1]]);
            SocketAddr::new(ip, port)
        })
        .collect();

    Ok(peers)
}

/// Write an address in the compact format, the caller must split ipv4 and
/// ipv6 addresses in different buffers.
pub fn put_compact_addr(buf: &mut impl BufMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => buf.put_slice(&ip.octets()),
        IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
    }
    buf.put_u16(addr.port());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn readable_size() {
        let n = 483_740;
        assert_eq!(to_human_readable(n), "483.74 KB");

        let n = 28_780_000;
        assert_eq!(to_human_readable(n), "28.78 MB");

        let n = 1_950_000_000;
        assert_eq!(to_human_readable(n), "1.95 GB");

        assert_eq!(to_human_readable(512), "512 B");
    }

    #[test]
    fn compact_peer_list() {
        let buf = [127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0, 80];
        let peers = parse_compact_peer_list(&buf, false).unwrap();
        assert_eq!(
            peers,
            [
                "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:80".parse().unwrap()
            ]
        );

        let mut out = Vec::new();
        for peer in &peers {
            put_compact_addr(&mut out, peer);
        }
        assert_eq!(out, buf);

        assert!(matches!(
            parse_compact_peer_list(&buf[..7], false),
            Err(Error::TrackerCompactPeerList)
        ));
    }

    #[test]
    fn compact_peer_list_v6() {
        let addr: SocketAddr = "[2001:db8::1]:51413".parse().unwrap();
        let mut buf = Vec::new();
        put_compact_addr(&mut buf, &addr);
        assert_eq!(buf.len(), 18);
        assert_eq!(parse_compact_peer_list(&buf, true).unwrap(), [addr]);
    }
}
