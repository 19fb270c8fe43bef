//! HTTP tracker protocol.
//! BEP 3 <https://www.bittorrent.org/beps/bep_0003.html>
//! BEP 23 <https://www.bittorrent.org/beps/bep_0023.html>

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    bencode::{self, Value},
    error::Error,
    utils::parse_compact_peer_list,
};

use super::{AnnounceParams, AnnounceResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpTracker {
    url: String,
    client: reqwest::Client,
    /// Sent back on the next announces if the tracker gave us one.
    tracker_id: Option<String>,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(crate::extensions::CLIENT_VERSION)
            .build()?;

        Ok(Self { url: url.to_owned(), client, tracker_id: None })
    }

    /// Url of an announce, the info hash and peer id are raw bytes that
    /// are percent encoded.
    pub fn announce_url(&self, params: &AnnounceParams) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };

        let mut url = format!(
            "{}{sep}info_hash={}&peer_id={}&port={}&uploaded={}\
             &downloaded={}&left={}&compact=1&key={:08x}",
            self.url,
            urlencoding::encode_binary(&params.info_hash.0),
            urlencoding::encode_binary(&params.peer_id.0),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
            params.key,
        );

        if let Some(event) = params.event.as_str() {
            url.push_str("&event=");
            url.push_str(event);
        }
        if let Some(num_want) = params.num_want {
            url.push_str(&format!("&numwant={num_want}"));
        }
        if let Some(id) = &self.tracker_id {
            url.push_str("&trackerid=");
            url.push_str(&urlencoding::encode(id));
        }

        url
    }

    pub async fn announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse, Error> {
        let url = self.announce_url(params);
        debug!("GET {url}");

        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let value = bencode::decode(&body)?;
        if let Some(id) = value.get(b"tracker id").and_then(Value::as_str) {
            self.tracker_id = Some(id.to_owned());
        }

        parse_response(&value)
    }
}

/// Parse the bencoded body of an announce response.
pub fn parse_response(value: &Value) -> Result<AnnounceResponse, Error> {
    let dict = value.as_dict().ok_or(Error::TrackerResponse)?;

    if let Some(reason) = dict.get(b"failure reason") {
        let reason = reason.as_str().unwrap_or("unknown").to_owned();
        return Err(Error::TrackerFailure(reason));
    }

    if let Some(warning) = dict.get(b"warning message").and_then(Value::as_str)
    {
        warn!("tracker warning: {warning}");
    }

    let interval = dict
        .get(b"interval")
        .and_then(Value::as_uint)
        .ok_or(Error::TrackerResponse)?;

    let min_interval = dict
        .get(b"min interval")
        .and_then(Value::as_uint)
        .map(Duration::from_secs);

    let mut peers = match dict.get(b"peers") {
        Some(Value::Bytes(compact)) => parse_compact_peer_list(compact, false)?,
        Some(Value::List(list)) => list.iter().filter_map(dict_peer).collect(),
        Some(_) => return Err(Error::TrackerResponse),
        None => Vec::new(),
    };

    if let Some(compact) = dict.get(b"peers6").and_then(Value::as_bytes) {
        peers.extend(parse_compact_peer_list(compact, true)?);
    }

    let count = |key: &[u8]| {
        dict.get(key)
            .and_then(Value::as_uint)
            .and_then(|v| u32::try_from(v).ok())
    };

    Ok(AnnounceResponse {
        interval: Duration::from_secs(interval),
        min_interval,
        peers,
        seeders: count(b"complete"),
        leechers: count(b"incomplete"),
    })
}

/// A peer of the non compact format: a dict with `peer id`, `ip` and `port`.
fn dict_peer(value: &Value) -> Option<SocketAddr> {
    let ip: IpAddr = value.get(b"ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(value.get(b"port")?.as_uint()?).ok()?;
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metainfo::InfoHash, peer::PeerId, tracker::Event};

    fn decode(buf: &[u8]) -> Value {
        bencode::decode(buf).unwrap()
    }

    #[test]
    fn compact_response() {
        let mut body = b"d8:completei3e10:incompletei7e8:intervali900e\
            12:min intervali60e5:peers12:"
            .to_vec();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);
        body.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0xe2]);
        body.extend_from_slice(b"6:peers618:");
        body.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        body.extend_from_slice(&[0x1a, 0xe1]);
        body.push(b'e');

        let res = parse_response(&decode(&body)).unwrap();
        assert_eq!(res.interval, Duration::from_secs(900));
        assert_eq!(res.min_interval, Some(Duration::from_secs(60)));
        assert_eq!(res.seeders, Some(3));
        assert_eq!(res.leechers, Some(7));
        assert_eq!(
            res.peers,
            [
                "10.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:6882".parse().unwrap(),
                "[::1]:6881".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn dict_peers() {
        let body = b"d8:intervali1800e5:peersld2:ip8:10.0.0.17:peer id\
            20:aaaaaaaaaaaaaaaaaaaa4:porti6881eed2:ip7:bad.ip!4:porti1eeee";
        let res = parse_response(&decode(body)).unwrap();
        assert_eq!(res.peers, ["10.0.0.1:6881".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn failure_and_malformed() {
        let body = b"d14:failure reason17:torrent not founde";
        match parse_response(&decode(body)) {
            Err(Error::TrackerFailure(r)) => assert_eq!(r, "torrent not found"),
            r => panic!("unexpected {r:?}"),
        }

        // no interval
        assert!(parse_response(&decode(b"d5:peers0:e")).is_err());
        // compact list with a partial peer
        assert!(matches!(
            parse_response(&decode(b"d8:intervali1e5:peers5:aaaaae")),
            Err(Error::TrackerCompactPeerList)
        ));
        assert!(parse_response(&decode(b"le")).is_err());
    }

    #[test]
    fn announce_url() {
        let tracker = HttpTracker::new("http://t.example/announce").unwrap();
        let params = AnnounceParams {
            info_hash: InfoHash([0x12; 20]),
            peer_id: PeerId(*b"-RV0100-abcdefghijkl"),
            port: 51413,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event: Event::Started,
            key: 0xff,
            num_want: Some(50),
        };
        let url = tracker.announce_url(&params);
        assert!(url.starts_with(
            "http://t.example/announce?info_hash=%12%12%12%12%12%12"
        ));
        assert!(url.contains("&peer_id=-RV0100-abcdefghijkl&port=51413"));
        assert!(url.contains("&uploaded=1&downloaded=2&left=3&compact=1"));
        assert!(url.contains("&key=000000ff&event=started&numwant=50"));

        let params = AnnounceParams { event: Event::None, ..params };
        assert!(!tracker.announce_url(&params).contains("event="));

        let tracker = HttpTracker::new("http://t.example/a?passkey=x").unwrap();
        assert!(tracker
            .announce_url(&params)
            .starts_with("http://t.example/a?passkey=x&info_hash="));
    }
}
