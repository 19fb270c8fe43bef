//! A tracker is a server that manages peers and stats of multiple torrents.
pub mod action;
pub mod announce;
pub mod connect;
mod event;
mod group;
pub mod http;
pub mod udp;

pub use event::Event;
pub use group::*;

use std::{net::SocketAddr, time::Duration};

use tokio::time::Instant;

use crate::{error::Error, metainfo::InfoHash, peer::PeerId};

use self::{http::HttpTracker, udp::UdpTracker};

/// Consecutive failures after which an endpoint is reported unhealthy. It is
/// still announced to, with backoff.
pub const UNHEALTHY_AFTER: u32 = 3;

/// What we tell the tracker about ourselves.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
    pub key: u32,
    /// `None` lets the tracker decide.
    pub num_want: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
}

/// Client of one announce url.
#[derive(Debug)]
pub enum Tracker {
    Udp(UdpTracker),
    Http(HttpTracker),
}

impl Tracker {
    pub fn from_url(url: &str) -> Result<Self, Error> {
        if url.starts_with("udp://") {
            Ok(Tracker::Udp(UdpTracker::new(url)?))
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Tracker::Http(HttpTracker::new(url)?))
        } else {
            Err(Error::TrackerUnsupportedScheme(url.to_owned()))
        }
    }

    /// An announce is the communication of the local peer to the tracker, for
    /// example:
    /// - When the torrent starts, we announce with [`Event::Started`] to get
    ///   the list of peers for this torrent.
    /// - To update the tracker with the download stats.
    /// - Etc.
    pub async fn announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse, Error> {
        match self {
            Tracker::Udp(t) => t.announce(params).await,
            Tracker::Http(t) => t.announce(params).await,
        }
    }
}

/// Delay before the next announce after `failures` consecutive failures.
pub fn backoff(failures: u32, base: Duration, cap: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    // 2^31 already overflows any sane base
    let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(31));
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// An announce url and its health, mutated only by its own loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerEndpoint {
    pub url: String,
    /// Index of the `announce-list` tier, 0 for `announce` and magnets.
    pub tier: usize,
    pub failures: u32,
    pub next_announce: Option<Instant>,
    pub last_interval: Option<Duration>,
    pub last_peer_count: usize,
}

impl TrackerEndpoint {
    pub fn new(url: impl Into<String>, tier: usize) -> Self {
        Self {
            url: url.into(),
            tier,
            failures: 0,
            next_announce: None,
            last_interval: None,
            last_peer_count: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.failures < UNHEALTHY_AFTER
    }

    /// Record a successful announce, returns the delay until the next one.
    /// The interval of the tracker is floored at `min_interval`, and at the
    /// `min interval` of the tracker.
    pub fn on_success(
        &mut self,
        res: &AnnounceResponse,
        min_interval: Duration,
    ) -> Duration {
        let floor = res.min_interval.unwrap_or_default().max(min_interval);
        let delay = res.interval.max(floor);

        self.failures = 0;
        self.last_interval = Some(res.interval);
        self.last_peer_count = res.peers.len();
        self.next_announce = Some(Instant::now() + delay);
        delay
    }

    /// Record a failed announce, returns the delay until the next one.
    pub fn on_failure(&mut self, base: Duration, cap: Duration) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = backoff(self.failures, base, cap);
        self.next_announce = Some(Instant::now() + delay);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let base = Duration::from_secs(15);
        let cap = Duration::from_secs(1800);

        assert_eq!(backoff(0, base, cap), Duration::ZERO);
        assert_eq!(backoff(1, base, cap), Duration::from_secs(15));
        assert_eq!(backoff(2, base, cap), Duration::from_secs(30));
        assert_eq!(backoff(4, base, cap), Duration::from_secs(120));
        assert_eq!(backoff(8, base, cap), cap);

        for k in 0..200 {
            assert!(backoff(k, base, cap) <= cap);
        }
        assert_eq!(backoff(u32::MAX, base, cap), cap);
    }

    #[test]
    fn endpoint_health() {
        let mut endpoint = TrackerEndpoint::new("udp://t:1", 0);
        let base = Duration::from_secs(10);
        let cap = Duration::from_secs(60);

        assert!(endpoint.is_healthy());
        assert_eq!(endpoint.on_failure(base, cap), base);
        assert_eq!(endpoint.on_failure(base, cap), base * 2);
        assert!(endpoint.is_healthy());
        assert_eq!(endpoint.on_failure(base, cap), base * 4);
        assert!(!endpoint.is_healthy());
        endpoint.on_failure(base, cap);
        assert_eq!(endpoint.on_failure(base, cap), cap);

        let res = AnnounceResponse {
            interval: Duration::from_secs(30),
            min_interval: Some(Duration::from_secs(45)),
            peers: vec!["10.0.0.1:6881".parse().unwrap()],
            ..Default::default()
        };
        // floored at the min interval of the tracker
        assert_eq!(
            endpoint.on_success(&res, Duration::from_secs(20)),
            Duration::from_secs(45)
        );
        assert!(endpoint.is_healthy());
        assert_eq!(endpoint.failures, 0);
        assert_eq!(endpoint.last_peer_count, 1);

        // and at ours
        assert_eq!(
            endpoint.on_success(&res, Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn tracker_schemes() {
        assert!(matches!(
            Tracker::from_url("udp://t.example:1337/announce"),
            Ok(Tracker::Udp(_))
        ));
        assert!(matches!(
            Tracker::from_url("https://t.example/announce"),
            Ok(Tracker::Http(_))
        ));
        assert!(matches!(
            Tracker::from_url("wss://t.example"),
            Err(Error::TrackerUnsupportedScheme(_))
        ));
    }
}
