use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    peer::PeerSource,
    torrent::{Completion, TorrentCtx, TorrentMsg},
};

use super::{Event, Tracker, TrackerEndpoint};

/// The stopped announce is best effort.
const STOPPED_TIMEOUT: Duration = Duration::from_secs(5);

/// Every announce url of a torrent, each one announced by its own task.
#[derive(Debug, Clone, Default)]
pub struct TrackerGroup {
    endpoints: Vec<TrackerEndpoint>,
}

impl TrackerGroup {
    /// One endpoint per unique url, `urls` are `(url, tier)`.
    pub fn new(urls: impl IntoIterator<Item = (String, usize)>) -> Self {
        let mut endpoints: Vec<TrackerEndpoint> = Vec::new();
        for (url, tier) in urls {
            let url = url.trim();
            if url.is_empty() || endpoints.iter().any(|e| e.url == url) {
                continue;
            }
            endpoints.push(TrackerEndpoint::new(url, tier));
        }
        endpoints.sort_by_key(|e| e.tier);
        Self { endpoints }
    }

    pub fn endpoints(&self) -> &[TrackerEndpoint] {
        &self.endpoints
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Spawn the loop of each endpoint. The loops end, after announcing
    /// `stopped`, when the torrent is cancelled.
    pub fn spawn(&self, torrent_ctx: Arc<TorrentCtx>) -> Vec<JoinHandle<()>> {
        self.endpoints
            .iter()
            .cloned()
            .map(|endpoint| {
                tokio::spawn(announce_loop(endpoint, torrent_ctx.clone()))
            })
            .collect()
    }
}

#[tracing::instrument(name = "tracker", skip_all, fields(url = %endpoint.url))]
async fn announce_loop(
    mut endpoint: TrackerEndpoint,
    torrent_ctx: Arc<TorrentCtx>,
) {
    let mut tracker = match Tracker::from_url(&endpoint.url) {
        Ok(tracker) => tracker,
        Err(e) => {
            warn!("{e}");
            return;
        }
    };

    let config = torrent_ctx.config.clone();
    let cancel = torrent_ctx.cancel.clone();
    let mut completion = torrent_ctx.completion.subscribe();

    // a torrent that starts complete is seeding, completed is never sent
    let mut completed_sent = *completion.borrow() == Completion::Complete;
    let mut completion_open = true;
    let mut announced = false;
    let mut event = Event::Started;

    'announce: loop {
        let params = torrent_ctx.announce_params(event);

        let r = select! {
            _ = cancel.cancelled() => break 'announce,
            r = tracker.announce(&params) => r,
        };

        let delay = match r {
            Ok(res) => {
                info!(
                    "announced {event}: {} peers, interval {:?}",
                    res.peers.len(),
                    res.interval
                );
                let delay =
                    endpoint.on_success(&res, config.min_announce_interval);

                if event == Event::Completed {
                    completed_sent = true;
                }
                announced = true;
                event = Event::None;

                // completed while the started announce was failing
                if !completed_sent
                    && *completion.borrow() == Completion::Complete
                {
                    event = Event::Completed;
                }

                // the torrent stops reading its channel once cancelled
                let msg = TorrentMsg::AddPeers(res.peers, PeerSource::Tracker);
                select! {
                    _ = cancel.cancelled() => break 'announce,
                    r = torrent_ctx.tx.send(msg) => {
                        if r.is_err() {
                            break 'announce;
                        }
                    }
                }
                delay
            }
            Err(e) => {
                let (base, cap) = (config.backoff_base, config.backoff_cap);
                let delay = endpoint.on_failure(base, cap);
                warn!(
                    "announce failed {} times, healthy: {}, retry in {delay:?}: \
                     {e}",
                    endpoint.failures,
                    endpoint.is_healthy(),
                );
                delay
            }
        };

        let wait = sleep(delay);
        tokio::pin!(wait);

        loop {
            select! {
                _ = cancel.cancelled() => break 'announce,
                _ = &mut wait => break,
                changed = completion.changed(), if completion_open && !completed_sent => {
                    match changed {
                        Ok(()) => {
                            let complete = *completion.borrow_and_update()
                                == Completion::Complete;
                            if complete && announced {
                                event = Event::Completed;
                                break;
                            }
                        }
                        Err(_) => completion_open = false,
                    }
                }
            }
        }
    }

    if announced {
        let params = torrent_ctx.announce_params(Event::Stopped);
        match timeout(STOPPED_TIMEOUT, tracker.announce(&params)).await {
            Ok(Ok(_)) => debug!("announced stopped"),
            Ok(Err(e)) => debug!("stopped announce failed: {e}"),
            Err(_) => debug!("stopped announce timed out"),
        }
    }
}
