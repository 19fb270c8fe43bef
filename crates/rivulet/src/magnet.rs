//! Handle magnet link
use std::ops::Deref;

use magnet_url::Magnet as Magnet_;

use crate::{error::Error, metainfo::InfoHash};

#[derive(Debug, Clone)]
pub struct Magnet {
    inner: Magnet_,
    info_hash: InfoHash,
    length: Option<u64>,
}

impl Deref for Magnet {
    type Target = Magnet_;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Magnet {
    /// Parse a magnet link, only BitTorrent v1 links with a 40 char hex
    /// info hash are accepted.
    pub fn new(magnet_url: &str) -> Result<Self, Error> {
        let inner =
            Magnet_::new(magnet_url).map_err(|_| Error::MagnetLinkInvalid)?;

        let query = magnet_url
            .strip_prefix("magnet:?")
            .ok_or(Error::MagnetLinkInvalid)?;

        let mut info_hash = None;
        let mut length = None;

        for (k, v) in query.split('&').filter_map(|kv| kv.split_once('=')) {
            match k {
                "xt" => {
                    if let Some(hash) = v.strip_prefix("urn:btih:") {
                        info_hash = InfoHash::from_hex(hash);
                    }
                }
                "xl" => length = v.parse().ok(),
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or(Error::MagnetLinkInvalid)?;

        Ok(Self { inner, info_hash, length })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash.clone()
    }

    /// The name will come URL encoded, and it is also optional.
    pub fn display_name(&self) -> String {
        if let Some(dn) = self.inner.display_name() {
            if let Ok(dn) = urlencoding::decode(dn) {
                return dn.replace('+', " ");
            }
        }
        "Unknown".to_owned()
    }

    /// Tracker urls of the `tr` parameters, url-decoded.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for tr in self.inner.trackers() {
            let Ok(url) = urlencoding::decode(tr) else { continue };
            let url = url.into_owned();
            if !url.is_empty() && !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }

    /// Exact length of the content, in bytes, if the link has `xl`.
    pub fn length(&self) -> Option<u64> {
        self.length
    }
}
