//! A library for working with the BitTorrent protocol V1.
//!
//! This is the library of rivulet, it has the peer wire protocol, the
//! extension protocol with ut_metadata, ut_pex and ut_holepunch, the HTTP
//! and UDP trackers, and the piece bookkeeping that ties them together.
//!
//! # Example
//!
//! This is how you can download a torrent, the [daemon] owns every torrent
//! and accepts peers for them.
//!
//! ```no_run
//! use rivulet::{
//!     config::Config,
//!     daemon::{Daemon, TorrentSource},
//!     disk::StorageTarget,
//! };
//!
//! # async fn run() -> Result<(), rivulet::error::Error> {
//! let config = Config::load(Config::default())?;
//! let dir = config.download_dir.clone();
//! let daemon = Daemon::new(config);
//! daemon.listen().await?;
//!
//! let source = TorrentSource::parse("magnet:?xt=urn:btih:...")?;
//! let info_hash =
//!     daemon.submit(source, StorageTarget::Directory(dir), None).await?;
//! daemon.start(&info_hash).await?;
//!
//! daemon.session(&info_hash).await?.wait_complete().await?;
//! # Ok(())
//! # }
//! ```

pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod counter;
pub mod daemon;
pub mod disk;
pub mod error;
pub mod extensions;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod pieces;
pub mod torrent;
pub mod tracker;
pub mod utils;
