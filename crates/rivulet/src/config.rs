//! Configuration file and CLI flags.
//!
//! We have 2 components for the configuration, in order of priority :
//!
//! CLI Flags --overrides--> File
use std::{path::PathBuf, time::Duration};

use clap::Args;
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::Error, pieces::PieceStrategy};

/// Every field is optional, missing fields take the value of the next
/// layer, or the default.
#[derive(Args, Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Dir to write torrent files
    #[arg(short, long)]
    pub download_dir: Option<PathBuf>,

    /// Port that the client listens for and announces to peers
    #[arg(short = 'p', long = "port")]
    pub local_peer_port: Option<u16>,

    /// Max peers connected in each torrent
    #[arg(long)]
    pub max_torrent_peers: Option<u32>,

    /// Failures after which a peer is never dialed again
    #[arg(long)]
    pub max_peer_failures: Option<u32>,

    /// Seconds to wait for the handshake of a peer
    #[arg(long)]
    pub handshake_timeout_secs: Option<u64>,

    /// Seconds to wait for a TCP connection to a peer
    #[arg(long)]
    pub connect_timeout_secs: Option<u64>,

    /// Seconds before a peer that failed or closed is dialed again
    #[arg(long)]
    pub reconnect_after_secs: Option<u64>,

    /// Floor of the announce interval that trackers give us
    #[arg(long)]
    pub min_announce_interval_secs: Option<u64>,

    /// Backoff of a tracker after the first failed announce
    #[arg(long)]
    pub backoff_base_secs: Option<u64>,

    /// Max backoff of a failing tracker
    #[arg(long)]
    pub backoff_cap_secs: Option<u64>,

    /// How many peers can download from us at the same time
    #[arg(long)]
    pub upload_slots: Option<u32>,

    #[arg(long, value_enum)]
    pub piece_strategy: Option<PieceStrategy>,

    /// Key that is sent to trackers, defaults to random
    #[arg(short, long)]
    pub key: Option<u32>,
}

impl Config {
    /// Load the configuration file from disk, merge the CLI flags on top of
    /// it and resolve the defaults.
    pub fn load(cli: Config) -> Result<ResolvedConfig, Error> {
        let file = match Self::config_path() {
            Ok(path) if path.exists() => Self::from_file(&path)?,
            _ => Config::default(),
        };
        Config::merge(file, cli).resolve()
    }

    /// `~/.config/rivulet/config.toml` on Linux.
    pub fn config_path() -> Result<PathBuf, Error> {
        let dirs =
            ProjectDirs::from("", "", "Rivulet").ok_or(Error::HomeInvalid)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, Error> {
        debug!("loading config from {path:?}");
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Decode the toml file contents into self.
    pub fn from_str(input: &str) -> Result<Self, Error> {
        Ok(toml::from_str(input)?)
    }

    pub fn merge(file: Config, cli: Config) -> Self {
        Self {
            download_dir: cli.download_dir.or(file.download_dir),
            local_peer_port: cli.local_peer_port.or(file.local_peer_port),
            max_torrent_peers: cli.max_torrent_peers.or(file.max_torrent_peers),
            max_peer_failures: cli.max_peer_failures.or(file.max_peer_failures),
            handshake_timeout_secs: cli
                .handshake_timeout_secs
                .or(file.handshake_timeout_secs),
            connect_timeout_secs: cli
                .connect_timeout_secs
                .or(file.connect_timeout_secs),
            reconnect_after_secs: cli
                .reconnect_after_secs
                .or(file.reconnect_after_secs),
            min_announce_interval_secs: cli
                .min_announce_interval_secs
                .or(file.min_announce_interval_secs),
            backoff_base_secs: cli.backoff_base_secs.or(file.backoff_base_secs),
            backoff_cap_secs: cli.backoff_cap_secs.or(file.backoff_cap_secs),
            upload_slots: cli.upload_slots.or(file.upload_slots),
            piece_strategy: cli.piece_strategy.or(file.piece_strategy),
            key: cli.key.or(file.key),
        }
    }

    pub fn resolve(self) -> Result<ResolvedConfig, Error> {
        let d = ResolvedConfig::default();
        let secs = |v: Option<u64>, default: Duration| {
            v.map(Duration::from_secs).unwrap_or(default)
        };

        let resolved = ResolvedConfig {
            download_dir: self.download_dir.unwrap_or(d.download_dir),
            local_peer_port: self.local_peer_port.unwrap_or(d.local_peer_port),
            max_torrent_peers: self
                .max_torrent_peers
                .unwrap_or(d.max_torrent_peers),
            max_peer_failures: self
                .max_peer_failures
                .unwrap_or(d.max_peer_failures),
            handshake_timeout: secs(
                self.handshake_timeout_secs,
                d.handshake_timeout,
            ),
            connect_timeout: secs(self.connect_timeout_secs, d.connect_timeout),
            reconnect_after: secs(self.reconnect_after_secs, d.reconnect_after),
            min_announce_interval: secs(
                self.min_announce_interval_secs,
                d.min_announce_interval,
            ),
            backoff_base: secs(self.backoff_base_secs, d.backoff_base),
            backoff_cap: secs(self.backoff_cap_secs, d.backoff_cap),
            upload_slots: self.upload_slots.unwrap_or(d.upload_slots),
            piece_strategy: self.piece_strategy.unwrap_or(d.piece_strategy),
            key: self.key.unwrap_or(d.key),
        };

        if resolved.max_torrent_peers == 0 {
            return Err(Error::ConfigError(
                "max_torrent_peers cannot be zero".into(),
            ));
        }
        if resolved.max_peer_failures == 0 {
            return Err(Error::ConfigError(
                "max_peer_failures cannot be zero".into(),
            ));
        }
        if resolved.backoff_cap < resolved.backoff_base {
            return Err(Error::ConfigError(
                "backoff_cap_secs cannot be less than backoff_base_secs".into(),
            ));
        }

        Ok(resolved)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub download_dir: PathBuf,
    pub local_peer_port: u16,
    pub max_torrent_peers: u32,
    pub max_peer_failures: u32,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_after: Duration,
    pub min_announce_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub upload_slots: u32,
    pub piece_strategy: PieceStrategy,
    pub key: u32,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        let download_dir = UserDirs::new()
            .and_then(|u| u.download_dir().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            download_dir,
            local_peer_port: 51413,
            max_torrent_peers: 50,
            max_peer_failures: 5,
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            reconnect_after: Duration::from_secs(30),
            min_announce_interval: Duration::from_secs(60),
            backoff_base: Duration::from_secs(15),
            backoff_cap: Duration::from_secs(30 * 60),
            upload_slots: 4,
            piece_strategy: PieceStrategy::default(),
            key: rand::random(),
        }
    }
}
