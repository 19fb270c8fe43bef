//! Byte counters of a peer or a torrent, and their transfer rates.
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::{sync::Mutex, time::Instant};

/// Exponential Moving Average (EMA) smoothing factor
/// Higher values = more responsive to changes, lower values = smoother
const EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Default)]
struct Ema {
    download: f64,
    upload: f64,
}

impl Ema {
    fn smooth(prev: f64, rate: f64) -> f64 {
        if prev == 0.0 {
            rate
        } else {
            EMA_ALPHA * rate + (1.0 - EMA_ALPHA) * prev
        }
    }
}

/// Counter of downloaded and uploaded bytes, with smoothed rates in bytes
/// per second.
#[derive(Debug)]
pub struct Counter {
    total_downloaded: AtomicU64,
    total_uploaded: AtomicU64,
    download_rate: AtomicU64,
    upload_rate: AtomicU64,

    window_downloaded: AtomicU64,
    window_uploaded: AtomicU64,
    window: Mutex<(Instant, Ema)>,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_downloaded: AtomicU64::new(0),
            total_uploaded: AtomicU64::new(0),
            download_rate: AtomicU64::new(0),
            upload_rate: AtomicU64::new(0),
            window_downloaded: AtomicU64::new(0),
            window_uploaded: AtomicU64::new(0),
            window: Mutex::new((Instant::now(), Ema::default())),
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&self, bytes: u64) {
        self.total_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.total_uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.total_downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.total_uploaded.load(Ordering::Relaxed)
    }

    pub fn download_rate(&self) -> u64 {
        self.download_rate.load(Ordering::Relaxed)
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload_rate.load(Ordering::Relaxed)
    }

    /// Update rates with EMA smoothing, called every second by the owner of
    /// the counter.
    pub async fn update_rates(&self) {
        let now = Instant::now();
        let mut window = self.window.lock().await;
        let elapsed = now.duration_since(window.0).as_secs_f64();

        if elapsed < 0.001 {
            return;
        }

        let downloaded = self.window_downloaded.swap(0, Ordering::Relaxed);
        let uploaded = self.window_uploaded.swap(0, Ordering::Relaxed);

        let ema = &mut window.1;
        ema.download = Ema::smooth(ema.download, downloaded as f64 / elapsed);
        ema.upload = Ema::smooth(ema.upload, uploaded as f64 / elapsed);

        self.download_rate.store(ema.download as u64, Ordering::Relaxed);
        self.upload_rate.store(ema.upload as u64, Ordering::Relaxed);

        window.0 = now;
    }
}
