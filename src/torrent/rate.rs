use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Windowed byte-rate estimate for one transfer direction of one peer.
/// Bytes are recorded as they move; the choking round samples the window
/// and the sampled rate drives peer ordering until the next round.
#[derive(Debug, Clone)]
pub struct TransferRate {
    window_bytes: u64,
    total_bytes: u64,
    sampled_at: Instant,
    rate: f64,
}

impl TransferRate {
    pub fn new(now: Instant) -> Self {
        TransferRate {
            window_bytes: 0,
            total_bytes: 0,
            sampled_at: now,
            rate: 0.0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.window_bytes += bytes;
        self.total_bytes += bytes;
    }

    /// Closes the current window: rate becomes bytes-per-second since the
    /// last sample, and the window restarts at `now`.
    pub fn sample(&mut self, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.sampled_at).as_secs_f64();
        self.rate = if elapsed > 0.0 {
            self.window_bytes as f64 / elapsed
        } else {
            0.0
        };
        self.window_bytes = 0;
        self.sampled_at = now;
        self.rate
    }

    /// Most recently sampled bytes-per-second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn total(&self) -> u64 {
        self.total_bytes
    }
}

/// Session-wide transfer totals, shared between the coordinator (which
/// records traffic) and the announce loop (which reports it to trackers).
#[derive(Debug, Default)]
pub struct TransferCounters {
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    left: AtomicU64,
}

impl TransferCounters {
    pub fn new(left: u64) -> Self {
        TransferCounters {
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            left: AtomicU64::new(left),
        }
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Called once per verified piece with the piece's length.
    pub fn sub_left(&self, bytes: u64) {
        let _ = self
            .left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                Some(left.saturating_sub(bytes))
            });
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.left.load(Ordering::Relaxed)
    }
}
