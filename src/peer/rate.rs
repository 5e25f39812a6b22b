use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A sliding-window byte-rate estimator.
///
/// Samples older than the window are pruned on every read, so the
/// reported rate is total bytes seen over the last `window`, divided by
/// the window length. A lifetime total is kept alongside for tracker
/// accounting.
pub struct RateMeter {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, u64)>>,
    lifetime: AtomicU64,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(VecDeque::new()),
            lifetime: AtomicU64::new(0),
        }
    }

    /// Records bytes transferred now.
    pub fn add(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.lifetime.fetch_add(bytes, Ordering::Relaxed);
        let mut samples = self.samples.lock();
        samples.push_back((Instant::now(), bytes));
    }

    /// Estimated rate in bytes per second over the window.
    pub fn rate(&self) -> u64 {
        let total = self.windowed_total();
        total / self.window.as_secs().max(1)
    }

    /// Bytes seen within the current window.
    pub fn windowed_total(&self) -> u64 {
        let mut samples = self.samples.lock();
        if let Some(cutoff) = Instant::now().checked_sub(self.window) {
            while samples.front().is_some_and(|&(t, _)| t < cutoff) {
                samples.pop_front();
            }
        }
        samples.iter().map(|&(_, n)| n).sum()
    }

    /// Total bytes ever recorded.
    pub fn lifetime_total(&self) -> u64 {
        self.lifetime.load(Ordering::Relaxed)
    }
}
