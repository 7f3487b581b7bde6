//! Upload progress accounting
//!
//! Chunks complete out of index order and from several workers at once, so
//! byte and chunk counters are atomics integrated per unique chunk.
//! Throughput is not sampled on a timer: every chunk completion folds its
//! observed rate into an exponentially weighted moving average, which is
//! cheap, needs no background task, and settles quickly after an endpoint
//! switch.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Weight of the newest chunk's rate in the moving average
const RATE_ALPHA: f64 = 0.3;

/// Snapshot handed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub bytes_total: u64,
    pub bytes_sent: u64,
    /// 0.0 ..= 100.0
    pub percent: f64,
    /// Smoothed upload rate; 0 until the first chunk lands
    pub throughput_bps: u64,
    /// Time left at the current rate, when one can be estimated
    pub eta: Option<Duration>,
    pub chunks_total: usize,
    pub chunks_done: usize,
    pub chunks_in_flight: usize,
}

/// Receiver for progress snapshots.
///
/// Any `Fn(ProgressUpdate)` closure qualifies.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, update: ProgressUpdate);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn on_progress(&self, update: ProgressUpdate) {
        self(update)
    }
}

struct RateEstimate {
    last_completion: Instant,
    smoothed_bps: f64,
}

/// Shared progress state for one transfer
pub struct ProgressTracker {
    bytes_total: u64,
    chunks_total: usize,
    bytes_sent: AtomicU64,
    chunks_done: AtomicUsize,
    chunks_in_flight: AtomicUsize,
    rate: Mutex<RateEstimate>,
}

impl ProgressTracker {
    pub fn new(bytes_total: u64, chunks_total: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes_total,
            chunks_total,
            bytes_sent: AtomicU64::new(0),
            chunks_done: AtomicUsize::new(0),
            chunks_in_flight: AtomicUsize::new(0),
            rate: Mutex::new(RateEstimate {
                last_completion: Instant::now(),
                smoothed_bps: 0.0,
            }),
        })
    }

    /// Account for chunks a previous run already uploaded. Does not touch
    /// the rate estimate; resumed bytes were not transferred now.
    pub fn preload_completed(&self, chunks: usize, bytes: u64) {
        self.chunks_done.fetch_add(chunks, Ordering::SeqCst);
        self.bytes_sent.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn start_chunk(&self) {
        self.chunks_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Integrate one finished chunk and fold its rate into the average.
    pub fn complete_chunk(&self, bytes: u64) {
        self.chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.chunks_done.fetch_add(1, Ordering::SeqCst);
        self.bytes_sent.fetch_add(bytes, Ordering::SeqCst);

        let mut rate = self.rate.lock().expect("rate estimate poisoned");
        let elapsed = rate.last_completion.elapsed().as_secs_f64().max(1e-6);
        let observed = bytes as f64 / elapsed;
        rate.smoothed_bps = if rate.smoothed_bps == 0.0 {
            observed
        } else {
            RATE_ALPHA * observed + (1.0 - RATE_ALPHA) * rate.smoothed_bps
        };
        rate.last_completion = Instant::now();
    }

    /// Back out of an in-flight chunk that will not complete.
    pub fn abandon_chunk(&self) {
        self.chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn total_uploaded(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ProgressUpdate {
        let bytes_sent = self.bytes_sent.load(Ordering::SeqCst);
        let chunks_done = self.chunks_done.load(Ordering::SeqCst);
        let throughput_bps = {
            let rate = self.rate.lock().expect("rate estimate poisoned");
            rate.smoothed_bps as u64
        };

        let percent = if self.bytes_total > 0 {
            ((bytes_sent as f64 / self.bytes_total as f64) * 100.0).clamp(0.0, 100.0)
        } else if chunks_done >= self.chunks_total {
            // Zero-byte transfers finish by chunk count
            100.0
        } else {
            0.0
        };

        let remaining = self.bytes_total.saturating_sub(bytes_sent);
        let eta = if remaining > 0 && throughput_bps > 0 {
            Some(Duration::from_secs_f64(
                remaining as f64 / throughput_bps as f64,
            ))
        } else {
            None
        };

        ProgressUpdate {
            bytes_total: self.bytes_total,
            bytes_sent,
            percent,
            throughput_bps,
            eta,
            chunks_total: self.chunks_total,
            chunks_done,
            chunks_in_flight: self.chunks_in_flight.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_completions_integrate_by_chunk() {
        let tracker = ProgressTracker::new(3000, 3);
        for _ in 0..3 {
            tracker.start_chunk();
        }

        // Completion order 2, 0, 1; bytes only ever go up
        tracker.complete_chunk(1000);
        tracker.complete_chunk(1000);
        tracker.complete_chunk(1000);

        let update = tracker.snapshot();
        assert_eq!(update.bytes_sent, 3000);
        assert!((update.percent - 100.0).abs() < f64::EPSILON);
        assert_eq!(update.chunks_done, 3);
        assert_eq!(update.chunks_in_flight, 0);
        assert!(update.throughput_bps > 0);
        assert!(update.eta.is_none());
    }

    #[test]
    fn zero_byte_transfer_finishes_by_chunk_count() {
        let tracker = ProgressTracker::new(0, 1);
        tracker.start_chunk();
        assert!((tracker.snapshot().percent - 0.0).abs() < f64::EPSILON);
        tracker.complete_chunk(0);
        assert!((tracker.snapshot().percent - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn preloaded_chunks_count_without_skewing_the_rate() {
        let tracker = ProgressTracker::new(4000, 4);
        tracker.preload_completed(2, 2000);

        let update = tracker.snapshot();
        assert_eq!(update.chunks_done, 2);
        assert_eq!(update.bytes_sent, 2000);
        assert!((update.percent - 50.0).abs() < f64::EPSILON);
        // Resumed bytes were not transferred in this run
        assert_eq!(update.throughput_bps, 0);
    }

    #[test]
    fn abandoned_chunks_release_their_slot() {
        let tracker = ProgressTracker::new(1000, 2);
        tracker.start_chunk();
        tracker.start_chunk();
        tracker.abandon_chunk();
        assert_eq!(tracker.snapshot().chunks_in_flight, 1);
        assert_eq!(tracker.snapshot().chunks_done, 0);
    }

    #[test]
    fn closures_are_progress_callbacks() {
        let seen = Arc::new(Mutex::new(0u64));
        let seen_in_cb = Arc::clone(&seen);
        let callback: Arc<dyn ProgressCallback> = Arc::new(move |update: ProgressUpdate| {
            *seen_in_cb.lock().unwrap() = update.bytes_sent;
        });

        let tracker = ProgressTracker::new(100, 1);
        tracker.start_chunk();
        tracker.complete_chunk(100);
        callback.on_progress(tracker.snapshot());
        assert_eq!(*seen.lock().unwrap(), 100);
    }
}
