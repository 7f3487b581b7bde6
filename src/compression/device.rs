//! Device capability telemetry
//!
//! A one-shot synthetic benchmark at construction yields a normalised score
//! in (0, 1]. Long tasks decay the score; a low discharging battery drops it
//! further; charging restores it toward the benchmarked baseline.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Bytes touched by the boot benchmark
const BENCHMARK_BYTES: usize = 1_000_000;
/// Benchmark time that maps to a score of 1.0
const REFERENCE_MICROS: f64 = 500.0;

struct DeviceState {
    score: f64,
    baseline: f64,
    battery_penalty: f64,
}

/// Rolling device performance score
pub struct DeviceTelemetry {
    state: Mutex<DeviceState>,
}

impl Default for DeviceTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTelemetry {
    pub fn new() -> Self {
        let baseline = Self::benchmark();
        debug!(target: "compression", baseline, "Device benchmark complete");
        Self {
            state: Mutex::new(DeviceState {
                score: baseline,
                baseline,
                battery_penalty: 1.0,
            }),
        }
    }

    /// Fixed score, used by tests
    pub fn with_score(score: f64) -> Self {
        let score = score.clamp(0.05, 1.0);
        Self {
            state: Mutex::new(DeviceState {
                score,
                baseline: score,
                battery_penalty: 1.0,
            }),
        }
    }

    fn benchmark() -> f64 {
        let started = Instant::now();
        let mut acc: u64 = 0;
        for i in 0..BENCHMARK_BYTES {
            acc = acc.wrapping_add((i as u64).wrapping_mul(31)).rotate_left(7);
        }
        // Keep the loop observable so it cannot be optimised away
        std::hint::black_box(acc);
        let elapsed = started.elapsed().as_micros().max(1) as f64;
        (REFERENCE_MICROS / elapsed).clamp(0.05, 1.0)
    }

    /// A long task on the main context suggests contention; decay the score.
    pub fn record_long_task(&self, duration: Duration) {
        let mut state = self.state.lock().expect("device telemetry poisoned");
        let factor = if duration >= Duration::from_millis(200) {
            0.8
        } else {
            0.9
        };
        state.score = (state.score * factor).max(0.05);
    }

    /// Battery observation. `level` is 0.0..=1.0.
    pub fn record_battery(&self, level: f64, charging: bool) {
        let mut state = self.state.lock().expect("device telemetry poisoned");
        if charging {
            state.battery_penalty = 1.0;
            state.score = state.baseline;
        } else if level < 0.2 {
            state.battery_penalty = 0.5;
        } else {
            state.battery_penalty = 1.0;
        }
    }

    pub fn score(&self) -> f64 {
        let state = self.state.lock().expect("device telemetry poisoned");
        (state.score * state.battery_penalty).clamp(0.05, 1.0)
    }
}
