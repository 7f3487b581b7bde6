//! Live network telemetry feeding the compression decision

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::trace;

/// Bounded sample history length
const MAX_SAMPLES: usize = 10;

/// Coarse throughput class, thresholds in MiB/s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkClass {
    VerySlow,
    Slow,
    Medium,
    Fast,
    VeryFast,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkTrend {
    Improving,
    Declining,
    Stable,
}

/// Point-in-time view of the measured network
#[derive(Debug, Clone, Copy)]
pub struct NetworkSnapshot {
    pub class: NetworkClass,
    /// 1.0 = perfectly steady, 0.0 = wildly variable
    pub stability: f64,
    pub trend: NetworkTrend,
    pub throughput_mibps: f64,
}

impl NetworkSnapshot {
    pub fn unknown() -> Self {
        Self {
            class: NetworkClass::Unknown,
            stability: 1.0,
            trend: NetworkTrend::Stable,
            throughput_mibps: 0.0,
        }
    }
}

/// Sliding-window throughput tracker
pub struct NetworkTelemetry {
    samples: Mutex<VecDeque<f64>>,
}

impl Default for NetworkTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkTelemetry {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(MAX_SAMPLES)),
        }
    }

    /// Record one transfer observation.
    pub fn record(&self, bytes: u64, elapsed: Duration) {
        if elapsed.is_zero() || bytes == 0 {
            return;
        }
        let mibps = (bytes as f64 / (1024.0 * 1024.0)) / elapsed.as_secs_f64();
        let mut samples = self.samples.lock().expect("network telemetry poisoned");
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(mibps);
        trace!(target: "compression", mibps, samples = samples.len(), "Throughput sample");
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        let samples = self.samples.lock().expect("network telemetry poisoned");
        if samples.is_empty() {
            return NetworkSnapshot::unknown();
        }

        let n = samples.len() as f64;
        let mean: f64 = samples.iter().sum::<f64>() / n;
        let variance: f64 = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();
        let stability = if mean > 0.0 {
            (1.0 - (stddev / mean)).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let class = if mean < 0.5 {
            NetworkClass::VerySlow
        } else if mean < 1.0 {
            NetworkClass::Slow
        } else if mean < 5.0 {
            NetworkClass::Medium
        } else if mean < 20.0 {
            NetworkClass::Fast
        } else {
            NetworkClass::VeryFast
        };

        let trend = if samples.len() < 4 {
            NetworkTrend::Stable
        } else {
            let half = samples.len() / 2;
            let older: f64 = samples.iter().take(half).sum::<f64>() / half as f64;
            let recent: f64 =
                samples.iter().skip(half).sum::<f64>() / (samples.len() - half) as f64;
            if older > 0.0 && recent > older * 1.2 {
                NetworkTrend::Improving
            } else if older > 0.0 && recent < older * 0.8 {
                NetworkTrend::Declining
            } else {
                NetworkTrend::Stable
            }
        };

        NetworkSnapshot {
            class,
            stability,
            trend,
            throughput_mibps: mean,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_mibps(telemetry: &NetworkTelemetry, mibps: f64) {
        telemetry.record(
            (mibps * 1024.0 * 1024.0) as u64,
            Duration::from_secs(1),
        );
    }

    #[test]
    fn empty_history_is_unknown() {
        let telemetry = NetworkTelemetry::new();
        assert_eq!(telemetry.snapshot().class, NetworkClass::Unknown);
    }

    #[test]
    fn classification_thresholds() {
        for (mibps, expected) in [
            (0.2, NetworkClass::VerySlow),
            (0.8, NetworkClass::Slow),
            (3.0, NetworkClass::Medium),
            (12.0, NetworkClass::Fast),
            (40.0, NetworkClass::VeryFast),
        ] {
            let telemetry = NetworkTelemetry::new();
            record_mibps(&telemetry, mibps);
            assert_eq!(telemetry.snapshot().class, expected, "{mibps} MiB/s");
        }
    }

    #[test]
    fn history_is_bounded() {
        let telemetry = NetworkTelemetry::new();
        for _ in 0..50 {
            record_mibps(&telemetry, 2.0);
        }
        assert!(telemetry.samples.lock().unwrap().len() <= MAX_SAMPLES);
    }

    #[test]
    fn improving_trend_detected() {
        let telemetry = NetworkTelemetry::new();
        for mibps in [1.0, 1.0, 1.0, 1.0, 4.0, 4.0, 4.0, 4.0] {
            record_mibps(&telemetry, mibps);
        }
        assert_eq!(telemetry.snapshot().trend, NetworkTrend::Improving);
    }

    #[test]
    fn steady_throughput_is_stable() {
        let telemetry = NetworkTelemetry::new();
        for _ in 0..8 {
            record_mibps(&telemetry, 5.0);
        }
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.trend, NetworkTrend::Stable);
        assert!(snapshot.stability > 0.99);
    }
}
