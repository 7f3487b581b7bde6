//! Learned compression statistics
//!
//! Rolling aggregates per file category and per gzip level, folded with
//! streaming averages and persisted across sessions under a dedicated store
//! key.

use super::category::FileCategory;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Store key the aggregates persist under
pub const STATS_STORE_KEY: &str = "compression-stats";

/// One compression observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionTelemetry {
    pub algorithm: String,
    pub level: u32,
    pub original_size: u64,
    pub compressed_size: u64,
    pub duration_ms: f64,
}

impl CompressionTelemetry {
    /// compressed/original; 1.0 when nothing was gained
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            1.0
        } else {
            self.compressed_size as f64 / self.original_size as f64
        }
    }

    /// Bytes per millisecond through the compressor
    pub fn speed(&self) -> f64 {
        if self.duration_ms <= 0.0 {
            0.0
        } else {
            self.original_size as f64 / self.duration_ms
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LevelStat {
    pub count: u64,
    pub avg_ratio: f64,
    pub avg_time_ms: f64,
    pub avg_speed: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryStat {
    pub samples: u64,
    pub avg_ratio: f64,
    pub avg_speed: f64,
    pub levels: BTreeMap<u32, LevelStat>,
}

/// All learned aggregates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressionStats {
    pub categories: HashMap<FileCategory, CategoryStat>,
}

fn fold(avg: &mut f64, sample: f64, n: u64) {
    *avg += (sample - *avg) / n as f64;
}

impl CompressionStats {
    /// Fold one observation into the aggregates.
    pub fn record(&mut self, category: FileCategory, telemetry: &CompressionTelemetry) {
        let ratio = telemetry.ratio();
        let speed = telemetry.speed();

        let stat = self.categories.entry(category).or_default();
        stat.samples += 1;
        fold(&mut stat.avg_ratio, ratio, stat.samples);
        fold(&mut stat.avg_speed, speed, stat.samples);

        let level = stat.levels.entry(telemetry.level).or_default();
        level.count += 1;
        fold(&mut level.avg_ratio, ratio, level.count);
        fold(&mut level.avg_time_ms, telemetry.duration_ms, level.count);
        fold(&mut level.avg_speed, speed, level.count);
    }

    pub fn category(&self, category: FileCategory) -> Option<&CategoryStat> {
        self.categories.get(&category)
    }

    /// Historical compressed/original ratio for a category, if any samples
    /// exist.
    pub fn category_ratio(&self, category: FileCategory) -> Option<f64> {
        self.categories
            .get(&category)
            .filter(|stat| stat.samples > 0)
            .map(|stat| stat.avg_ratio)
    }

    /// The level whose observed gain per unit time is best for a category.
    pub fn best_level(&self, category: FileCategory) -> Option<u32> {
        let stat = self.categories.get(&category)?;
        stat.levels
            .iter()
            .filter(|(_, level)| level.count > 0 && level.avg_time_ms > 0.0)
            .max_by(|(_, a), (_, b)| {
                let gain_a = (1.0 - a.avg_ratio) / a.avg_time_ms;
                let gain_b = (1.0 - b.avg_ratio) / b.avg_time_ms;
                gain_a
                    .partial_cmp(&gain_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(level, _)| *level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry(level: u32, original: u64, compressed: u64, duration_ms: f64) -> CompressionTelemetry {
        CompressionTelemetry {
            algorithm: "gzip".to_string(),
            level,
            original_size: original,
            compressed_size: compressed,
            duration_ms,
        }
    }

    #[test]
    fn streaming_average_converges() {
        let mut stats = CompressionStats::default();
        stats.record(FileCategory::Text, &telemetry(6, 1000, 400, 10.0));
        stats.record(FileCategory::Text, &telemetry(6, 1000, 200, 10.0));

        let stat = stats.category(FileCategory::Text).unwrap();
        assert_eq!(stat.samples, 2);
        assert!((stat.avg_ratio - 0.3).abs() < 1e-9);
    }

    #[test]
    fn record_moves_ratio_toward_observation() {
        let mut stats = CompressionStats::default();
        stats.record(FileCategory::Text, &telemetry(6, 1000, 900, 10.0));
        let before = stats.category_ratio(FileCategory::Text).unwrap();

        stats.record(FileCategory::Text, &telemetry(6, 1000, 300, 10.0));
        let after = stats.category_ratio(FileCategory::Text).unwrap();
        assert!(after < before);
    }

    #[test]
    fn best_level_prefers_gain_per_time() {
        let mut stats = CompressionStats::default();
        // Level 9: slightly better ratio, far slower
        stats.record(FileCategory::Json, &telemetry(9, 1000, 280, 100.0));
        // Level 4: nearly the same ratio, much faster
        stats.record(FileCategory::Json, &telemetry(4, 1000, 320, 10.0));

        assert_eq!(stats.best_level(FileCategory::Json), Some(4));
    }

    #[test]
    fn stats_serialize_roundtrip() {
        let mut stats = CompressionStats::default();
        stats.record(FileCategory::Code, &telemetry(8, 5000, 1500, 25.0));

        let json = serde_json::to_vec(&stats).unwrap();
        let restored: CompressionStats = serde_json::from_slice(&json).unwrap();
        assert_eq!(
            restored.category(FileCategory::Code).unwrap().samples,
            1
        );
    }
}
