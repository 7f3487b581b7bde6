//! Store metadata types

use serde::{Deserialize, Serialize};

/// Eviction strategy applied by `cleanup`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvictionPolicy {
    /// Least recently accessed first
    Lru,
    /// Least frequently accessed first
    Lfu,
    /// Oldest insertion first
    Fifo,
    /// Soonest expiry first
    Expire,
    /// Largest first
    Size,
    /// Lowest priority first
    Priority,
    /// Weighted composite score
    Smart,
}

/// Coefficients for the SMART composite score.
///
/// The shipped values are a tunable default, not a derived optimum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartWeights {
    pub expired_bonus: f64,
    pub size_mb: f64,
    pub hours_since_access: f64,
    pub age_days: f64,
    pub access_count_cap: f64,
    pub priority: f64,
}

impl Default for SmartWeights {
    fn default() -> Self {
        Self {
            expired_bonus: 1000.0,
            size_mb: 3.0,
            hours_since_access: 2.0,
            age_days: 1.0,
            access_count_cap: 10.0,
            priority: 5.0,
        }
    }
}

/// Metadata row for one stored item
#[derive(Debug, Clone)]
pub struct ItemMeta {
    pub key: String,
    pub size: u64,
    pub created_at: i64,
    pub last_modified: i64,
    pub last_accessed: i64,
    pub access_count: i64,
    pub priority: i32,
    pub expire_at: Option<i64>,
    pub chunked: Option<ChunkedMeta>,
}

/// Chunked-value bookkeeping on the primary row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedMeta {
    pub total_chunks: u32,
    pub chunk_size: u64,
}

impl ItemMeta {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_at.map(|at| at <= now).unwrap_or(false)
    }

    /// SMART composite score; higher scores are evicted first.
    ///
    /// Timestamps are Unix milliseconds, matching the store rows.
    pub fn smart_score(&self, now: i64, weights: &SmartWeights) -> f64 {
        let expired = if self.is_expired(now) {
            weights.expired_bonus
        } else {
            0.0
        };
        let size_mb = self.size as f64 / (1024.0 * 1024.0);
        let hours_since_access = ((now - self.last_accessed).max(0) as f64) / 3_600_000.0;
        let age_days = ((now - self.created_at).max(0) as f64) / 86_400_000.0;
        let rarity = (weights.access_count_cap - self.access_count as f64).max(0.0);
        let priority_term =
            weights.priority * (weights.access_count_cap - 2.0 * self.priority as f64);

        expired
            + weights.size_mb * size_mb
            + weights.hours_since_access * hours_since_access
            + weights.age_days * age_days
            + rarity
            + priority_term
    }
}

/// Snapshot returned by `Store::stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub current_bytes: u64,
    pub quota_bytes: u64,
    pub item_count: u64,
    pub last_cleanup_at: i64,
    pub usage_percent: f64,
}
