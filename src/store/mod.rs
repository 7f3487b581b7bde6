//! Persistent chunk store
//!
//! Client-side key/value + blob store with size-aware chunk splitting,
//! access metadata, TTL, priority, and multi-strategy eviction under a hard
//! quota. Values above 1 MiB are split into 512 KiB rows in a parallel
//! chunks namespace; the primary row then carries only the bookkeeping.
//!
//! Timestamps are Unix milliseconds throughout.

mod db;
mod eviction;
mod models;
mod schema;

pub use models::{ChunkedMeta, EvictionPolicy, ItemMeta, SmartWeights, StoreStats};

use crate::config::StorageConfig;
use crate::error::{FcResult, FileChunkError};
use chrono::Utc;
use db::StoreDb;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Values above this size are stored chunked
const CHUNK_THRESHOLD: usize = 1024 * 1024;
/// Row size for chunked values
const CHUNK_ROW_SIZE: usize = 512 * 1024;

/// Store lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialised,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Store construction options
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Database location; `None` keeps everything in memory
    pub path: Option<PathBuf>,
    pub storage: StorageConfig,
    pub smart_weights: SmartWeights,
    /// Fraction of quota cleanup shrinks usage down to
    pub cleanup_target: f64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        let path = dirs::home_dir().map(|home| home.join(".filechunk").join("store.db"));
        Self {
            path,
            storage: StorageConfig::default(),
            smart_weights: SmartWeights::default(),
            cleanup_target: 0.5,
        }
    }
}

struct StoreInner {
    state: StoreState,
    db: Option<Arc<StoreDb>>,
}

/// Persistent key/value + blob store with quota-bound eviction
pub struct Store {
    options: StoreOptions,
    inner: Mutex<StoreInner>,
    /// Advisory lock serialising eviction against quota-checked saves
    cleanup_lock: Mutex<()>,
}

impl Store {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(StoreInner {
                state: StoreState::Uninitialised,
                db: None,
            }),
            cleanup_lock: Mutex::new(()),
        }
    }

    /// In-memory store, used by tests and ephemeral hosts
    pub fn in_memory(storage: StorageConfig) -> Self {
        Self::new(StoreOptions {
            path: None,
            storage,
            ..StoreOptions::default()
        })
    }

    pub async fn state(&self) -> StoreState {
        self.inner.lock().await.state
    }

    /// Open lazily; every public operation waits on this.
    async fn ensure_open(&self) -> FcResult<Arc<StoreDb>> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            StoreState::Open => Ok(inner.db.as_ref().map(Arc::clone).expect("open store has db")),
            StoreState::Closing | StoreState::Closed => {
                Err(FileChunkError::io("store is disposed").retryable(false))
            }
            StoreState::Uninitialised | StoreState::Opening => {
                inner.state = StoreState::Opening;
                let result = match &self.options.path {
                    Some(path) => StoreDb::with_path(path.clone()),
                    None => StoreDb::in_memory(),
                };
                match result {
                    Ok(db) => {
                        let db = Arc::new(db);
                        inner.db = Some(Arc::clone(&db));
                        inner.state = StoreState::Open;
                        info!(
                            target: "store",
                            quota = self.options.storage.max_storage_size,
                            strategy = ?self.options.storage.cleanup_strategy,
                            "Store opened"
                        );
                        Ok(db)
                    }
                    Err(err) => {
                        inner.state = StoreState::Uninitialised;
                        Err(FileChunkError::io(format!("failed to open store: {err}")))
                    }
                }
            }
        }
    }

    /// Close the store. Further operations fail.
    pub async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = StoreState::Closing;
        inner.db = None;
        inner.state = StoreState::Closed;
        info!(target: "store", "Store disposed");
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.options.storage.prefix, key)
    }

    fn quota(&self) -> u64 {
        self.options.storage.max_storage_size
    }

    /// Save a value, evicting under quota pressure when needed.
    pub async fn save(&self, key: &str, value: &[u8]) -> FcResult<()> {
        let db = self.ensure_open().await?;
        let full_key = self.full_key(key);
        let size = value.len() as u64;
        let quota = self.quota();

        if size > quota {
            return Err(FileChunkError::quota(format!(
                "value of {size} bytes exceeds quota of {quota} bytes"
            )));
        }

        // Quota check with a single cleanup-then-retry
        let existing = db
            .get_item(&full_key)
            .map_err(|e| FileChunkError::io(e.to_string()))?
            .map(|row| row.size.max(0) as u64)
            .unwrap_or(0);
        let (usage, _) = db.usage().map_err(|e| FileChunkError::io(e.to_string()))?;
        let mut prospective = usage.saturating_sub(existing) + size;

        if prospective > quota {
            self.cleanup(self.options.cleanup_target).await?;
            let (usage, _) = db.usage().map_err(|e| FileChunkError::io(e.to_string()))?;
            let existing = db
                .get_item(&full_key)
                .map_err(|e| FileChunkError::io(e.to_string()))?
                .map(|row| row.size.max(0) as u64)
                .unwrap_or(0);
            prospective = usage.saturating_sub(existing) + size;
            if prospective > quota {
                return Err(FileChunkError::quota(format!(
                    "store full: {prospective} of {quota} bytes after cleanup"
                )));
            }
        }

        let now = Utc::now().timestamp_millis();
        if value.len() > CHUNK_THRESHOLD {
            let chunks: Vec<&[u8]> = value.chunks(CHUNK_ROW_SIZE).collect();
            debug!(
                target: "store",
                key = %full_key,
                size,
                chunks = chunks.len(),
                "Saving chunked item"
            );
            db.put_chunked(&full_key, size, CHUNK_ROW_SIZE as u64, &chunks, now)
                .map_err(|e| FileChunkError::io(e.to_string()))?;
        } else {
            db.put_inline(&full_key, value, now)
                .map_err(|e| FileChunkError::io(e.to_string()))?;
        }

        if self.options.storage.auto_cleanup {
            let stats = self.stats().await?;
            if stats.usage_percent >= self.options.storage.cleanup_threshold {
                debug!(
                    target: "store",
                    usage_percent = stats.usage_percent,
                    "Usage crossed cleanup threshold"
                );
                self.cleanup(self.options.cleanup_target).await?;
            }
        }

        Ok(())
    }

    /// Read a value. Expired keys read as absent; a damaged chunk set is
    /// reported as `CORRUPT` and the primary row removed.
    pub async fn get(&self, key: &str) -> FcResult<Option<Vec<u8>>> {
        let db = self.ensure_open().await?;
        let full_key = self.full_key(key);
        let now = Utc::now().timestamp_millis();

        let Some(row) = db
            .get_item(&full_key)
            .map_err(|e| FileChunkError::io(e.to_string()))?
        else {
            return Ok(None);
        };

        if row.expire_at.map(|at| at <= now).unwrap_or(false) {
            if let Err(err) = db.delete_item(&full_key) {
                warn!(target: "store", key = %full_key, error = %err, "Failed to drop expired item");
            }
            return Ok(None);
        }

        let value = if row.is_chunked {
            let total_chunks = row.total_chunks.unwrap_or(0).max(0) as usize;
            let chunks = db
                .get_chunks(&full_key)
                .map_err(|e| FileChunkError::io(e.to_string()))?;
            if chunks.len() != total_chunks {
                warn!(
                    target: "store",
                    key = %full_key,
                    expected = total_chunks,
                    found = chunks.len(),
                    "Chunk set mismatch, dropping item"
                );
                let _ = db.delete_item(&full_key);
                return Err(FileChunkError::corrupt(format!(
                    "chunked item {key:?} has {} of {total_chunks} rows",
                    chunks.len()
                )));
            }
            let mut value = Vec::with_capacity(row.size.max(0) as usize);
            for chunk in chunks {
                value.extend_from_slice(&chunk);
            }
            value
        } else {
            row.payload.unwrap_or_default()
        };

        // Best-effort; a failed metadata bump never blocks the read
        if let Err(err) = db.touch(&full_key, now) {
            warn!(target: "store", key = %full_key, error = %err, "Failed to update access metadata");
        }

        Ok(Some(value))
    }

    pub async fn remove(&self, key: &str) -> FcResult<bool> {
        let db = self.ensure_open().await?;
        db.delete_item(&self.full_key(key))
            .map_err(|e| FileChunkError::io(e.to_string()))
    }

    pub async fn clear(&self) -> FcResult<()> {
        let db = self.ensure_open().await?;
        db.clear().map_err(|e| FileChunkError::io(e.to_string()))
    }

    pub async fn set_expiry(&self, key: &str, ttl_ms: i64) -> FcResult<bool> {
        let db = self.ensure_open().await?;
        let expire_at = Utc::now().timestamp_millis() + ttl_ms;
        db.set_expiry(&self.full_key(key), expire_at)
            .map_err(|e| FileChunkError::io(e.to_string()))
    }

    pub async fn set_priority(&self, key: &str, priority: i32) -> FcResult<bool> {
        let db = self.ensure_open().await?;
        db.set_priority(&self.full_key(key), priority)
            .map_err(|e| FileChunkError::io(e.to_string()))
    }

    pub async fn stats(&self) -> FcResult<StoreStats> {
        let db = self.ensure_open().await?;
        let (current_bytes, item_count) =
            db.usage().map_err(|e| FileChunkError::io(e.to_string()))?;
        let last_cleanup_at = db
            .last_cleanup_at()
            .map_err(|e| FileChunkError::io(e.to_string()))?;
        let quota_bytes = self.quota();
        let usage_percent = if quota_bytes == 0 {
            100.0
        } else {
            (current_bytes as f64 / quota_bytes as f64) * 100.0
        };
        Ok(StoreStats {
            current_bytes,
            quota_bytes,
            item_count,
            last_cleanup_at,
            usage_percent,
        })
    }

    /// Remove expired items only.
    pub async fn cleanup_expired(&self) -> FcResult<usize> {
        let db = self.ensure_open().await?;
        let _guard = self.cleanup_lock.lock().await;
        let now = Utc::now().timestamp_millis();
        let removed = self.remove_expired(&db, now)?;
        if removed > 0 {
            db.record_cleanup(now)
                .map_err(|e| FileChunkError::io(e.to_string()))?;
        }
        Ok(removed)
    }

    /// Evict until usage is at or below `target_fraction` of quota.
    ///
    /// Expired items always go first regardless of policy.
    pub async fn cleanup(&self, target_fraction: f64) -> FcResult<usize> {
        let db = self.ensure_open().await?;
        let _guard = self.cleanup_lock.lock().await;
        let now = Utc::now().timestamp_millis();
        let target_bytes = (self.quota() as f64 * target_fraction.clamp(0.0, 1.0)) as u64;

        let mut removed = self.remove_expired(&db, now)?;

        let (mut usage, _) = db.usage().map_err(|e| FileChunkError::io(e.to_string()))?;
        if usage > target_bytes {
            let mut candidates = db
                .list_meta()
                .map_err(|e| FileChunkError::io(e.to_string()))?;
            candidates.retain(|item| !item.is_expired(now));
            eviction::order_candidates(
                &mut candidates,
                self.options.storage.cleanup_strategy,
                now,
                &self.options.smart_weights,
            );

            for item in candidates {
                if usage <= target_bytes {
                    break;
                }
                if db
                    .delete_item(&item.key)
                    .map_err(|e| FileChunkError::io(e.to_string()))?
                {
                    usage = usage.saturating_sub(item.size);
                    removed += 1;
                    debug!(
                        target: "store::evict",
                        key = %item.key,
                        size = item.size,
                        strategy = ?self.options.storage.cleanup_strategy,
                        "Evicted item"
                    );
                }
            }
        }

        db.record_cleanup(now)
            .map_err(|e| FileChunkError::io(e.to_string()))?;
        if removed > 0 {
            info!(target: "store::evict", removed, usage, "Cleanup pass finished");
        }
        Ok(removed)
    }

    fn remove_expired(&self, db: &StoreDb, now: i64) -> FcResult<usize> {
        let items = db
            .list_meta()
            .map_err(|e| FileChunkError::io(e.to_string()))?;
        let mut removed = 0;
        for item in items.iter().filter(|item| item.is_expired(now)) {
            if db
                .delete_item(&item.key)
                .map_err(|e| FileChunkError::io(e.to_string()))?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    #[cfg(test)]
    async fn raw_db(&self) -> Arc<StoreDb> {
        self.ensure_open().await.unwrap()
    }
}
