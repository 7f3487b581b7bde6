//! Adaptive compression pipeline
//!
//! Decides per file whether and at what gzip level to compress, learning
//! from historical ratios and live network/device telemetry.

mod category;
mod device;
mod network;
mod stats;

pub use category::FileCategory;
pub use device::DeviceTelemetry;
pub use network::{NetworkClass, NetworkSnapshot, NetworkTelemetry, NetworkTrend};
pub use stats::{CompressionStats, CompressionTelemetry, STATS_STORE_KEY};

use crate::config::{CompressionConfig, CompressionProfile};
use crate::error::{FcResult, FileChunkError};
use crate::platform::ContentSource;
use crate::store::Store;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

/// Payloads above this size compress on the blocking executor
const OFFLOAD_THRESHOLD: usize = 256 * 1024;
/// Files at or below this size are predicted by compressing the sample
const SMALL_FILE_LIMIT: u64 = 64 * 1024;

/// The compression-relevant view of a file
#[derive(Debug, Clone)]
pub struct FileProfile {
    pub name: String,
    pub size: u64,
    pub mime: Option<String>,
}

impl FileProfile {
    pub fn from_source(source: &dyn ContentSource) -> Self {
        Self {
            name: source.name().to_string(),
            size: source.len(),
            mime: source.mime_hint().map(|m| m.to_string()),
        }
    }

    pub fn category(&self) -> FileCategory {
        FileCategory::classify(self.mime.as_deref(), &self.name)
    }
}

/// Adaptive gzip compressor with learned statistics
pub struct Compressor {
    config: CompressionConfig,
    stats: Mutex<CompressionStats>,
    samples_since_persist: AtomicU32,
    network: NetworkTelemetry,
    device: DeviceTelemetry,
    store: Option<Arc<Store>>,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(CompressionStats::default()),
            samples_since_persist: AtomicU32::new(0),
            network: NetworkTelemetry::new(),
            device: DeviceTelemetry::new(),
            store: None,
        }
    }

    /// Attach a store and reload previously learned aggregates.
    pub async fn with_store(config: CompressionConfig, store: Arc<Store>) -> Self {
        let mut compressor = Self::new(config);
        match store.get(STATS_STORE_KEY).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<CompressionStats>(&bytes) {
                Ok(stats) => {
                    *compressor.stats.lock().expect("stats poisoned") = stats;
                    debug!(target: "compression", "Loaded persisted compression stats");
                }
                Err(err) => {
                    warn!(target: "compression", error = %err, "Discarding unreadable stats");
                }
            },
            Ok(None) => {}
            Err(err) => {
                warn!(target: "compression", error = %err, "Failed to load compression stats");
            }
        }
        compressor.store = Some(store);
        compressor
    }

    pub fn network(&self) -> &NetworkTelemetry {
        &self.network
    }

    pub fn device(&self) -> &DeviceTelemetry {
        &self.device
    }

    /// Whether compressing this file is worth the cycles at all.
    pub fn should_compress(&self, profile: &FileProfile) -> bool {
        if profile.size < self.config.min_size {
            return false;
        }
        let category = profile.category();
        if category.is_precompressed() {
            return false;
        }
        if category.is_textual() {
            return true;
        }
        matches!(
            category,
            FileCategory::Image | FileCategory::Pdf | FileCategory::Binary
        )
    }

    /// Pick a gzip level from category base, size, live network and device
    /// telemetry, and the learned history.
    pub fn choose_level(&self, profile: &FileProfile) -> u32 {
        let category = profile.category();
        let mut level = category.base_level();

        level += size_adjustment(profile.size);

        let snapshot = self.network.snapshot();
        level += network_adjustment(snapshot.class) * snapshot.stability;

        level += device_adjustment(self.device.score());

        let best = {
            let stats = self.stats.lock().expect("stats poisoned");
            stats.best_level(category)
        };
        if let Some(best) = best {
            level = 0.7 * level + 0.3 * best as f64;
        }

        let level = match self.config.profile {
            CompressionProfile::Speed => level.min(3.0),
            CompressionProfile::Compression => level + 1.0,
            CompressionProfile::MaximumCompression => 9.0,
            CompressionProfile::Balanced | CompressionProfile::Custom => level,
        };

        level.round().clamp(1.0, 9.0) as u32
    }

    /// Gzip the payload at the chosen level.
    pub async fn compress(&self, data: Bytes, profile: &FileProfile) -> FcResult<(Bytes, CompressionTelemetry)> {
        let level = self.choose_level(profile);
        let original_size = data.len() as u64;
        let started = Instant::now();

        let compressed = if data.len() > OFFLOAD_THRESHOLD {
            tokio::task::spawn_blocking(move || gzip_encode(&data, level))
                .await
                .map_err(|e| FileChunkError::worker(format!("compression task crashed: {e}")))??
        } else {
            gzip_encode(&data, level)?
        };

        let telemetry = CompressionTelemetry {
            algorithm: "gzip".to_string(),
            level,
            original_size,
            compressed_size: compressed.len() as u64,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        Ok((Bytes::from(compressed), telemetry))
    }

    /// Inverse of [`compress`](Self::compress) for every level.
    pub async fn decompress(&self, data: Bytes) -> FcResult<Bytes> {
        let decompressed = if data.len() > OFFLOAD_THRESHOLD {
            tokio::task::spawn_blocking(move || gzip_decode(&data))
                .await
                .map_err(|e| FileChunkError::worker(format!("decompression task crashed: {e}")))??
        } else {
            gzip_decode(&data)?
        };
        Ok(Bytes::from(decompressed))
    }

    /// Estimate the compressed size without running the full payload through
    /// the codec.
    pub async fn predict_compressed_size(
        &self,
        profile: &FileProfile,
        sample: Option<&[u8]>,
    ) -> u64 {
        if !self.should_compress(profile) {
            return profile.size;
        }
        let category = profile.category();

        // Small files: cheap enough to compress the sample end-to-end
        if profile.size <= SMALL_FILE_LIMIT {
            if let Some(sample) = sample {
                if sample.len() as u64 == profile.size {
                    if let Ok((compressed, _)) =
                        self.compress(Bytes::copy_from_slice(sample), profile).await
                    {
                        return compressed.len() as u64;
                    }
                }
            }
        }

        let historical = {
            let stats = self.stats.lock().expect("stats poisoned");
            stats.category_ratio(category)
        };
        if let Some(ratio) = historical {
            return (profile.size as f64 * ratio) as u64;
        }

        if category.is_textual() {
            if let Some(sample) = sample {
                let ratio = text_sample_ratio(sample);
                return (profile.size as f64 * ratio) as u64;
            }
        }

        (profile.size as f64 * category.default_ratio()) as u64
    }

    /// Fold an observed result into the aggregates, persisting every N
    /// samples.
    pub async fn record_result(&self, profile: &FileProfile, telemetry: &CompressionTelemetry) {
        let category = profile.category();
        let serialized = {
            let mut stats = self.stats.lock().expect("stats poisoned");
            stats.record(category, telemetry);
            serde_json::to_vec(&*stats).ok()
        };

        let due = self.samples_since_persist.fetch_add(1, Ordering::SeqCst) + 1
            >= self.config.persist_every;
        if due {
            self.samples_since_persist.store(0, Ordering::SeqCst);
            if let (Some(store), Some(bytes)) = (&self.store, serialized) {
                if let Err(err) = store.save(STATS_STORE_KEY, &bytes).await {
                    warn!(target: "compression", error = %err, "Failed to persist stats");
                }
            }
        }
    }

    /// Learned view of a category, for diagnostics
    pub fn category_ratio(&self, category: FileCategory) -> Option<f64> {
        self.stats
            .lock()
            .expect("stats poisoned")
            .category_ratio(category)
    }
}

fn gzip_encode(data: &[u8], level: u32) -> FcResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(data.len() / 2 + 64),
        Compression::new(level),
    );
    encoder
        .write_all(data)
        .map_err(|e| FileChunkError::io(format!("gzip write: {e}")))?;
    encoder
        .finish()
        .map_err(|e| FileChunkError::io(format!("gzip finish: {e}")))
}

fn gzip_decode(data: &[u8]) -> FcResult<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| FileChunkError::corrupt(format!("gzip decode: {e}")))?;
    Ok(out)
}

fn size_adjustment(size: u64) -> f64 {
    const MIB: u64 = 1024 * 1024;
    if size > 500 * MIB {
        -2.5
    } else if size > 100 * MIB {
        -2.0
    } else if size > 50 * MIB {
        -1.5
    } else if size > 10 * MIB {
        -1.0
    } else if size > MIB {
        -0.5
    } else if size >= MIB / 2 {
        0.0
    } else {
        1.0
    }
}

fn network_adjustment(class: NetworkClass) -> f64 {
    match class {
        NetworkClass::VerySlow => 2.0,
        NetworkClass::Slow => 1.0,
        NetworkClass::Medium | NetworkClass::Unknown => 0.0,
        NetworkClass::Fast => -1.0,
        NetworkClass::VeryFast => -2.0,
    }
}

fn device_adjustment(score: f64) -> f64 {
    if score < 0.3 {
        -2.0
    } else if score < 0.5 {
        -1.0
    } else if score < 0.75 {
        0.0
    } else {
        0.5
    }
}

/// Ratio estimate for a textual sample from its repetition density.
fn text_sample_ratio(sample: &[u8]) -> f64 {
    const WINDOW: usize = 8;
    const STEP: usize = 4;
    if sample.len() < WINDOW * 2 {
        return 0.8;
    }

    let mut seen: HashSet<&[u8]> = HashSet::new();
    let mut total = 0usize;
    let mut index = 0usize;
    while index + WINDOW <= sample.len() {
        seen.insert(&sample[index..index + WINDOW]);
        total += 1;
        index += STEP;
    }

    let repetition = 1.0 - (seen.len() as f64 / total as f64);
    (1.0 - 0.8 * repetition).clamp(0.15, 1.0)
}
