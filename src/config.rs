//! Crate configuration: typed sections plus a dot-path view used by the
//! kernel's `set_config`/`get_config` surface.

use crate::error::{FcResult, FileChunkError};
use crate::store::EvictionPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// HTTP transport and upload-engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Chunk upload endpoint path
    pub upload_url: String,
    /// Merge endpoint path
    pub merge_url: String,
    /// Dedup precheck endpoint path
    pub check_url: String,
    /// Requested chunk size in bytes; 0 lets the engine derive it
    pub chunk_size: u64,
    /// Per-request timeout
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Upper bound on in-flight chunk uploads
    pub max_concurrent_uploads: usize,
    /// Retry budget per chunk
    pub retry_count: u32,
    /// Base delay between chunk retries (exponential backoff)
    #[serde(with = "duration_millis")]
    pub retry_base_delay: Duration,
    /// Maximum delay between chunk retries
    #[serde(with = "duration_millis")]
    pub retry_max_delay: Duration,
    /// Extensions accepted for upload; empty means no restriction
    pub allowed_file_types: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            upload_url: "/api/upload/chunk".to_string(),
            merge_url: "/api/upload/merge".to_string(),
            check_url: "/api/upload/check".to_string(),
            chunk_size: 0,
            timeout: Duration::from_secs(10),
            max_concurrent_uploads: 3,
            retry_count: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            allowed_file_types: Vec::new(),
        }
    }
}

/// Persistent store tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Key namespace prefix
    pub prefix: String,
    /// Hard quota in bytes
    pub max_storage_size: u64,
    /// Usage percentage that triggers auto cleanup
    pub cleanup_threshold: f64,
    /// Eviction policy
    pub cleanup_strategy: EvictionPolicy,
    /// Run cleanup automatically when the threshold is crossed
    pub auto_cleanup: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            prefix: "filechunk".to_string(),
            max_storage_size: 50 * 1024 * 1024,
            cleanup_threshold: 80.0,
            cleanup_strategy: EvictionPolicy::Lru,
            auto_cleanup: true,
        }
    }
}

/// Named compression presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionProfile {
    Speed,
    Balanced,
    Compression,
    MaximumCompression,
    Custom,
}

/// Adaptive compression tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub profile: CompressionProfile,
    /// Files below this size are never compressed
    pub min_size: u64,
    /// Persist learned stats every this many samples
    pub persist_every: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            profile: CompressionProfile::Balanced,
            min_size: 1024,
            persist_every: 10,
        }
    }
}

/// Endpoint connector tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdnConfig {
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_millis")]
    pub status_refresh_interval: Duration,
    /// Consecutive failures before an endpoint goes offline
    pub failover_threshold: u32,
    /// Invalidation retry budget
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_retry_delay: Duration,
    pub backoff_factor: f64,
    /// Path probed by the health loop
    pub test_path: String,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            status_refresh_interval: Duration::from_secs(300),
            failover_threshold: 3,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            test_path: "/health".to_string(),
        }
    }
}

/// Top-level configuration tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileChunkConfig {
    pub transport: TransportSection,
    pub storage: StorageConfig,
    pub compression: CompressionConfig,
    pub cdn: CdnConfig,
}

/// Wrapper matching the `transport.http.*` key namespace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportSection {
    pub http: TransportConfig,
}

impl FileChunkConfig {
    /// Read a value by dot path, e.g. `transport.http.chunkSize`.
    pub fn get(&self, path: &str) -> Option<Value> {
        let tree = serde_json::to_value(self).ok()?;
        let mut node = &tree;
        for segment in path.split('.') {
            node = node.get(key_for(segment))?;
        }
        Some(node.clone())
    }

    /// Set a value by dot path. The assignment is validated by round-tripping
    /// the whole tree back into its typed form.
    pub fn set(&mut self, path: &str, value: Value) -> FcResult<()> {
        let mut tree = serde_json::to_value(&*self)
            .map_err(|e| FileChunkError::config(e.to_string()))?;

        let mut node = &mut tree;
        let segments: Vec<&str> = path.split('.').collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(FileChunkError::config(format!("bad config path {path:?}")));
        }
        for segment in &segments[..segments.len() - 1] {
            node = node
                .get_mut(key_for(segment))
                .ok_or_else(|| FileChunkError::config(format!("unknown config path {path:?}")))?;
        }
        let leaf = key_for(segments[segments.len() - 1]);
        let object = node
            .as_object_mut()
            .ok_or_else(|| FileChunkError::config(format!("unknown config path {path:?}")))?;
        if !object.contains_key(&leaf) {
            return Err(FileChunkError::config(format!("unknown config key {path:?}")));
        }
        object.insert(leaf, value);

        *self = serde_json::from_value(tree)
            .map_err(|e| FileChunkError::config(format!("invalid value for {path}: {e}")))?;
        Ok(())
    }
}

/// Map camelCase public key names onto the snake_case serde fields.
fn key_for(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len() + 4);
    for ch in segment.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dot_path_roundtrip() {
        let mut config = FileChunkConfig::default();
        config
            .set("transport.http.chunkSize", json!(2_097_152))
            .unwrap();
        assert_eq!(config.transport.http.chunk_size, 2_097_152);
        assert_eq!(
            config.get("transport.http.chunkSize"),
            Some(json!(2_097_152))
        );
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut config = FileChunkConfig::default();
        let err = config
            .set("transport.http.noSuchKnob", json!(1))
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Config);
    }

    #[test]
    fn bad_value_type_is_rejected() {
        let mut config = FileChunkConfig::default();
        let err = config
            .set("storage.maxStorageSize", json!("plenty"))
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Config);
        // Original value survives a failed set
        assert_eq!(config.storage.max_storage_size, 50 * 1024 * 1024);
    }

    #[test]
    fn profile_uses_kebab_case_names() {
        let mut config = FileChunkConfig::default();
        config
            .set("compression.profile", json!("maximum-compression"))
            .unwrap();
        assert_eq!(
            config.compression.profile,
            CompressionProfile::MaximumCompression
        );
    }
}
