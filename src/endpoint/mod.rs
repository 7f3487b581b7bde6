//! CDN endpoint connector
//!
//! Maintains a ranked pool of upload/download endpoints with periodic health
//! probing, failure-count driven failover, offline recovery, and cache
//! invalidation with exponential backoff.

use crate::config::CdnConfig;
use crate::error::{FcResult, FileChunkError};
use crate::platform::Transport;
use chrono::Utc;
use dashmap::DashMap;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One upload/download target
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub base_url: String,
    /// Invalidation API endpoint, when the provider has one
    pub api_endpoint: Option<String>,
    pub auth: Option<AuthMaterial>,
}

/// Provider auth headers for the invalidation API
#[derive(Debug, Clone, Default)]
pub struct AuthMaterial {
    pub api_key: Option<String>,
    pub bearer_token: Option<String>,
}

impl AuthMaterial {
    fn headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(key) = &self.api_key {
            headers.push(("X-API-Key".to_string(), key.clone()));
        }
        if let Some(token) = &self.bearer_token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        headers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Active,
    Degraded,
    Offline,
}

/// Mutable health bookkeeping per endpoint
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub status: EndpointStatus,
    pub failure_count: u32,
    pub last_failure_at: Option<i64>,
    pub last_check_at: Option<i64>,
    pub latency_ms: Option<u64>,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            status: EndpointStatus::Active,
            failure_count: 0,
            last_failure_at: None,
            last_check_at: None,
            latency_ms: None,
        }
    }
}

/// Failover notification: `(old_id, new_id)`
pub type FailoverCallback = Box<dyn Fn(&str, &str) + Send + Sync>;
/// All-endpoints-failed notification
pub type AllFailedCallback = Box<dyn Fn() + Send + Sync>;

/// Ranked endpoint pool with health monitoring
pub struct EndpointPool {
    config: CdnConfig,
    transport: Arc<dyn Transport>,
    /// Rank order is the configured order
    endpoints: Vec<Endpoint>,
    health: DashMap<String, EndpointHealth>,
    active_id: Mutex<Option<String>>,
    failover_callbacks: Mutex<Vec<FailoverCallback>>,
    all_failed_callbacks: Mutex<Vec<AllFailedCallback>>,
    cancel: CancellationToken,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl EndpointPool {
    pub fn new(
        config: CdnConfig,
        transport: Arc<dyn Transport>,
        endpoints: Vec<Endpoint>,
    ) -> Arc<Self> {
        let health = DashMap::new();
        for endpoint in &endpoints {
            health.insert(endpoint.id.clone(), EndpointHealth::default());
        }
        let active_id = endpoints.first().map(|e| e.id.clone());

        Arc::new(Self {
            config,
            transport,
            endpoints,
            health,
            active_id: Mutex::new(active_id),
            failover_callbacks: Mutex::new(Vec::new()),
            all_failed_callbacks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            loop_handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the health and recovery loops.
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let health_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(pool.config.health_check_interval) => {
                        pool.run_health_check_once().await;
                    }
                    _ = pool.cancel.cancelled() => break,
                }
            }
        });

        let pool = Arc::clone(self);
        let recovery_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(pool.config.status_refresh_interval) => {
                        pool.run_recovery_once().await;
                    }
                    _ = pool.cancel.cancelled() => break,
                }
            }
        });

        let mut handles = self.loop_handles.lock().expect("loop handles poisoned");
        handles.push(health_handle);
        handles.push(recovery_handle);
        info!(
            target: "endpoint",
            endpoints = self.endpoints.len(),
            interval_secs = self.config.health_check_interval.as_secs(),
            "Endpoint monitoring started"
        );
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        let mut handles = self.loop_handles.lock().expect("loop handles poisoned");
        for handle in handles.drain(..) {
            handle.abort();
        }
    }

    pub fn on_failover(&self, callback: FailoverCallback) {
        self.failover_callbacks
            .lock()
            .expect("failover callbacks poisoned")
            .push(callback);
    }

    pub fn on_all_failed(&self, callback: AllFailedCallback) {
        self.all_failed_callbacks
            .lock()
            .expect("all-failed callbacks poisoned")
            .push(callback);
    }

    /// Currently elected endpoint.
    pub fn active_endpoint(&self) -> Option<Endpoint> {
        let active_id = self.active_id.lock().expect("active id poisoned");
        active_id
            .as_ref()
            .and_then(|id| self.endpoints.iter().find(|e| &e.id == id))
            .cloned()
    }

    /// Manually elect an endpoint by id.
    pub fn switch_to(&self, id: &str) -> FcResult<()> {
        if !self.endpoints.iter().any(|e| e.id == id) {
            return Err(FileChunkError::input(format!("unknown endpoint {id:?}")));
        }
        let previous = {
            let mut active_id = self.active_id.lock().expect("active id poisoned");
            let previous = active_id.clone();
            *active_id = Some(id.to_string());
            previous
        };
        if previous.as_deref() != Some(id) {
            info!(target: "endpoint", endpoint = id, "Endpoint switched");
        }
        Ok(())
    }

    /// Health snapshot of every endpoint in rank order.
    pub fn status(&self) -> Vec<(Endpoint, EndpointHealth)> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                let health = self
                    .health
                    .get(&endpoint.id)
                    .map(|entry| entry.clone())
                    .unwrap_or_default();
                (endpoint.clone(), health)
            })
            .collect()
    }

    /// Resolve a file URL on the active (or forced) endpoint. The file name
    /// is percent-encoded; the hash is hex and passed through.
    pub fn resolve_url(
        &self,
        file_hash: &str,
        file_name: &str,
        force_id: Option<&str>,
    ) -> FcResult<String> {
        let endpoint = match force_id {
            Some(id) => self
                .endpoints
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .ok_or_else(|| FileChunkError::input(format!("unknown endpoint {id:?}")))?,
            None => self
                .active_endpoint()
                .ok_or_else(|| FileChunkError::dependency("no endpoints configured"))?,
        };

        let encoded_name = utf8_percent_encode(file_name, NON_ALPHANUMERIC).to_string();
        Ok(format!(
            "{}/file/{file_hash}/{encoded_name}",
            endpoint.base_url.trim_end_matches('/')
        ))
    }

    /// Walk non-offline endpoints in rank order probing `path`; the first one
    /// answering OK wins. With none left, all-failed callbacks fire.
    pub async fn resolve_with_fallback(&self, path: &str) -> FcResult<String> {
        for endpoint in &self.endpoints {
            let offline = self
                .health
                .get(&endpoint.id)
                .map(|h| h.status == EndpointStatus::Offline)
                .unwrap_or(false);
            if offline {
                continue;
            }

            let url = format!("{}{path}", endpoint.base_url.trim_end_matches('/'));
            match self
                .transport
                .head(&url, &[], Duration::from_secs(10))
                .await
            {
                Ok(probe) if probe.is_available() => return Ok(url),
                Ok(_) | Err(_) => {
                    debug!(target: "endpoint", endpoint = %endpoint.id, path, "Fallback probe failed");
                }
            }
        }

        self.notify_all_failed();
        Err(FileChunkError::network("no endpoint can serve the file").retryable(false))
    }

    /// Record an endpoint failure observed outside the health loop (for
    /// example a chunk upload error). Shares the threshold and election
    /// logic with the probe path.
    pub fn report_failure(&self, id: &str) {
        self.record_failure(id);
    }

    /// Reset the failure counter after a successful use.
    pub fn report_success(&self, id: &str) {
        if let Some(mut health) = self.health.get_mut(id) {
            health.failure_count = 0;
            if health.status == EndpointStatus::Degraded {
                health.status = EndpointStatus::Active;
            }
        }
    }

    /// One pass of the health loop over all endpoints.
    pub async fn run_health_check_once(&self) {
        for endpoint in &self.endpoints {
            let url = format!(
                "{}{}?t={}",
                endpoint.base_url.trim_end_matches('/'),
                self.config.test_path,
                Utc::now().timestamp_millis()
            );
            let headers = [("Cache-Control".to_string(), "no-store".to_string())];
            let result = self
                .transport
                .head(&url, &headers, Duration::from_secs(10))
                .await;

            let now = Utc::now().timestamp_millis();
            match result {
                Ok(probe) if probe.is_available() => {
                    if let Some(mut health) = self.health.get_mut(&endpoint.id) {
                        health.failure_count = 0;
                        health.last_check_at = Some(now);
                        health.latency_ms = Some(probe.latency.as_millis() as u64);
                        if health.status != EndpointStatus::Active {
                            info!(target: "endpoint", endpoint = %endpoint.id, "Endpoint healthy again");
                            health.status = EndpointStatus::Active;
                        }
                    }
                }
                Ok(_) | Err(_) => {
                    if let Some(mut health) = self.health.get_mut(&endpoint.id) {
                        health.last_check_at = Some(now);
                    }
                    self.record_failure(&endpoint.id);
                }
            }
        }
    }

    /// One pass of the recovery loop over offline endpoints.
    pub async fn run_recovery_once(&self) {
        for endpoint in &self.endpoints {
            let offline = self
                .health
                .get(&endpoint.id)
                .map(|h| h.status == EndpointStatus::Offline)
                .unwrap_or(false);
            if !offline {
                continue;
            }

            let url = format!(
                "{}{}?t={}",
                endpoint.base_url.trim_end_matches('/'),
                self.config.test_path,
                Utc::now().timestamp_millis()
            );
            let headers = [("Cache-Control".to_string(), "no-store".to_string())];
            if let Ok(probe) = self
                .transport
                .head(&url, &headers, Duration::from_secs(10))
                .await
            {
                if probe.is_available() {
                    if let Some(mut health) = self.health.get_mut(&endpoint.id) {
                        health.status = EndpointStatus::Active;
                        health.failure_count = 0;
                        health.last_check_at = Some(Utc::now().timestamp_millis());
                    }
                    info!(target: "endpoint", endpoint = %endpoint.id, "Endpoint recovered");

                    let has_active = self.active_id.lock().expect("active id poisoned").is_some();
                    if !has_active {
                        let _ = self.switch_to(&endpoint.id);
                    }
                }
            }
        }
    }

    /// POST an invalidation request for a set of URLs, retrying under
    /// exponential backoff.
    pub async fn invalidate(&self, urls: &[String], id: Option<&str>) -> FcResult<()> {
        let endpoint = match id {
            Some(id) => self
                .endpoints
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .ok_or_else(|| FileChunkError::input(format!("unknown endpoint {id:?}")))?,
            None => self
                .active_endpoint()
                .ok_or_else(|| FileChunkError::dependency("no endpoints configured"))?,
        };
        let api_endpoint = endpoint.api_endpoint.clone().ok_or_else(|| {
            FileChunkError::config(format!("endpoint {} has no invalidation API", endpoint.id))
        })?;

        let headers = endpoint
            .auth
            .as_ref()
            .map(|auth| auth.headers())
            .unwrap_or_default();
        let body = json!({ "urls": urls, "provider": endpoint.name });
        let cancel = self.cancel.clone();

        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(
                    self.config.retry_delay,
                    self.config.backoff_factor,
                    attempt - 1,
                    self.config.max_retry_delay,
                );
                debug!(
                    target: "endpoint",
                    endpoint = %endpoint.id,
                    attempt,
                    delay_ms = delay.as_millis(),
                    "Retrying invalidation"
                );
                tokio::time::sleep(delay).await;
            }

            match self
                .transport
                .post_json(&api_endpoint, &headers, &body, Duration::from_secs(30), &cancel)
                .await
            {
                Ok(response) if response.is_success() => {
                    info!(
                        target: "endpoint",
                        endpoint = %endpoint.id,
                        urls = urls.len(),
                        "Cache invalidation accepted"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    last_error = Some(FileChunkError::server(format!(
                        "invalidation rejected with HTTP {}",
                        response.status
                    )));
                }
                Err(err) => {
                    if err.is_cancelled() {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| FileChunkError::network("invalidation failed")))
    }

    fn record_failure(&self, id: &str) {
        let now = Utc::now().timestamp_millis();
        let went_offline = {
            let Some(mut health) = self.health.get_mut(id) else {
                return;
            };
            health.failure_count += 1;
            health.last_failure_at = Some(now);
            if health.failure_count >= self.config.failover_threshold
                && health.status != EndpointStatus::Offline
            {
                health.status = EndpointStatus::Offline;
                true
            } else {
                if health.status == EndpointStatus::Active {
                    health.status = EndpointStatus::Degraded;
                }
                false
            }
        };

        if !went_offline {
            return;
        }
        warn!(target: "endpoint", endpoint = id, "Endpoint marked offline");

        let is_active = self
            .active_id
            .lock()
            .expect("active id poisoned")
            .as_deref()
            == Some(id);
        if is_active {
            self.elect_new_active(id);
        }
    }

    /// First available endpoint in rank order becomes the new active.
    fn elect_new_active(&self, failed_id: &str) {
        let replacement = self.endpoints.iter().find(|endpoint| {
            endpoint.id != failed_id
                && self
                    .health
                    .get(&endpoint.id)
                    .map(|h| {
                        h.status != EndpointStatus::Offline
                            && h.failure_count < self.config.failover_threshold
                    })
                    .unwrap_or(false)
        });

        match replacement {
            Some(endpoint) => {
                {
                    let mut active_id = self.active_id.lock().expect("active id poisoned");
                    *active_id = Some(endpoint.id.clone());
                }
                info!(
                    target: "endpoint",
                    from = failed_id,
                    to = %endpoint.id,
                    "Failed over to backup endpoint"
                );
                let callbacks = self
                    .failover_callbacks
                    .lock()
                    .expect("failover callbacks poisoned");
                for callback in callbacks.iter() {
                    callback(failed_id, &endpoint.id);
                }
            }
            None => {
                {
                    let mut active_id = self.active_id.lock().expect("active id poisoned");
                    *active_id = None;
                }
                self.notify_all_failed();
            }
        }
    }

    fn notify_all_failed(&self) {
        warn!(target: "endpoint", "All endpoints failed");
        let callbacks = self
            .all_failed_callbacks
            .lock()
            .expect("all-failed callbacks poisoned");
        for callback in callbacks.iter() {
            callback();
        }
    }
}

impl Drop for EndpointPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn backoff_delay(base: Duration, factor: f64, attempt: u32, cap: Duration) -> Duration {
    let millis = base.as_millis() as f64 * factor.powi(attempt as i32);
    Duration::from_millis(millis as u64).min(cap)
}
