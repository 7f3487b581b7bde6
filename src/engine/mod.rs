//! Upload engine
//!
//! Orchestrates one upload end to end: fingerprint, dedup precheck, chunk
//! plan, concurrent chunk transfer with retry and endpoint failover, merge,
//! and resume from persisted session state.

mod progress;
mod session;
mod wire;

pub use progress::{ProgressCallback, ProgressTracker, ProgressUpdate};
pub use session::{
    build_plan, derive_chunk_size, ChunkDescriptor, ChunkState, SessionStatus, UploadSession,
};
pub use wire::{CheckRequest, CheckResponse, ChunkResponse, MergeRequest, MergeResponse};

use crate::compression::{Compressor, FileProfile};
use crate::config::TransportConfig;
use crate::endpoint::EndpointPool;
use crate::error::{ErrorEnvelope, FcResult, FileChunkError};
use crate::hasher::{HashInput, HashOptions, HashPool};
use crate::platform::{ContentSource, FormField, PlatformKind, Transport, TransportResponse};
use crate::store::Store;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Merge retry budget when the server reports an incomplete chunk set
const MERGE_RETRY_BUDGET: u32 = 3;

/// Kernel event hook: `(topic, payload)`
pub type EventSink = Arc<dyn Fn(&str, serde_json::Value) + Send + Sync>;
/// Host signing hook: takes the request URL, returns extra headers
pub type CredentialCallback = Arc<dyn Fn(&str) -> Vec<(String, String)> + Send + Sync>;
/// Failure callback receiving the caller-facing envelope
pub type ErrorCallback = Arc<dyn Fn(ErrorEnvelope) + Send + Sync>;

/// Per-call options for [`UploadEngine::upload`]
#[derive(Clone, Default)]
pub struct UploadOptions {
    pub on_progress: Option<Arc<dyn ProgressCallback>>,
    pub on_error: Option<ErrorCallback>,
    /// Overrides the configured per-chunk retry budget
    pub retry_count: Option<u32>,
    pub cancel: Option<CancellationToken>,
    /// Applied verbatim to every outgoing request
    pub credential_callback: Option<CredentialCallback>,
}

/// Result of one upload call
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub success: bool,
    pub url: Option<String>,
    pub error: Option<ErrorEnvelope>,
}

/// Resumable chunked upload engine
pub struct UploadEngine {
    config: TransportConfig,
    platform: PlatformKind,
    transport: Arc<dyn Transport>,
    store: Arc<Store>,
    hasher: Arc<HashPool>,
    compressor: Arc<Compressor>,
    endpoints: Arc<EndpointPool>,
    events: std::sync::Mutex<Option<EventSink>>,
    cancel: CancellationToken,
    paused: AtomicBool,
}

impl UploadEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TransportConfig,
        platform: PlatformKind,
        transport: Arc<dyn Transport>,
        store: Arc<Store>,
        hasher: Arc<HashPool>,
        compressor: Arc<Compressor>,
        endpoints: Arc<EndpointPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            platform,
            transport,
            store,
            hasher,
            compressor,
            endpoints,
            events: std::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            paused: AtomicBool::new(false),
        })
    }

    /// Route engine events into the kernel bus (or any other sink).
    pub fn set_event_sink(&self, sink: EventSink) {
        *self.events.lock().expect("event sink poisoned") = Some(sink);
    }

    /// Cancel every in-flight upload on this engine. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Hold back new chunk admissions; running requests finish first.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn emit(&self, topic: &str, payload: serde_json::Value) {
        let sink = self.events.lock().expect("event sink poisoned").clone();
        if let Some(sink) = sink {
            sink(topic, payload);
        }
    }

    /// Upload a file, resuming any persisted session for its fingerprint.
    pub async fn upload(
        self: &Arc<Self>,
        source: Arc<dyn ContentSource>,
        opts: UploadOptions,
    ) -> UploadOutcome {
        let cancel = self.linked_cancel(&opts);
        match self.run_upload(source, &opts, &cancel).await {
            Ok(url) => UploadOutcome {
                success: true,
                url: Some(url),
                error: None,
            },
            Err(err) => {
                let envelope = err.envelope();
                if let Some(on_error) = &opts.on_error {
                    on_error(envelope.clone());
                }
                UploadOutcome {
                    success: false,
                    url: None,
                    error: Some(envelope),
                }
            }
        }
    }

    fn linked_cancel(&self, opts: &UploadOptions) -> CancellationToken {
        let token = self.cancel.child_token();
        if let Some(external) = &opts.cancel {
            let external = external.clone();
            let linked = token.clone();
            tokio::spawn(async move {
                external.cancelled().await;
                linked.cancel();
            });
        }
        token
    }

    async fn run_upload(
        self: &Arc<Self>,
        source: Arc<dyn ContentSource>,
        opts: &UploadOptions,
        cancel: &CancellationToken,
    ) -> FcResult<String> {
        self.validate_input(source.as_ref())?;

        info!(
            target: "engine",
            file = source.name(),
            size = source.len(),
            "Starting upload"
        );

        let fingerprint = self
            .hasher
            .hash(
                HashInput::Source(Arc::clone(&source)),
                HashOptions {
                    cancel: Some(cancel.clone()),
                    ..Default::default()
                },
            )
            .await?;
        debug!(target: "engine", fingerprint = %fingerprint, "File fingerprinted");

        let network = self.compressor.network().snapshot();
        let chunk_size =
            session::derive_chunk_size(source.len(), network.class, self.config.chunk_size);

        // Resume or rebuild the persisted session
        let persisted = self.load_session(&fingerprint).await;
        let mut session = match persisted {
            Some(existing) if existing.status == SessionStatus::Done && existing.url.is_some() => {
                info!(target: "engine", fingerprint = %fingerprint, "Session already complete");
                return Ok(existing.url.expect("checked above"));
            }
            Some(mut existing) if existing.matches(&fingerprint, source.len(), chunk_size) => {
                // Rehydrate: transient chunk states reset; a terminal status
                // restarts the machine while keeping uploaded rows
                if existing.status.is_terminal() {
                    existing.status = SessionStatus::New;
                }
                existing.reset_transient_chunks();
                info!(
                    target: "engine",
                    fingerprint = %fingerprint,
                    pending = existing.pending_chunks().len(),
                    total = existing.total_chunks(),
                    "Resuming persisted session"
                );
                existing
            }
            _ => UploadSession::new(
                fingerprint.clone(),
                source.name().to_string(),
                source.len(),
                source.mime_hint().map(|m| m.to_string()),
                chunk_size,
            ),
        };

        let result = self.drive_session(&source, &mut session, opts, cancel).await;

        if let Err(err) = &result {
            let terminal = if err.is_cancelled() {
                SessionStatus::Cancelled
            } else {
                SessionStatus::Failed
            };
            let _ = session.transition(terminal);
            // The terminal row is flushed before the call returns, but a
            // dedup-style run that never persisted anything stays rowless
            if session.status == terminal && self.load_session(&fingerprint).await.is_some() {
                self.persist_session(&session).await;
            }
            error!(
                target: "engine",
                fingerprint = %session.file_fingerprint,
                code = err.code.as_str(),
                error = %err,
                "Upload did not complete"
            );
        }

        result
    }

    /// Probing through merge for one session.
    async fn drive_session(
        self: &Arc<Self>,
        source: &Arc<dyn ContentSource>,
        session: &mut UploadSession,
        opts: &UploadOptions,
        cancel: &CancellationToken,
    ) -> FcResult<String> {
        let had_rows = self.load_session(&session.file_fingerprint).await.is_some();
        session.transition(SessionStatus::Probing)?;
        if had_rows {
            self.persist_session(session).await;
        }

        // Instant upload: the server already has this fingerprint
        if let Some(url) = self
            .check_dedup(&session.file_fingerprint, opts, cancel)
            .await?
        {
            info!(target: "engine", url = %url, "Instant upload hit");
            session.url = Some(url.clone());
            session.transition(SessionStatus::Done)?;
            if had_rows {
                self.persist_session(session).await;
            }
            let tracker = ProgressTracker::new(session.file_size, 1);
            tracker.preload_completed(1, session.file_size);
            self.report_progress(&tracker, opts);
            return Ok(url);
        }

        session.transition(SessionStatus::Uploading)?;
        session.endpoint_id = self.endpoints.active_endpoint().map(|e| e.id);
        self.persist_session(session).await;

        self.transfer_chunks(source, session, opts, cancel).await?;
        self.merge(source, session, opts, cancel).await
    }

    fn validate_input(&self, source: &dyn ContentSource) -> FcResult<()> {
        if self.config.allowed_file_types.is_empty() {
            return Ok(());
        }
        let extension = source
            .name()
            .rsplit('.')
            .next()
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if self
            .config
            .allowed_file_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
        {
            Ok(())
        } else {
            Err(FileChunkError::input(format!(
                "file type {extension:?} is not allowed"
            )))
        }
    }

    async fn load_session(&self, fingerprint: &str) -> Option<UploadSession> {
        let key = UploadSession::store_key(fingerprint);
        match self.store.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(session) => Some(session),
                Err(err) => {
                    warn!(target: "engine", error = %err, "Discarding unreadable session row");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(target: "engine", error = %err, "Failed to load session row");
                None
            }
        }
    }

    async fn persist_session(&self, session: &UploadSession) {
        let key = UploadSession::store_key(&session.file_fingerprint);
        match serde_json::to_vec(session) {
            Ok(bytes) => {
                if let Err(err) = self.store.save(&key, &bytes).await {
                    warn!(target: "engine", error = %err, "Failed to persist session");
                } else {
                    self.emit(
                        "upload:sessionPersisted",
                        json!({
                            "sessionId": session.session_id,
                            "status": session.status,
                        }),
                    );
                }
            }
            Err(err) => warn!(target: "engine", error = %err, "Failed to serialize session"),
        }
    }

    fn request_headers(&self, url: &str, opts: &UploadOptions) -> Vec<(String, String)> {
        opts.credential_callback
            .as_ref()
            .map(|callback| callback(url))
            .unwrap_or_default()
    }

    /// POST `{hash}` to the check endpoint; `Some(url)` means the artifact
    /// already exists. Transport failures degrade to a miss.
    async fn check_dedup(
        &self,
        fingerprint: &str,
        opts: &UploadOptions,
        cancel: &CancellationToken,
    ) -> FcResult<Option<String>> {
        let endpoint = self
            .endpoints
            .active_endpoint()
            .ok_or_else(|| FileChunkError::dependency("no active upload endpoint"))?;
        let url = format!(
            "{}{}",
            endpoint.base_url.trim_end_matches('/'),
            self.config.check_url
        );
        let body = serde_json::to_value(CheckRequest {
            hash: fingerprint.to_string(),
        })?;
        let headers = self.request_headers(&url, opts);

        match self
            .transport
            .post_json(&url, &headers, &body, self.config.timeout, cancel)
            .await
        {
            Ok(response) if response.is_success() => {
                let check: CheckResponse = response.json()?;
                if check.exists {
                    Ok(check.url)
                } else {
                    Ok(None)
                }
            }
            Ok(response) => {
                debug!(target: "engine", status = response.status, "Dedup check rejected");
                Ok(None)
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                warn!(target: "engine", error = %err, "Dedup check failed, proceeding with upload");
                Ok(None)
            }
        }
    }

    /// Upload every pending chunk with bounded concurrency.
    async fn transfer_chunks(
        self: &Arc<Self>,
        source: &Arc<dyn ContentSource>,
        session: &mut UploadSession,
        opts: &UploadOptions,
        cancel: &CancellationToken,
    ) -> FcResult<()> {
        let pending = session.pending_chunks();
        if pending.is_empty() {
            return Ok(());
        }

        let tracker = ProgressTracker::new(session.file_size, session.total_chunks());
        let completed = session
            .plan
            .iter()
            .filter(|c| c.state == ChunkState::Uploaded)
            .count();
        tracker.preload_completed(completed, session.uploaded_bytes());

        let concurrency = self
            .config
            .max_concurrent_uploads
            .min(self.platform.connection_limit())
            .min(pending.len())
            .max(1);
        info!(
            target: "engine::chunk",
            pending = pending.len(),
            total = session.total_chunks(),
            concurrency,
            "Uploading chunks"
        );

        let queue: Arc<Mutex<VecDeque<u32>>> = Arc::new(Mutex::new(pending.into()));
        let shared = Arc::new(Mutex::new(session.clone()));

        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let engine = Arc::clone(self);
            let source = Arc::clone(source);
            let queue = Arc::clone(&queue);
            let shared = Arc::clone(&shared);
            let tracker = Arc::clone(&tracker);
            let opts = opts.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                engine
                    .chunk_worker(source, queue, shared, tracker, opts, cancel)
                    .await
            }));
        }

        let mut failure: Option<FileChunkError> = None;
        for worker in workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if failure.is_none() || err.is_cancelled() {
                        failure = Some(err);
                    }
                }
                Err(join_err) => {
                    failure = Some(FileChunkError::worker(format!(
                        "chunk worker crashed: {join_err}"
                    )));
                }
            }
        }

        *session = shared.lock().await.clone();

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// One admission slot: pull the next pending chunk by index until the
    /// queue drains.
    async fn chunk_worker(
        self: Arc<Self>,
        source: Arc<dyn ContentSource>,
        queue: Arc<Mutex<VecDeque<u32>>>,
        shared: Arc<Mutex<UploadSession>>,
        tracker: Arc<ProgressTracker>,
        opts: UploadOptions,
        cancel: CancellationToken,
    ) -> FcResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(FileChunkError::cancelled());
            }
            self.wait_if_paused(&shared, &cancel).await?;

            let Some(index) = queue.lock().await.pop_front() else {
                return Ok(());
            };

            let descriptor = {
                let mut session = shared.lock().await;
                session.set_chunk_state(index, ChunkState::InFlight);
                session.plan[index as usize].clone()
            };
            tracker.start_chunk();

            match self
                .upload_chunk_with_retry(&source, &descriptor, &shared, &opts, &cancel)
                .await
            {
                Ok(()) => {
                    tracker.complete_chunk(descriptor.length);
                    {
                        let mut session = shared.lock().await;
                        session.set_chunk_state(index, ChunkState::Uploaded);
                        self.persist_session(&session).await;
                    }
                    self.emit(
                        "upload:chunkCompleted",
                        json!({ "chunkIndex": index, "length": descriptor.length }),
                    );
                    self.report_progress(&tracker, &opts);
                }
                Err(err) => {
                    tracker.abandon_chunk();
                    let mut session = shared.lock().await;
                    session.set_chunk_state(index, ChunkState::Failed);
                    self.persist_session(&session).await;
                    return Err(err);
                }
            }
        }
    }

    async fn wait_if_paused(
        &self,
        shared: &Arc<Mutex<UploadSession>>,
        cancel: &CancellationToken,
    ) -> FcResult<()> {
        if !self.is_paused() {
            return Ok(());
        }

        {
            let mut session = shared.lock().await;
            if session.status == SessionStatus::Uploading {
                session.transition(SessionStatus::Paused)?;
                self.persist_session(&session).await;
                info!(target: "engine", "Upload paused");
            }
        }

        while self.is_paused() {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = cancel.cancelled() => return Err(FileChunkError::cancelled()),
            }
        }

        let mut session = shared.lock().await;
        if session.status == SessionStatus::Paused {
            session.transition(SessionStatus::Uploading)?;
            self.persist_session(&session).await;
            info!(target: "engine", "Upload resumed");
        }
        Ok(())
    }

    fn report_progress(&self, tracker: &Arc<ProgressTracker>, opts: &UploadOptions) {
        let update = tracker.snapshot();
        self.emit(
            "upload:progress",
            json!({ "uploaded": update.bytes_sent, "percent": update.percent }),
        );
        if let Some(on_progress) = &opts.on_progress {
            on_progress.on_progress(update);
        }
    }

    /// Upload one chunk, retrying with exponential backoff and following
    /// endpoint failover between attempts.
    async fn upload_chunk_with_retry(
        &self,
        source: &Arc<dyn ContentSource>,
        descriptor: &ChunkDescriptor,
        shared: &Arc<Mutex<UploadSession>>,
        opts: &UploadOptions,
        cancel: &CancellationToken,
    ) -> FcResult<()> {
        let retry_budget = opts.retry_count.unwrap_or(self.config.retry_count);

        let raw = source
            .read_range(descriptor.offset, descriptor.length)
            .await?;

        // Adaptive compression on the chunk body
        let profile = FileProfile::from_source(source.as_ref());
        let (body, encoding) = if !raw.is_empty() && self.compressor.should_compress(&profile) {
            match self.compressor.compress(raw.clone(), &profile).await {
                Ok((compressed, telemetry))
                    if telemetry.compressed_size < telemetry.original_size =>
                {
                    self.compressor.record_result(&profile, &telemetry).await;
                    (compressed, Some("gzip"))
                }
                Ok((_, telemetry)) => {
                    self.compressor.record_result(&profile, &telemetry).await;
                    (raw, None)
                }
                Err(err) => {
                    warn!(target: "engine::chunk", error = %err, "Compression failed, sending raw");
                    (raw, None)
                }
            }
        } else {
            (raw, None)
        };

        let (session_id, file_name, mut known_endpoint) = {
            let session = shared.lock().await;
            (
                session.session_id.clone(),
                session.file_name.clone(),
                session.endpoint_id.clone(),
            )
        };

        for attempt in 0..=retry_budget {
            if cancel.is_cancelled() {
                return Err(FileChunkError::cancelled());
            }
            if attempt > 0 {
                let delay = retry_delay(
                    self.config.retry_base_delay,
                    attempt,
                    self.config.retry_max_delay,
                );
                debug!(
                    target: "engine::chunk",
                    chunk = descriptor.index,
                    attempt,
                    delay_ms = delay.as_millis(),
                    "Retrying chunk upload"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(FileChunkError::cancelled()),
                }
            }

            let endpoint = self
                .endpoints
                .active_endpoint()
                .ok_or_else(|| FileChunkError::dependency("all upload endpoints failed"))?;
            if known_endpoint.as_deref() != Some(endpoint.id.as_str()) {
                if known_endpoint.is_some() {
                    self.emit(
                        "upload:endpointSwitched",
                        json!({ "from": known_endpoint, "to": endpoint.id }),
                    );
                }
                known_endpoint = Some(endpoint.id.clone());
                let mut session = shared.lock().await;
                session.endpoint_id = Some(endpoint.id.clone());
                session.touch();
            }

            let url = format!(
                "{}{}",
                endpoint.base_url.trim_end_matches('/'),
                self.config.upload_url
            );
            let headers = self.request_headers(&url, opts);
            let mut fields = vec![
                FormField::text("fileId", session_id.clone()),
                FormField::text("chunkIndex", descriptor.index.to_string()),
            ];
            if let Some(encoding) = encoding {
                fields.push(FormField::text("chunkEncoding", encoding));
            }
            fields.push(FormField::bytes(
                "chunk",
                file_name.clone(),
                Some("application/octet-stream".to_string()),
                body.clone(),
            ));

            shared.lock().await.record_attempt(descriptor.index);

            let started = Instant::now();
            match self
                .transport
                .post_multipart(&url, &headers, fields, self.config.timeout, cancel)
                .await
            {
                Ok(response) if response.is_success() => {
                    self.endpoints.report_success(&endpoint.id);
                    self.compressor
                        .network()
                        .record(body.len() as u64, started.elapsed());
                    debug!(
                        target: "engine::chunk",
                        chunk = descriptor.index,
                        bytes = body.len(),
                        "Chunk accepted"
                    );
                    return Ok(());
                }
                Ok(response) if response.is_client_error() => {
                    // Contract reject is fatal to the session
                    return Err(FileChunkError::server(format!(
                        "chunk {} rejected with HTTP {}",
                        descriptor.index, response.status
                    ))
                    .retryable(false));
                }
                Ok(response) => {
                    warn!(
                        target: "engine::chunk",
                        chunk = descriptor.index,
                        status = response.status,
                        attempt,
                        "Server error, will retry"
                    );
                    self.endpoints.report_failure(&endpoint.id);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) if err.retryable => {
                    warn!(
                        target: "engine::chunk",
                        chunk = descriptor.index,
                        attempt,
                        error = %err,
                        "Transport error, will retry"
                    );
                    self.endpoints.report_failure(&endpoint.id);
                }
                Err(err) => return Err(err),
            }
        }

        Err(FileChunkError::network(format!(
            "chunk {} failed after {} attempts",
            descriptor.index,
            retry_budget + 1
        ))
        .retryable(false))
    }

    /// Issue the merge, re-uploading reported gaps up to the merge budget.
    async fn merge(
        self: &Arc<Self>,
        source: &Arc<dyn ContentSource>,
        session: &mut UploadSession,
        opts: &UploadOptions,
        cancel: &CancellationToken,
    ) -> FcResult<String> {
        for merge_attempt in 0..MERGE_RETRY_BUDGET {
            session.transition(SessionStatus::Merging)?;
            self.persist_session(session).await;

            let endpoint = self
                .endpoints
                .active_endpoint()
                .ok_or_else(|| FileChunkError::dependency("no active upload endpoint"))?;
            let url = format!(
                "{}{}",
                endpoint.base_url.trim_end_matches('/'),
                self.config.merge_url
            );
            let body = serde_json::to_value(MergeRequest {
                file_id: session.session_id.clone(),
                file_name: session.file_name.clone(),
                file_size: session.file_size,
                file_type: session
                    .file_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                hash: session.file_fingerprint.clone(),
                chunk_count: session.total_chunks() as u32,
            })?;
            let headers = self.request_headers(&url, opts);

            let response = self
                .transport
                .post_json(&url, &headers, &body, self.config.timeout, cancel)
                .await;

            match response {
                Ok(response) if response.is_success() => {
                    let merge: MergeResponse = response.json()?;
                    let url = merge.url.ok_or_else(|| {
                        FileChunkError::server("merge response missing url").retryable(false)
                    })?;
                    session.url = Some(url.clone());
                    session.transition(SessionStatus::Done)?;
                    self.persist_session(session).await;
                    info!(target: "engine", url = %url, "Upload merged");
                    return Ok(url);
                }
                Ok(response)
                    if response.status == 400
                        && response
                            .body_text()
                            .to_ascii_lowercase()
                            .contains("incomplete") =>
                {
                    warn!(
                        target: "engine",
                        attempt = merge_attempt,
                        "Merge reports incomplete chunks, re-checking plan"
                    );
                    requeue_missing(&response, session);
                    session.transition(SessionStatus::Uploading)?;
                    self.persist_session(session).await;
                    self.transfer_chunks(source, session, opts, cancel).await?;
                }
                Ok(response) if response.is_client_error() => {
                    return Err(FileChunkError::server(format!(
                        "merge rejected with HTTP {}",
                        response.status
                    ))
                    .retryable(false));
                }
                Ok(response) => {
                    warn!(
                        target: "engine",
                        status = response.status,
                        attempt = merge_attempt,
                        "Merge failed, will retry"
                    );
                    session.transition(SessionStatus::Uploading)?;
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) if err.retryable => {
                    warn!(target: "engine", error = %err, "Merge transport error, will retry");
                    session.transition(SessionStatus::Uploading)?;
                }
                Err(err) => return Err(err),
            }
        }

        Err(FileChunkError::server("merge incomplete after retries").retryable(false))
    }
}

/// Mark reported-missing indices (or every non-uploaded row) pending again.
fn requeue_missing(response: &TransportResponse, session: &mut UploadSession) {
    #[derive(serde::Deserialize)]
    struct IncompleteBody {
        #[serde(default)]
        missing: Vec<u32>,
    }

    let missing = response
        .json::<IncompleteBody>()
        .map(|body| body.missing)
        .unwrap_or_default();

    if missing.is_empty() {
        session.reset_transient_chunks();
    } else {
        for index in missing {
            session.set_chunk_state(index, ChunkState::Pending);
        }
    }
}

fn retry_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let delay_ms = base_ms * (1 << attempt.min(10));
    Duration::from_millis(delay_ms).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compressor;
    use crate::config::{CdnConfig, CompressionConfig, StorageConfig};
    use crate::endpoint::{Endpoint, EndpointPool};
    use crate::hasher::{HashPool, HashPoolConfig};
    use crate::platform::{BytesSource, ProbeResponse};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::{HashMap, HashSet, VecDeque as StdVecDeque};
    use std::sync::Mutex as StdMutex;

    const MIB: u64 = 1024 * 1024;

    #[derive(Debug, Clone)]
    struct AcceptedChunk {
        base: String,
        file_id: String,
        index: u32,
    }

    enum MergeScript {
        Success,
        Incomplete(Vec<u32>),
    }

    /// In-memory server implementing the upload wire protocol
    struct MockServer {
        dedup_url: StdMutex<Option<String>>,
        final_url: String,
        accepted: StdMutex<Vec<AcceptedChunk>>,
        chunk_attempts: StdMutex<Vec<u32>>,
        merges: StdMutex<Vec<serde_json::Value>>,
        /// base-url prefix -> remaining failures (usize::MAX = always fail)
        fail_bases: StdMutex<HashMap<String, usize>>,
        fail_indices: StdMutex<HashSet<u32>>,
        merge_script: StdMutex<StdVecDeque<MergeScript>>,
        cancel_on_index: StdMutex<Option<u32>>,
    }

    impl MockServer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dedup_url: StdMutex::new(None),
                final_url: "https://cdn.example.com/file/done".to_string(),
                accepted: StdMutex::new(Vec::new()),
                chunk_attempts: StdMutex::new(Vec::new()),
                merges: StdMutex::new(Vec::new()),
                fail_bases: StdMutex::new(HashMap::new()),
                fail_indices: StdMutex::new(HashSet::new()),
                merge_script: StdMutex::new(StdVecDeque::new()),
                cancel_on_index: StdMutex::new(None),
            })
        }

        fn accepted_indices(&self) -> Vec<u32> {
            let mut indices: Vec<u32> =
                self.accepted.lock().unwrap().iter().map(|c| c.index).collect();
            indices.sort_unstable();
            indices
        }

        fn field_index(fields: &[FormField]) -> u32 {
            fields
                .iter()
                .find(|f| f.name == "chunkIndex")
                .and_then(|f| f.as_text())
                .and_then(|text| text.parse().ok())
                .expect("chunkIndex field")
        }

        fn field_file_id(fields: &[FormField]) -> String {
            fields
                .iter()
                .find(|f| f.name == "fileId")
                .and_then(|f| f.as_text())
                .expect("fileId field")
                .to_string()
        }
    }

    #[async_trait]
    impl Transport for MockServer {
        async fn post_json(
            &self,
            url: &str,
            _headers: &[(String, String)],
            body: &serde_json::Value,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> FcResult<TransportResponse> {
            if url.contains("/api/upload/check") {
                let response = match self.dedup_url.lock().unwrap().clone() {
                    Some(existing) => json!({ "exists": true, "url": existing }),
                    None => json!({ "exists": false }),
                };
                return Ok(TransportResponse {
                    status: 200,
                    body: Bytes::from(response.to_string()),
                });
            }

            if url.contains("/api/upload/merge") {
                self.merges.lock().unwrap().push(body.clone());
                let script = self
                    .merge_script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(MergeScript::Success);
                return match script {
                    MergeScript::Success => Ok(TransportResponse {
                        status: 200,
                        body: Bytes::from(
                            json!({
                                "success": true,
                                "url": self.final_url,
                                "fileId": body.get("fileId"),
                            })
                            .to_string(),
                        ),
                    }),
                    MergeScript::Incomplete(missing) => Ok(TransportResponse {
                        status: 400,
                        body: Bytes::from(
                            json!({ "error": "incomplete chunks", "missing": missing })
                                .to_string(),
                        ),
                    }),
                };
            }

            panic!("unexpected POST to {url}");
        }

        async fn post_multipart(
            &self,
            url: &str,
            _headers: &[(String, String)],
            fields: Vec<FormField>,
            _timeout: Duration,
            cancel: &CancellationToken,
        ) -> FcResult<TransportResponse> {
            let index = Self::field_index(&fields);
            self.chunk_attempts.lock().unwrap().push(index);

            if *self.cancel_on_index.lock().unwrap() == Some(index) {
                cancel.cancel();
                return Err(FileChunkError::cancelled());
            }

            {
                let mut fail_bases = self.fail_bases.lock().unwrap();
                let failing = fail_bases
                    .iter_mut()
                    .find(|(base, remaining)| url.starts_with(base.as_str()) && **remaining > 0);
                if let Some((_, remaining)) = failing {
                    if *remaining != usize::MAX {
                        *remaining -= 1;
                    }
                    return Err(FileChunkError::network("connection reset by peer"));
                }
            }

            if self.fail_indices.lock().unwrap().contains(&index) {
                return Err(FileChunkError::network("connection reset by peer"));
            }

            let base = url
                .split("/api/upload/chunk")
                .next()
                .unwrap_or_default()
                .to_string();
            self.accepted.lock().unwrap().push(AcceptedChunk {
                base,
                file_id: Self::field_file_id(&fields),
                index,
            });

            Ok(TransportResponse {
                status: 200,
                body: Bytes::from(json!({ "success": true, "chunkIndex": index }).to_string()),
            })
        }

        async fn head(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            _timeout: Duration,
        ) -> FcResult<ProbeResponse> {
            Ok(ProbeResponse {
                status: 200,
                latency: Duration::from_millis(1),
            })
        }
    }

    fn test_config(concurrency: usize) -> TransportConfig {
        TransportConfig {
            chunk_size: MIB,
            max_concurrent_uploads: concurrency,
            retry_count: 3,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
            ..TransportConfig::default()
        }
    }

    fn single_endpoint() -> Vec<Endpoint> {
        vec![Endpoint {
            id: "e1".to_string(),
            name: "primary".to_string(),
            base_url: "https://e1.example.com".to_string(),
            api_endpoint: None,
            auth: None,
        }]
    }

    fn two_endpoints() -> Vec<Endpoint> {
        let mut endpoints = single_endpoint();
        endpoints.push(Endpoint {
            id: "e2".to_string(),
            name: "backup".to_string(),
            base_url: "https://e2.example.com".to_string(),
            api_endpoint: None,
            auth: None,
        });
        endpoints
    }

    struct Harness {
        engine: Arc<UploadEngine>,
        store: Arc<Store>,
        endpoints: Arc<EndpointPool>,
        hasher: Arc<HashPool>,
    }

    fn harness(
        server: &Arc<MockServer>,
        endpoints: Vec<Endpoint>,
        config: TransportConfig,
    ) -> Harness {
        let transport: Arc<dyn Transport> = Arc::clone(server) as Arc<dyn Transport>;
        let store = Arc::new(Store::in_memory(StorageConfig::default()));
        let hasher = Arc::new(HashPool::new(HashPoolConfig::default()));
        let compressor = Arc::new(Compressor::new(CompressionConfig::default()));
        let pool = EndpointPool::new(
            CdnConfig {
                failover_threshold: 2,
                ..CdnConfig::default()
            },
            Arc::clone(&transport),
            endpoints,
        );
        let engine = UploadEngine::new(
            config,
            PlatformKind::Native,
            transport,
            Arc::clone(&store),
            Arc::clone(&hasher),
            compressor,
            Arc::clone(&pool),
        );
        Harness {
            engine,
            store,
            endpoints: pool,
            hasher,
        }
    }

    fn source_of(name: &str, data: Vec<u8>) -> Arc<dyn ContentSource> {
        Arc::new(BytesSource::new(name, data))
    }

    async fn fingerprint_of(harness: &Harness, source: &Arc<dyn ContentSource>) -> String {
        harness
            .hasher
            .hash(HashInput::Source(Arc::clone(source)), HashOptions::default())
            .await
            .unwrap()
    }

    async fn persisted_session(harness: &Harness, fingerprint: &str) -> Option<UploadSession> {
        harness
            .store
            .get(&UploadSession::store_key(fingerprint))
            .await
            .unwrap()
            .map(|bytes| serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn instant_upload_hit_issues_no_chunk_requests() {
        let server = MockServer::new();
        *server.dedup_url.lock().unwrap() = Some("https://x/ABC".to_string());
        let harness = harness(&server, single_endpoint(), test_config(3));

        let source = source_of("blob.bin", vec![0x41u8; MIB as usize]);
        let outcome = harness
            .engine
            .upload(Arc::clone(&source), UploadOptions::default())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.url.as_deref(), Some("https://x/ABC"));
        assert!(server.chunk_attempts.lock().unwrap().is_empty());
        assert!(server.merges.lock().unwrap().is_empty());

        // No session rows were persisted for the short-circuited upload
        let fingerprint = fingerprint_of(&harness, &source).await;
        assert!(persisted_session(&harness, &fingerprint).await.is_none());
    }

    #[tokio::test]
    async fn clean_three_chunk_upload_with_merge() {
        let server = MockServer::new();
        let harness = harness(&server, single_endpoint(), test_config(1));

        let percents: Arc<StdMutex<Vec<f64>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&percents);
        let opts = UploadOptions {
            on_progress: Some(Arc::new(move |update: ProgressUpdate| {
                seen.lock().unwrap().push(update.percent);
            })),
            ..Default::default()
        };

        let source = source_of("movie-script.txt", vec![0x41u8; 2_500_000]);
        let outcome = harness.engine.upload(Arc::clone(&source), opts).await;

        assert!(outcome.success, "upload failed: {:?}", outcome.error);
        assert_eq!(server.accepted_indices(), vec![0, 1, 2]);

        let merges = server.merges.lock().unwrap();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0]["chunkCount"], 3);
        assert_eq!(merges[0]["fileSize"], 2_500_000);

        let fingerprint = fingerprint_of(&harness, &source).await;
        assert_eq!(merges[0]["fileId"], fingerprint.as_str());
        assert_eq!(merges[0]["hash"], fingerprint.as_str());
        // The multipart fileId is the session id, which is the fingerprint
        assert!(server
            .accepted
            .lock()
            .unwrap()
            .iter()
            .all(|c| c.file_id == fingerprint));

        // Progress is monotonic and reaches 100
        let percents = percents.lock().unwrap();
        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|w| w[1] >= w[0]));
        assert!((percents.last().unwrap() - 100.0).abs() < f64::EPSILON);

        let session = persisted_session(&harness, &fingerprint).await.unwrap();
        assert_eq!(session.status, SessionStatus::Done);
    }

    #[tokio::test]
    async fn resume_skips_already_uploaded_chunks() {
        let server = MockServer::new();
        let harness = harness(&server, single_endpoint(), test_config(1));
        let source = source_of("big.bin", vec![7u8; 2_500_000]);

        // First run: chunk 0 lands, chunk 1 keeps failing
        server.fail_indices.lock().unwrap().extend([1, 2]);
        let outcome = harness
            .engine
            .upload(
                Arc::clone(&source),
                UploadOptions {
                    retry_count: Some(0),
                    ..Default::default()
                },
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(server.accepted_indices(), vec![0]);

        let fingerprint = fingerprint_of(&harness, &source).await;
        let session = persisted_session(&harness, &fingerprint).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.plan[0].state, ChunkState::Uploaded);

        // Second run: only chunks 1 and 2 are posted, then the merge
        server.fail_indices.lock().unwrap().clear();
        let outcome = harness
            .engine
            .upload(Arc::clone(&source), UploadOptions::default())
            .await;
        assert!(outcome.success, "resume failed: {:?}", outcome.error);
        assert_eq!(server.accepted_indices(), vec![0, 1, 2]);
        assert_eq!(
            server
                .accepted
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.index == 0)
                .count(),
            1,
            "chunk 0 must not be re-uploaded"
        );
        assert_eq!(server.merges.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn endpoint_failover_mid_upload() {
        let server = MockServer::new();
        server
            .fail_bases
            .lock()
            .unwrap()
            .insert("https://e1.example.com".to_string(), usize::MAX);
        let harness = harness(&server, two_endpoints(), test_config(1));

        let failovers = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&failovers);
        harness.endpoints.on_failover(Box::new(move |_, _| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        let source = source_of("data.bin", vec![3u8; MIB as usize]);
        let outcome = harness
            .engine
            .upload(Arc::clone(&source), UploadOptions::default())
            .await;

        assert!(outcome.success, "failover upload failed: {:?}", outcome.error);
        let accepted = server.accepted.lock().unwrap();
        assert!(accepted
            .iter()
            .all(|c| c.base == "https://e2.example.com"));
        assert_eq!(failovers.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_further_requests() {
        let server = MockServer::new();
        *server.cancel_on_index.lock().unwrap() = Some(0);
        let harness = harness(&server, single_endpoint(), test_config(1));

        let cancel = CancellationToken::new();
        let source = source_of("big.bin", vec![9u8; 2_500_000]);
        let outcome = harness
            .engine
            .upload(
                Arc::clone(&source),
                UploadOptions {
                    cancel: Some(cancel.clone()),
                    ..Default::default()
                },
            )
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_ref().unwrap().code, "CANCELLED");
        assert!(!outcome.error.as_ref().unwrap().retryable);
        // Only the aborted request went out, nothing after it
        assert_eq!(server.chunk_attempts.lock().unwrap().len(), 1);
        assert!(server.merges.lock().unwrap().is_empty());

        let fingerprint = fingerprint_of(&harness, &source).await;
        let session = persisted_session(&harness, &fingerprint).await.unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn zero_byte_file_uploads_one_empty_chunk() {
        let server = MockServer::new();
        let harness = harness(&server, single_endpoint(), test_config(1));

        let source = source_of("empty.txt", Vec::new());
        let outcome = harness
            .engine
            .upload(Arc::clone(&source), UploadOptions::default())
            .await;

        assert!(outcome.success, "empty upload failed: {:?}", outcome.error);
        assert_eq!(server.accepted_indices(), vec![0]);
        let merges = server.merges.lock().unwrap();
        assert_eq!(merges[0]["chunkCount"], 1);
        // SHA-256 of the empty input
        assert_eq!(
            merges[0]["hash"],
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn merge_incomplete_requeues_missing_chunks() {
        let server = MockServer::new();
        server
            .merge_script
            .lock()
            .unwrap()
            .push_back(MergeScript::Incomplete(vec![1]));
        let harness = harness(&server, single_endpoint(), test_config(1));

        let source = source_of("data.bin", vec![5u8; 2_000_000]);
        let outcome = harness
            .engine
            .upload(Arc::clone(&source), UploadOptions::default())
            .await;

        assert!(outcome.success, "merge retry failed: {:?}", outcome.error);
        assert_eq!(server.merges.lock().unwrap().len(), 2);
        let accepted = server.accepted.lock().unwrap();
        assert_eq!(accepted.iter().filter(|c| c.index == 1).count(), 2);
        assert_eq!(accepted.iter().filter(|c| c.index == 0).count(), 1);
    }

    #[tokio::test]
    async fn second_upload_reuses_completed_session() {
        let server = MockServer::new();
        let harness = harness(&server, single_endpoint(), test_config(3));
        let source = source_of("data.bin", vec![11u8; 1_500_000]);

        let first = harness
            .engine
            .upload(Arc::clone(&source), UploadOptions::default())
            .await;
        assert!(first.success);
        let attempts_after_first = server.chunk_attempts.lock().unwrap().len();

        let second = harness
            .engine
            .upload(Arc::clone(&source), UploadOptions::default())
            .await;
        assert!(second.success);
        assert_eq!(second.url, first.url);
        assert_eq!(
            server.chunk_attempts.lock().unwrap().len(),
            attempts_after_first,
            "no chunk is re-uploaded for a completed session"
        );
    }

    #[tokio::test]
    async fn disallowed_file_type_is_rejected_as_input() {
        let server = MockServer::new();
        let mut config = test_config(1);
        config.allowed_file_types = vec!["pdf".to_string(), "txt".to_string()];
        let harness = harness(&server, single_endpoint(), config);

        let outcome = harness
            .engine
            .upload(
                source_of("malware.exe", vec![1u8; 2048]),
                UploadOptions::default(),
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().code, "INPUT");
        assert!(server.chunk_attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pause_persists_status_and_resume_finishes() {
        let server = MockServer::new();
        let harness = harness(&server, single_endpoint(), test_config(1));
        let source = source_of("data.bin", vec![13u8; 2_500_000]);
        let fingerprint = fingerprint_of(&harness, &source).await;

        harness.engine.pause();
        let engine = Arc::clone(&harness.engine);
        let upload_source = Arc::clone(&source);
        let task =
            tokio::spawn(
                async move { engine.upload(upload_source, UploadOptions::default()).await },
            );

        // Wait until a worker parks the session in Paused
        let mut paused_seen = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(session) = persisted_session(&harness, &fingerprint).await {
                if session.status == SessionStatus::Paused {
                    paused_seen = true;
                    break;
                }
            }
        }
        assert!(paused_seen, "session never reached Paused");

        harness.engine.resume();
        let outcome = task.await.unwrap();
        assert!(outcome.success, "resumed upload failed: {:?}", outcome.error);
        assert_eq!(server.accepted_indices(), vec![0, 1, 2]);
    }
}
