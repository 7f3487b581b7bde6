//! Assembled client: kernel + subsystems wired together
//!
//! [`FileChunkClient`] is the convenience entry point. It builds the
//! platform transport, store, hash pool, compressor, endpoint pool, and
//! upload engine, registers each as a kernel module, and routes engine and
//! endpoint events onto the kernel bus.

use crate::compression::Compressor;
use crate::config::FileChunkConfig;
use crate::endpoint::{Endpoint, EndpointPool};
use crate::engine::{UploadEngine, UploadOptions, UploadOutcome};
use crate::error::{FcResult, FileChunkError};
use crate::hasher::{HashPool, HashPoolConfig};
use crate::kernel::{Kernel, KernelContext, KernelModule};
use crate::logging::{self, LogHandle, LogOptions};
use crate::platform::{ContentSource, HttpTransport, PlatformKind, Transport};
use crate::store::{Store, StoreOptions};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Construction options for [`FileChunkClient`]
pub struct ClientOptions {
    pub config: FileChunkConfig,
    pub endpoints: Vec<Endpoint>,
    /// Override the default reqwest transport (tests, custom stacks)
    pub transport: Option<Arc<dyn Transport>>,
    /// Override the default on-disk store location
    pub store: Option<StoreOptions>,
    pub hash_workers: usize,
    /// Install the library's tracing subscriber at boot; `None` leaves
    /// subscriber ownership with the host
    pub logging: Option<LogOptions>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            config: FileChunkConfig::default(),
            endpoints: Vec::new(),
            transport: None,
            store: None,
            hash_workers: 1,
            logging: None,
        }
    }
}

/// Fully wired upload client
pub struct FileChunkClient {
    kernel: Arc<Kernel>,
    engine: Arc<UploadEngine>,
    store: Arc<Store>,
    endpoints: Arc<EndpointPool>,
    /// Keeps file logging flushing for the client's lifetime
    _log_handle: Option<LogHandle>,
}

impl std::fmt::Debug for FileChunkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChunkClient").finish()
    }
}

impl FileChunkClient {
    /// Assemble and start every subsystem.
    pub async fn start(options: ClientOptions) -> FcResult<Self> {
        if options.endpoints.is_empty() {
            return Err(FileChunkError::config("at least one endpoint is required"));
        }

        let log_handle = match options.logging {
            Some(log_options) => Some(logging::init(log_options)?),
            None => None,
        };

        let platform = PlatformKind::detect();
        let config = options.config;

        let transport: Arc<dyn Transport> = match options.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.transport.http.timeout)?),
        };

        let mut store_options = options.store.unwrap_or_default();
        store_options.storage = config.storage.clone();
        let store = Arc::new(Store::new(store_options));

        let hasher = Arc::new(HashPool::new(HashPoolConfig {
            max_workers: options.hash_workers.max(1),
        }));
        let compressor = Arc::new(
            Compressor::with_store(config.compression.clone(), Arc::clone(&store)).await,
        );

        let endpoints = EndpointPool::new(
            config.cdn.clone(),
            Arc::clone(&transport),
            options.endpoints,
        );

        let engine = UploadEngine::new(
            config.transport.http.clone(),
            platform,
            Arc::clone(&transport),
            Arc::clone(&store),
            Arc::clone(&hasher),
            Arc::clone(&compressor),
            Arc::clone(&endpoints),
        );

        let kernel = Arc::new(Kernel::new(config));

        // Engine and endpoint events flow onto the kernel bus
        let bus = kernel.bus();
        engine.set_event_sink(Arc::new(move |topic, payload| {
            bus.emit(topic, &payload);
        }));
        let bus = kernel.bus();
        endpoints.on_failover(Box::new(move |from, to| {
            bus.emit("cdn:failover", &json!({ "from": from, "to": to }));
        }));
        let bus = kernel.bus();
        endpoints.on_all_failed(Box::new(move || {
            bus.emit("file:allCdnsFailed", &json!({}));
        }));

        kernel
            .register(Arc::new(StoreModule {
                store: Arc::clone(&store),
            }))
            .await?;
        kernel
            .register(Arc::new(EndpointModule {
                pool: Arc::clone(&endpoints),
            }))
            .await?;
        kernel
            .register(Arc::new(EngineModule {
                engine: Arc::clone(&engine),
            }))
            .await?;
        kernel.start().await?;

        info!(target: "kernel", platform = platform.as_str(), "Client assembled");
        Ok(Self {
            kernel,
            engine,
            store,
            endpoints,
            _log_handle: log_handle,
        })
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn engine(&self) -> &Arc<UploadEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn endpoints(&self) -> &Arc<EndpointPool> {
        &self.endpoints
    }

    pub async fn upload(
        &self,
        source: Arc<dyn ContentSource>,
        opts: UploadOptions,
    ) -> UploadOutcome {
        self.engine.upload(source, opts).await
    }

    /// Stop modules in reverse dependency order.
    pub async fn shutdown(&self) -> FcResult<()> {
        self.kernel.stop().await
    }
}

struct StoreModule {
    store: Arc<Store>,
}

#[async_trait]
impl KernelModule for StoreModule {
    fn id(&self) -> &str {
        "store"
    }

    async fn start(&self, _ctx: &KernelContext) -> FcResult<()> {
        // Opening is lazy; surface configuration problems at boot instead
        self.store.stats().await.map(|_| ())
    }

    async fn stop(&self, _ctx: &KernelContext) -> FcResult<()> {
        self.store.dispose().await;
        Ok(())
    }
}

struct EndpointModule {
    pool: Arc<EndpointPool>,
}

#[async_trait]
impl KernelModule for EndpointModule {
    fn id(&self) -> &str {
        "endpoint"
    }

    async fn start(&self, _ctx: &KernelContext) -> FcResult<()> {
        self.pool.start();
        Ok(())
    }

    async fn stop(&self, _ctx: &KernelContext) -> FcResult<()> {
        self.pool.shutdown();
        Ok(())
    }
}

struct EngineModule {
    engine: Arc<UploadEngine>,
}

#[async_trait]
impl KernelModule for EngineModule {
    fn id(&self) -> &str {
        "engine"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["store".to_string(), "endpoint".to_string()]
    }

    async fn stop(&self, _ctx: &KernelContext) -> FcResult<()> {
        self.engine.cancel();
        Ok(())
    }
}
