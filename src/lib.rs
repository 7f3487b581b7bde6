//! filechunk: resumable chunked uploads for client hosts
//!
//! A large-file upload engine with content-addressed deduplication,
//! partial resume, adaptive per-file compression, endpoint failover, and a
//! persistent client-side chunk store, bound together by a small module
//! kernel.
//!
//! The quickest way in is [`FileChunkClient`]:
//!
//! ```no_run
//! use filechunk::{ClientOptions, Endpoint, FileChunkClient, FileSource, UploadOptions};
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let client = FileChunkClient::start(ClientOptions {
//!     endpoints: vec![Endpoint {
//!         id: "primary".into(),
//!         name: "primary".into(),
//!         base_url: "https://upload.example.com".into(),
//!         api_endpoint: None,
//!         auth: None,
//!     }],
//!     ..ClientOptions::default()
//! })
//! .await?;
//!
//! let source = Arc::new(FileSource::open("video.mp4").await?);
//! let outcome = client.upload(source, UploadOptions::default()).await;
//! println!("uploaded: {:?}", outcome.url);
//! # Ok(())
//! # }
//! ```

pub mod compression;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod kernel;
pub mod logging;
pub mod platform;
pub mod store;

mod client;

pub use client::{ClientOptions, FileChunkClient};
pub use config::{CompressionProfile, FileChunkConfig};
pub use endpoint::{AuthMaterial, Endpoint, EndpointStatus};
pub use engine::{
    ProgressCallback, ProgressUpdate, SessionStatus, UploadEngine, UploadOptions, UploadOutcome,
};
pub use error::{ErrorCode, ErrorEnvelope, FcResult, FileChunkError};
pub use hasher::{HashInput, HashOptions, HashPool};
pub use kernel::{EventBus, HandlerId, Kernel, KernelContext, KernelModule, ModuleState};
pub use logging::{LogHandle, LogOptions};
pub use platform::{BytesSource, ContentSource, FileSource, PlatformKind, Transport};
pub use store::{EvictionPolicy, Store, StoreOptions, StoreStats};
