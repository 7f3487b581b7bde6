//! Module trait and lifecycle states

use crate::config::FileChunkConfig;
use crate::error::FcResult;
use crate::kernel::events::EventBus;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// Lifecycle of one registered module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Registered,
    Initializing,
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// What a module sees of its kernel during lifecycle calls
pub struct KernelContext {
    pub bus: Arc<EventBus>,
    pub config: Arc<RwLock<FileChunkConfig>>,
}

/// A unit of functionality managed by the kernel.
///
/// Dependencies are declared by id; the kernel guarantees every dependency
/// is `Running` before `init` is called.
#[async_trait]
pub trait KernelModule: Send + Sync {
    fn id(&self) -> &str;

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn init(&self, _ctx: &KernelContext) -> FcResult<()> {
        Ok(())
    }

    async fn start(&self, _ctx: &KernelContext) -> FcResult<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &KernelContext) -> FcResult<()> {
        Ok(())
    }
}
