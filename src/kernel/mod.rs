//! Microkernel binding the subsystems together
//!
//! Modules register with declared dependencies, cycles are rejected at
//! registration with the offending path, and start/stop walk the dependency
//! order forwards and backwards. Kernels are plain instances created by a
//! factory function; there is no process-global registry.

mod events;
mod module;

pub use events::{EventBus, HandlerId};
pub use module::{KernelContext, KernelModule, ModuleState};

use crate::config::FileChunkConfig;
use crate::error::{FcResult, FileChunkError};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

struct ModuleEntry {
    module: Arc<dyn KernelModule>,
    state: ModuleState,
    error_cause: Option<String>,
}

/// Module host with typed events and dependency-ordered lifecycle
pub struct Kernel {
    modules: Mutex<Vec<ModuleEntry>>,
    bus: Arc<EventBus>,
    config: Arc<RwLock<FileChunkConfig>>,
}

impl Kernel {
    /// Factory for a fresh kernel instance.
    pub fn new(config: FileChunkConfig) -> Self {
        Self {
            modules: Mutex::new(Vec::new()),
            bus: Arc::new(EventBus::new()),
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Register a module. Duplicate ids and dependency cycles are rejected;
    /// the cycle error reports the offending path.
    pub async fn register(&self, module: Arc<dyn KernelModule>) -> FcResult<()> {
        let mut modules = self.modules.lock().await;
        let id = module.id().to_string();
        if modules.iter().any(|entry| entry.module.id() == id) {
            return Err(FileChunkError::dependency(format!(
                "module {id:?} is already registered"
            )));
        }

        // Cycle detection over the currently known dependency edges
        let mut edges: HashMap<String, Vec<String>> = modules
            .iter()
            .map(|entry| {
                (
                    entry.module.id().to_string(),
                    entry.module.dependencies(),
                )
            })
            .collect();
        edges.insert(id.clone(), module.dependencies());
        if let Some(cycle) = find_cycle(&edges, &id) {
            return Err(FileChunkError::dependency(format!(
                "dependency cycle: {}",
                cycle.join(" -> ")
            )));
        }

        info!(target: "kernel", module = %id, deps = ?module.dependencies(), "Module registered");
        modules.push(ModuleEntry {
            module,
            state: ModuleState::Registered,
            error_cause: None,
        });
        Ok(())
    }

    pub async fn module(&self, id: &str) -> Option<Arc<dyn KernelModule>> {
        self.modules
            .lock()
            .await
            .iter()
            .find(|entry| entry.module.id() == id)
            .map(|entry| Arc::clone(&entry.module))
    }

    pub async fn module_state(&self, id: &str) -> Option<(ModuleState, Option<String>)> {
        self.modules
            .lock()
            .await
            .iter()
            .find(|entry| entry.module.id() == id)
            .map(|entry| (entry.state, entry.error_cause.clone()))
    }

    /// Init and start every module in dependency order. A module whose init
    /// or start fails goes to `Error`; its dependents are skipped and marked
    /// `Error` with a dependency-failed cause.
    pub async fn start(&self) -> FcResult<()> {
        let ctx = KernelContext {
            bus: Arc::clone(&self.bus),
            config: Arc::clone(&self.config),
        };

        let mut modules = self.modules.lock().await;
        let order = topological_order(&modules)?;

        for index in order {
            let (id, dependencies, module) = {
                let entry = &modules[index];
                (
                    entry.module.id().to_string(),
                    entry.module.dependencies(),
                    Arc::clone(&entry.module),
                )
            };

            // Every dependency must already be running
            let blocked = dependencies.iter().find(|dep| {
                modules
                    .iter()
                    .find(|entry| entry.module.id() == dep.as_str())
                    .map(|entry| entry.state != ModuleState::Running)
                    .unwrap_or(true)
            });
            if let Some(dep) = blocked {
                warn!(
                    target: "kernel",
                    module = %id,
                    dependency = %dep,
                    "Skipping module, dependency not running"
                );
                let entry = &mut modules[index];
                entry.state = ModuleState::Error;
                entry.error_cause = Some(format!("dependency-failed: {dep}"));
                continue;
            }

            modules[index].state = ModuleState::Initializing;
            if let Err(err) = module.init(&ctx).await {
                error!(target: "kernel", module = %id, error = %err, "Module init failed");
                let entry = &mut modules[index];
                entry.state = ModuleState::Error;
                entry.error_cause = Some(format!("init: {err}"));
                continue;
            }
            modules[index].state = ModuleState::Initialized;

            modules[index].state = ModuleState::Starting;
            if let Err(err) = module.start(&ctx).await {
                error!(target: "kernel", module = %id, error = %err, "Module start failed");
                let entry = &mut modules[index];
                entry.state = ModuleState::Error;
                entry.error_cause = Some(format!("start: {err}"));
                continue;
            }
            modules[index].state = ModuleState::Running;
            info!(target: "kernel", module = %id, "Module running");
        }

        Ok(())
    }

    /// Stop running modules in reverse dependency order.
    pub async fn stop(&self) -> FcResult<()> {
        let ctx = KernelContext {
            bus: Arc::clone(&self.bus),
            config: Arc::clone(&self.config),
        };

        let mut modules = self.modules.lock().await;
        let mut order = topological_order(&modules)?;
        order.reverse();

        for index in order {
            if modules[index].state != ModuleState::Running {
                continue;
            }
            let module = Arc::clone(&modules[index].module);
            modules[index].state = ModuleState::Stopping;
            if let Err(err) = module.stop(&ctx).await {
                warn!(
                    target: "kernel",
                    module = module.id(),
                    error = %err,
                    "Module stop failed"
                );
                let entry = &mut modules[index];
                entry.state = ModuleState::Error;
                entry.error_cause = Some(format!("stop: {err}"));
                continue;
            }
            modules[index].state = ModuleState::Stopped;
            info!(target: "kernel", module = module.id(), "Module stopped");
        }

        Ok(())
    }

    pub fn emit(&self, topic: &str, payload: Value) {
        self.bus.emit(topic, &payload);
    }

    pub fn on(&self, topic: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> HandlerId {
        self.bus.on(topic, handler)
    }

    pub fn off(&self, id: HandlerId) {
        self.bus.off(id);
    }

    pub fn set_config(&self, path: &str, value: Value) -> FcResult<()> {
        self.config
            .write()
            .expect("config lock poisoned")
            .set(path, value)
    }

    pub fn get_config(&self, path: &str) -> Option<Value> {
        self.config.read().expect("config lock poisoned").get(path)
    }

    pub fn config_snapshot(&self) -> FileChunkConfig {
        self.config.read().expect("config lock poisoned").clone()
    }
}

/// DFS from `start` looking for a path back to it; returns the cycle path.
fn find_cycle(edges: &HashMap<String, Vec<String>>, start: &str) -> Option<Vec<String>> {
    fn dfs(
        edges: &HashMap<String, Vec<String>>,
        node: &str,
        target: &str,
        path: &mut Vec<String>,
        visited: &mut HashSet<String>,
    ) -> bool {
        if !visited.insert(node.to_string()) {
            return false;
        }
        for dep in edges.get(node).map(|d| d.as_slice()).unwrap_or_default() {
            path.push(dep.clone());
            if dep == target || dfs(edges, dep, target, path, visited) {
                return true;
            }
            path.pop();
        }
        false
    }

    let mut path = vec![start.to_string()];
    let mut visited = HashSet::new();
    if dfs(edges, start, start, &mut path, &mut visited) {
        Some(path)
    } else {
        None
    }
}

/// Kahn-style topological order over the registered modules. Unknown
/// dependencies are tolerated here and surface as dependency-failed at
/// start.
fn topological_order(modules: &[ModuleEntry]) -> FcResult<Vec<usize>> {
    let ids: HashMap<&str, usize> = modules
        .iter()
        .enumerate()
        .map(|(i, entry)| (entry.module.id(), i))
        .collect();

    let mut in_degree = vec![0usize; modules.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); modules.len()];
    for (index, entry) in modules.iter().enumerate() {
        for dep in entry.module.dependencies() {
            if let Some(&dep_index) = ids.get(dep.as_str()) {
                in_degree[index] += 1;
                dependents[dep_index].push(index);
            }
        }
    }

    let mut queue: Vec<usize> = (0..modules.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(modules.len());
    while let Some(index) = queue.pop() {
        order.push(index);
        for &dependent in &dependents[index] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    if order.len() != modules.len() {
        // register() should have rejected this
        return Err(FileChunkError::dependency(
            "dependency graph contains a cycle",
        ));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingModule {
        id: String,
        deps: Vec<String>,
        log: Arc<StdMutex<Vec<String>>>,
        fail_init: bool,
    }

    impl RecordingModule {
        fn new(id: &str, deps: &[&str], log: &Arc<StdMutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                deps: deps.iter().map(|d| d.to_string()).collect(),
                log: Arc::clone(log),
                fail_init: false,
            })
        }

        fn failing(id: &str, deps: &[&str], log: &Arc<StdMutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                deps: deps.iter().map(|d| d.to_string()).collect(),
                log: Arc::clone(log),
                fail_init: true,
            })
        }
    }

    #[async_trait]
    impl KernelModule for RecordingModule {
        fn id(&self) -> &str {
            &self.id
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        async fn init(&self, _ctx: &KernelContext) -> FcResult<()> {
            if self.fail_init {
                return Err(FileChunkError::config("intentional init failure"));
            }
            self.log.lock().unwrap().push(format!("init:{}", self.id));
            Ok(())
        }

        async fn start(&self, _ctx: &KernelContext) -> FcResult<()> {
            self.log.lock().unwrap().push(format!("start:{}", self.id));
            Ok(())
        }

        async fn stop(&self, _ctx: &KernelContext) -> FcResult<()> {
            self.log.lock().unwrap().push(format!("stop:{}", self.id));
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_respects_dependency_order_and_stop_reverses_it() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let kernel = Kernel::new(FileChunkConfig::default());

        kernel
            .register(RecordingModule::new("store", &[], &log))
            .await
            .unwrap();
        kernel
            .register(RecordingModule::new("engine", &["store", "hasher"], &log))
            .await
            .unwrap();
        kernel
            .register(RecordingModule::new("hasher", &[], &log))
            .await
            .unwrap();

        kernel.start().await.unwrap();

        let entries = log.lock().unwrap().clone();
        let position = |needle: &str| entries.iter().position(|e| e == needle).unwrap();
        assert!(position("start:store") < position("init:engine"));
        assert!(position("start:hasher") < position("init:engine"));
        assert_eq!(
            kernel.module_state("engine").await.unwrap().0,
            ModuleState::Running
        );

        kernel.stop().await.unwrap();
        let entries = log.lock().unwrap().clone();
        let stop_engine = entries.iter().position(|e| e == "stop:engine").unwrap();
        let stop_store = entries.iter().position(|e| e == "stop:store").unwrap();
        assert!(stop_engine < stop_store);
        assert_eq!(
            kernel.module_state("store").await.unwrap().0,
            ModuleState::Stopped
        );
    }

    #[tokio::test]
    async fn cycles_are_rejected_at_register_with_path() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let kernel = Kernel::new(FileChunkConfig::default());

        kernel
            .register(RecordingModule::new("a", &["b"], &log))
            .await
            .unwrap();
        kernel
            .register(RecordingModule::new("b", &["c"], &log))
            .await
            .unwrap();

        let err = kernel
            .register(RecordingModule::new("c", &["a"], &log))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Dependency);
        assert!(err.message.contains("c -> a -> b -> c"), "{}", err.message);
    }

    #[tokio::test]
    async fn failed_init_marks_dependents_without_running_them() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let kernel = Kernel::new(FileChunkConfig::default());

        kernel
            .register(RecordingModule::failing("store", &[], &log))
            .await
            .unwrap();
        kernel
            .register(RecordingModule::new("engine", &["store"], &log))
            .await
            .unwrap();
        kernel
            .register(RecordingModule::new("hasher", &[], &log))
            .await
            .unwrap();

        kernel.start().await.unwrap();

        let (store_state, _) = kernel.module_state("store").await.unwrap();
        assert_eq!(store_state, ModuleState::Error);

        let (engine_state, cause) = kernel.module_state("engine").await.unwrap();
        assert_eq!(engine_state, ModuleState::Error);
        assert!(cause.unwrap().contains("dependency-failed"));

        // Unrelated module still runs
        assert_eq!(
            kernel.module_state("hasher").await.unwrap().0,
            ModuleState::Running
        );
        // The dependent never initialized
        assert!(!log.lock().unwrap().iter().any(|e| e == "init:engine"));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let kernel = Kernel::new(FileChunkConfig::default());
        kernel
            .register(RecordingModule::new("store", &[], &log))
            .await
            .unwrap();
        let err = kernel
            .register(RecordingModule::new("store", &[], &log))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Dependency);
    }

    #[tokio::test]
    async fn missing_dependency_surfaces_at_start() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let kernel = Kernel::new(FileChunkConfig::default());
        kernel
            .register(RecordingModule::new("engine", &["ghost"], &log))
            .await
            .unwrap();

        kernel.start().await.unwrap();
        let (state, cause) = kernel.module_state("engine").await.unwrap();
        assert_eq!(state, ModuleState::Error);
        assert!(cause.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn kernel_config_round_trips_dot_paths() {
        let kernel = Kernel::new(FileChunkConfig::default());
        kernel
            .set_config("cdn.failoverThreshold", serde_json::json!(5))
            .unwrap();
        assert_eq!(
            kernel.get_config("cdn.failoverThreshold"),
            Some(serde_json::json!(5))
        );
        assert!(kernel.get_config("cdn.noSuchKey").is_none());
    }
}
