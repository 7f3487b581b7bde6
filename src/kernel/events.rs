//! Topic-based event bus
//!
//! Handlers are stored per topic in registration order and addressed by
//! opaque ids, so callers never hold handler identities beyond the token
//! returned from `on`. Dispatch is synchronous; a panicking handler is
//! caught and logged without aborting the rest of the dispatch.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, trace};

/// Opaque handler token returned by [`EventBus::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Registry {
    topics: HashMap<String, Vec<(HandlerId, Handler)>>,
    index: HashMap<HandlerId, String>,
}

/// Synchronous topic multimap event bus
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic. Handlers run in registration order.
    pub fn on(&self, topic: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut registry = self.registry.lock().expect("event registry poisoned");
        registry
            .topics
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        registry.index.insert(id, topic.to_string());
        id
    }

    /// Remove a handler by its token. Unknown tokens are ignored.
    pub fn off(&self, id: HandlerId) {
        let mut registry = self.registry.lock().expect("event registry poisoned");
        if let Some(topic) = registry.index.remove(&id) {
            if let Some(handlers) = registry.topics.get_mut(&topic) {
                handlers.retain(|(handler_id, _)| *handler_id != id);
            }
        }
    }

    /// Dispatch synchronously to every subscriber of `topic`.
    pub fn emit(&self, topic: &str, payload: &Value) {
        let handlers: Vec<Handler> = {
            let registry = self.registry.lock().expect("event registry poisoned");
            registry
                .topics
                .get(topic)
                .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
                .unwrap_or_default()
        };

        trace!(target: "kernel", topic, handlers = handlers.len(), "Dispatching event");
        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                error!(target: "kernel", topic, panic = %message, "Event handler panicked");
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry
            .lock()
            .expect("event registry poisoned")
            .topics
            .get(topic)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on("upload:progress", move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        bus.emit("upload:progress", &json!({}));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn off_removes_only_the_addressed_handler() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));

        let hits_a = Arc::clone(&hits);
        let a = bus.on("tick", move |_| *hits_a.lock().unwrap() += 1);
        let hits_b = Arc::clone(&hits);
        let _b = bus.on("tick", move |_| *hits_b.lock().unwrap() += 10);

        bus.off(a);
        bus.emit("tick", &json!({}));
        assert_eq!(*hits.lock().unwrap(), 10);
        assert_eq!(bus.subscriber_count("tick"), 1);
    }

    #[test]
    fn panicking_handler_does_not_abort_dispatch() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));

        bus.on("boom", |_| panic!("handler exploded"));
        let reached_in_cb = Arc::clone(&reached);
        bus.on("boom", move |_| *reached_in_cb.lock().unwrap() = true);

        bus.emit("boom", &json!({}));
        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn per_topic_fifo_is_preserved() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_in_cb = Arc::clone(&seen);
        bus.on("seq", move |payload| {
            seen_in_cb
                .lock()
                .unwrap()
                .push(payload["n"].as_u64().unwrap());
        });

        for n in 0..10u64 {
            bus.emit("seq", &json!({ "n": n }));
        }
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<u64>>());
    }
}
