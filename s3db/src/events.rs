//! Event surface
//!
//! Components emit named events (`insert`, `command.request`,
//! `leader:changed`, ...) with a JSON payload. Listeners run synchronously
//! in registration order; a panicking listener is isolated and never rolls
//! back the operation that emitted the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::warn;

/// A single emitted event.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Synchronous fan-out bus shared by a database and its subsystems.
#[derive(Clone, Default)]
pub struct EventBus {
    // (name filter, listener); None matches every event
    listeners: Arc<RwLock<Vec<(Option<String>, Listener)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event name.
    pub fn on<F>(&self, name: impl Into<String>, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap()
            .push((Some(name.into()), Arc::new(listener)));
    }

    /// Subscribe to every event.
    pub fn on_any<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners.write().unwrap().push((None, Arc::new(listener)));
    }

    /// Emit an event to all matching listeners, in registration order.
    pub fn emit(&self, name: &str, payload: Value) {
        let listeners: Vec<Listener> = {
            let guard = self.listeners.read().unwrap();
            guard
                .iter()
                .filter(|(filter, _)| filter.as_deref().map_or(true, |f| f == name))
                .map(|(_, l)| Arc::clone(l))
                .collect()
        };
        if listeners.is_empty() {
            return;
        }
        let event = Event {
            name: name.to_string(),
            payload,
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(event = %event.name, "event listener panicked");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
