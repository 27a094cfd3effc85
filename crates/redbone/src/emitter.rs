//! Subscribable models.
//!
//! Pub/Sub and RPC bridge model events to dispatched actions. A model is
//! anything implementing [`Subscribable`]; [`EventEmitter`] is the stock
//! implementation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// Callback attached to a model event.
pub type Listener = Arc<dyn Fn(Value) + Send + Sync>;

/// Handle identifying one attached listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An event source clients may subscribe to.
///
/// Implementations must tolerate concurrent attach/detach from unrelated
/// clients.
pub trait Subscribable: Send + Sync + 'static {
    /// Attach `listener` to `event`.
    fn subscribe(&self, event: &str, listener: Listener) -> ListenerId;

    /// Detach a listener; `false` if it was not attached.
    fn unsubscribe(&self, event: &str, id: ListenerId) -> bool;
}

/// Shared model handle.
pub type Model = Arc<dyn Subscribable>;

/// Named-event emitter backed by a concurrent map.
#[derive(Default)]
pub struct EventEmitter {
    next_id: AtomicU64,
    listeners: DashMap<String, Vec<(ListenerId, Listener)>>,
}

impl EventEmitter {
    /// Emitter with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a closure to `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.subscribe(event, Arc::new(listener))
    }

    /// Detach a listener.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.unsubscribe(event, id)
    }

    /// Call every listener of `event` with `payload`; returns how many ran.
    pub fn emit(&self, event: &str, payload: Value) -> usize {
        // Snapshot first so listeners may attach or detach while running.
        let listeners: Vec<Listener> = match self.listeners.get(event) {
            Some(entry) => entry.iter().map(|(_, l)| l.clone()).collect(),
            None => return 0,
        };
        for listener in &listeners {
            listener(payload.clone());
        }
        listeners.len()
    }

    /// Number of listeners attached to `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, |entry| entry.len())
    }
}

impl Subscribable for EventEmitter {
    fn subscribe(&self, event: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    fn unsubscribe(&self, event: &str, id: ListenerId) -> bool {
        let Some(mut entry) = self.listeners.get_mut(event) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(existing, _)| *existing != id);
        let removed = entry.len() != before;
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.listeners.remove_if(event, |_, v| v.is_empty());
        }
        removed
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field(
                "events",
                &self.listeners.iter().map(|e| e.key().clone()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
