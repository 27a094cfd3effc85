//! Per-client listener bookkeeping.
//!
//! Models are long-lived and shared by many clients. Every listener a client
//! attaches goes through its [`ListenerCounter`], so that on disconnect the
//! client can detach exactly what it attached and nothing else.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::action::Action;
use crate::client::Client;
use crate::emitter::{Listener, ListenerId, Model};
use crate::error::RedboneError;

/// Identity of a model, taken from its allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ModelKey(usize);

impl ModelKey {
    pub(crate) fn of(model: &Model) -> Self {
        Self(Arc::as_ptr(model) as *const () as usize)
    }
}

struct Registration {
    model: Model,
    listener: ListenerId,
}

/// Registry of `(model, event)` pairs one client listens to.
///
/// A pair may be held at most once; adding it again without removing it
/// first is an error. After [`clean`](Self::clean) the registry is closed and
/// refuses new pairs.
pub struct ListenerCounter {
    client_id: String,
    entries: DashMap<(ModelKey, String), Registration>,
    closed: AtomicBool,
}

impl ListenerCounter {
    /// Empty registry owned by `client_id`.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            entries: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach `listener` to `event` of `model` and remember the pair.
    pub fn add(&self, model: &Model, event: &str, listener: Listener) -> Result<(), RedboneError> {
        if event.is_empty() {
            return Err(RedboneError::InvalidName(
                "event name should be a non-empty string".into(),
            ));
        }
        if self.is_closed() {
            return Err(RedboneError::ClientDisconnected(self.client_id.clone()));
        }
        match self.entries.entry((ModelKey::of(model), event.to_string())) {
            Entry::Occupied(_) => {
                return Err(RedboneError::DuplicateListener {
                    client_id: self.client_id.clone(),
                    event: event.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                let listener = model.subscribe(event, listener);
                slot.insert(Registration {
                    model: model.clone(),
                    listener,
                });
            }
        }
        // A concurrent clean may have taken its snapshot before the insert.
        if self.is_closed() {
            self.remove(model, event);
            return Err(RedboneError::ClientDisconnected(self.client_id.clone()));
        }
        Ok(())
    }

    /// Detach the pair; `false` if it was not registered.
    pub fn remove(&self, model: &Model, event: &str) -> bool {
        match self.entries.remove(&(ModelKey::of(model), event.to_string())) {
            Some((_, registration)) => {
                registration.model.unsubscribe(event, registration.listener);
                true
            }
            None => false,
        }
    }

    /// Whether the pair is registered.
    pub fn contains(&self, model: &Model, event: &str) -> bool {
        self.entries
            .contains_key(&(ModelKey::of(model), event.to_string()))
    }

    /// Number of registered pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when the client listens to nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether [`clean`](Self::clean) already ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the registry and detach every remaining pair; returns how many
    /// were detached.
    pub fn clean(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let keys: Vec<(ModelKey, String)> =
            self.entries.iter().map(|entry| entry.key().clone()).collect();
        let mut detached = 0;
        for key in keys {
            if let Some(((_, event), registration)) = self.entries.remove(&key) {
                registration.model.unsubscribe(&event, registration.listener);
                detached += 1;
            }
        }
        if detached > 0 {
            debug!(client_id = %self.client_id, detached, "detached client listeners");
        }
        detached
    }
}

impl fmt::Debug for ListenerCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerCounter")
            .field("client_id", &self.client_id)
            .field("len", &self.entries.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Listener that re-dispatches model events to `client` as `action_type`.
///
/// Holds the client weakly; once the client is gone the listener does
/// nothing. `id` is echoed on every forwarded action.
pub(crate) fn forwarder(
    client: &Arc<Client>,
    action_type: String,
    merge: bool,
    id: Option<String>,
) -> Listener {
    let client = Arc::downgrade(client);
    Arc::new(move |data: Value| {
        let Some(client) = client.upgrade() else {
            return;
        };
        let mut action = Action::reply(action_type.clone(), data, merge);
        if let Some(id) = &id {
            action = action.with_field("id", id.clone());
        }
        if let Err(error) = client.dispatch(action) {
            warn!(client_id = %client.id(), %error, "dropped model event");
        }
    })
}
