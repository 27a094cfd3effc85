//! Per-connection client.
//!
//! A [`Client`] stands for one remote endpoint. The transport binding supplies
//! a [`Transport`] that knows how to deliver an outbound action; everything
//! else (router binding, per-connection storage, listener bookkeeping) is
//! transport agnostic.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::trace;

use crate::action::Action;
use crate::error::RedboneError;
use crate::listeners::ListenerCounter;
use crate::router::Redbone;

/// Outbound half of a transport binding.
pub trait Transport: Send + Sync + 'static {
    /// Deliver `action` to the remote endpoint.
    fn send(&self, action: Action) -> Result<(), RedboneError>;
}

/// One connected endpoint.
pub struct Client {
    id: String,
    router: OnceLock<Redbone>,
    transport: Option<Arc<dyn Transport>>,
    storage: DashMap<String, Value>,
    listeners: ListenerCounter,
    connected_at: DateTime<Utc>,
    disconnected: AtomicBool,
}

impl Client {
    /// Client delivering through `transport`.
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self::build(id.into(), Some(transport)))
    }

    /// Client without a transport; every dispatch fails with
    /// [`RedboneError::DispatcherNotImplemented`].
    pub fn detached(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(id.into(), None))
    }

    fn build(id: String, transport: Option<Arc<dyn Transport>>) -> Self {
        Self {
            listeners: ListenerCounter::new(id.clone()),
            id,
            router: OnceLock::new(),
            transport,
            storage: DashMap::new(),
            connected_at: Utc::now(),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Router this client is bound to.
    pub fn router(&self) -> Option<&Redbone> {
        self.router.get()
    }

    /// Bind to `router` unless already bound. Returns `true` on first bind.
    pub(crate) fn bind(&self, router: &Redbone) -> bool {
        self.router.set(router.clone()).is_ok()
    }

    /// Send `action` to the remote endpoint.
    pub fn dispatch(&self, action: Action) -> Result<(), RedboneError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(RedboneError::DispatcherNotImplemented)?;
        trace!(client_id = %self.id, action_type = %action.action_type, "dispatch to client");
        transport.send(action)
    }

    /// Build `name/key` through the router's type registry and send it.
    ///
    /// `merge` flattens an object payload into the action root.
    pub fn dispatch_type(
        &self,
        name: &str,
        key: &str,
        payload: Value,
        merge: bool,
    ) -> Result<(), RedboneError> {
        let router = self
            .router()
            .ok_or_else(|| RedboneError::NotBound(self.id.clone()))?;
        let action = router.types().make_action(name, key, payload, merge)?;
        self.dispatch(action)
    }

    /// Store a per-connection value.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.storage.insert(key.into(), value);
    }

    /// Store every field of `values`.
    pub fn set_many(&self, values: Map<String, Value>) {
        for (key, value) in values {
            self.storage.insert(key, value);
        }
    }

    /// Stored value for `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.storage.get(key).map(|v| v.value().clone())
    }

    /// Snapshot of the whole storage.
    pub fn storage(&self) -> Map<String, Value> {
        self.storage
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Listeners this client holds on models.
    pub fn listeners(&self) -> &ListenerCounter {
        &self.listeners
    }

    /// When the client object was created.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Whether [`disconnect`](Self::disconnect) already ran.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Mark the client gone and detach its listeners.
    ///
    /// Only the first call does anything; returns `true` for it.
    pub fn disconnect(&self) -> bool {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.listeners.clean();
        true
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("bound", &self.router.get().is_some())
            .field("listeners", &self.listeners.len())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}
