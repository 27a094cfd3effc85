//! Testing utilities for Redbone.
//!
//! - [`RecordingTransport`] keeps every outbound action for inspection.
//! - [`TrackedModel`] is an [`EventEmitter`] that counts attach/detach calls.
//! - [`Harness`] wraps a router and drives clients through it.
//!
//! ```ignore
//! use redbone_testing::Harness;
//!
//! let harness = Harness::new(router);
//! let (client, outbox) = harness.connect("c1").await?;
//! harness.send(&client, json!({ "type": "@@server/PING" })).await?;
//! assert_eq!(outbox.types(), ["@@client/PONG"]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail};
use redbone_core::{
    Action, Client, EventEmitter, Listener, ListenerId, Redbone, RedboneError, Subscribable,
    Transport,
};
use serde_json::{json, Value};

// ============================================================================
// Transport
// ============================================================================

/// Transport that records outbound actions instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Action>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sent(&self) -> MutexGuard<'_, Vec<Action>> {
        // A panicking test thread must not hide the recorded actions.
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every action sent so far.
    pub fn actions(&self) -> Vec<Action> {
        self.sent().clone()
    }

    /// Wire values of every action sent so far.
    pub fn values(&self) -> Vec<Value> {
        self.sent().iter().map(Action::to_value).collect()
    }

    /// Types of every action sent so far.
    pub fn types(&self) -> Vec<String> {
        self.sent().iter().map(|a| a.action_type.clone()).collect()
    }

    /// Sent actions of one type.
    pub fn of_type(&self, action_type: &str) -> Vec<Action> {
        self.sent()
            .iter()
            .filter(|a| a.action_type == action_type)
            .cloned()
            .collect()
    }

    /// Most recent action.
    pub fn last(&self) -> Option<Action> {
        self.sent().last().cloned()
    }

    /// Drain the record.
    pub fn take(&self) -> Vec<Action> {
        std::mem::take(&mut *self.sent())
    }

    pub fn len(&self) -> usize {
        self.sent().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent().is_empty()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, action: Action) -> Result<(), RedboneError> {
        self.sent().push(action);
        Ok(())
    }
}

/// Client backed by a fresh [`RecordingTransport`].
pub fn test_client(id: &str) -> (Arc<Client>, Arc<RecordingTransport>) {
    let transport = RecordingTransport::new();
    (Client::new(id, transport.clone()), transport)
}

// ============================================================================
// Models
// ============================================================================

/// Event emitter that counts how many listeners were attached and detached.
#[derive(Debug, Default)]
pub struct TrackedModel {
    emitter: EventEmitter,
    attached: AtomicUsize,
    detached: AtomicUsize,
}

impl TrackedModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Emit `event` to every attached listener.
    pub fn emit(&self, event: &str, payload: Value) -> usize {
        self.emitter.emit(event, payload)
    }

    /// Listeners currently attached to `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.emitter.listener_count(event)
    }

    /// Total successful attaches.
    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    /// Total successful detaches.
    pub fn detached(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }
}

impl Subscribable for TrackedModel {
    fn subscribe(&self, event: &str, listener: Listener) -> ListenerId {
        self.attached.fetch_add(1, Ordering::SeqCst);
        self.emitter.subscribe(event, listener)
    }

    fn unsubscribe(&self, event: &str, id: ListenerId) -> bool {
        let removed = self.emitter.unsubscribe(event, id);
        if removed {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Drives clients through a router without a real transport.
#[derive(Debug, Clone)]
pub struct Harness {
    router: Redbone,
}

impl Harness {
    pub fn new(router: Redbone) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Redbone {
        &self.router
    }

    /// New client that went through the CONNECTION lifecycle.
    pub async fn connect(&self, id: &str) -> Result<(Arc<Client>, Arc<RecordingTransport>), RedboneError> {
        let (client, transport) = test_client(id);
        self.router.on_connection(&client).await?;
        Ok((client, transport))
    }

    /// Dispatch a raw message as if `client` sent it.
    pub async fn send(&self, client: &Arc<Client>, message: Value) -> Result<bool, RedboneError> {
        self.router.dispatch_value(client, message).await
    }

    /// Run the DISCONNECT lifecycle for `client`.
    pub async fn disconnect(&self, client: &Arc<Client>) -> Result<bool, RedboneError> {
        self.router.on_disconnect(client).await
    }

    /// Call `module.method` and return the answer's payload.
    ///
    /// Fails with the error notice when the call was rejected, and when
    /// nothing was sent back at all.
    pub async fn call(
        &self,
        client: &Arc<Client>,
        transport: &RecordingTransport,
        module: &str,
        method: &str,
        arguments: Value,
    ) -> anyhow::Result<Value> {
        let call_type = self
            .router
            .types()
            .get("server/rpc", "CALL")
            .ok_or_else(|| anyhow!("rpc is not installed"))?
            .to_string();
        let error_type = self.router.lifecycle().error.clone();

        transport.take();
        self.send(
            client,
            json!({ "type": call_type, "module": module, "method": method, "arguments": arguments }),
        )
        .await?;

        let Some(answer) = transport.take().pop() else {
            bail!("no answer for {module}.{method}");
        };
        if answer.action_type == error_type {
            bail!("call {module}.{method} failed: {}", answer.to_value());
        }
        Ok(answer.payload.unwrap_or(Value::Null))
    }
}

// ============================================================================
// Assertions
// ============================================================================

/// Assert that `transport` received an HTTP-style error notice with `code`.
#[track_caller]
pub fn assert_error_code(transport: &RecordingTransport, code: u16) {
    let notices: Vec<Value> = transport
        .values()
        .into_iter()
        .filter(|v| v.get("code").is_some())
        .collect();
    assert!(
        notices.iter().any(|v| v["code"] == json!(code)),
        "expected an error notice with code {code}, got {notices:?}"
    );
}

/// Assert the exact sequence of outbound action types.
#[track_caller]
pub fn assert_types(transport: &RecordingTransport, expected: &[&str]) {
    let types = transport.types();
    assert_eq!(types, expected, "unexpected outbound actions");
}
