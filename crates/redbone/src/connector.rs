//! The boundary between a transport and the router.
//!
//! A transport integration only has to do three things: report a new
//! connection, forward inbound messages, and report the disconnect. It does
//! so through a [`Connector`], which turns them into [`ConnectorEvent`]s on a
//! channel consumed by [`Redbone::serve`].
//!
//! ```text
//! transport ──► Connector ──► ConnectorEvent ──► Redbone::serve
//!                                                   │
//!                                    one worker per client (FIFO)
//!                                                   │
//!                                                   ▼
//!                                      on_connection / dispatch / on_disconnect
//! ```
//!
//! `serve` gives each client its own worker task, so actions from one client
//! are processed in the order they were received while different clients
//! run concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::action::Action;
use crate::client::{Client, Transport};
use crate::error::{HttpError, RedboneError};
use crate::router::Redbone;

/// Event emitted by a transport integration.
#[derive(Debug)]
pub enum ConnectorEvent {
    /// A client connected.
    Connection(Arc<Client>),
    /// A client sent a raw message.
    Dispatch(Arc<Client>, Value),
    /// A client went away.
    Disconnect(Arc<Client>),
}

/// Transport-side handle owning the pool of connected clients.
#[derive(Clone)]
pub struct Connector {
    events: mpsc::UnboundedSender<ConnectorEvent>,
    clients: Arc<DashMap<String, Arc<Client>>>,
}

impl Connector {
    /// Connector and the event stream to hand to [`Redbone::serve`].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let connector = Self {
            events,
            clients: Arc::new(DashMap::new()),
        };
        (connector, rx)
    }

    /// Register a new client with a generated id.
    pub fn connect(&self, transport: Arc<dyn Transport>) -> Result<Arc<Client>, RedboneError> {
        self.connect_with_id(Uuid::new_v4().to_string(), transport)
    }

    /// Register a new client under `id`.
    pub fn connect_with_id(
        &self,
        id: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Client>, RedboneError> {
        let client = Client::new(id, transport);
        self.clients.insert(client.id().to_string(), client.clone());
        self.emit(ConnectorEvent::Connection(client.clone()))?;
        Ok(client)
    }

    /// Forward an inbound message from `client`.
    pub fn dispatch(&self, client: &Arc<Client>, message: Value) -> Result<(), RedboneError> {
        self.emit(ConnectorEvent::Dispatch(client.clone(), message))
    }

    /// Report that `client` went away and drop it from the pool.
    pub fn disconnect(&self, client: &Arc<Client>) -> Result<(), RedboneError> {
        self.clients.remove(client.id());
        self.emit(ConnectorEvent::Disconnect(client.clone()))
    }

    /// Connected client by id.
    pub fn client(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// `true` when no client is connected.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// One-shot request/response: connect a short-lived client, dispatch
    /// `message`, disconnect, and return the first action sent back, if any.
    ///
    /// Needs [`Redbone::serve`] running on the other end.
    pub async fn request(&self, message: Value) -> Result<Option<Action>, RedboneError> {
        let (tx, rx) = oneshot::channel();
        let client = self.connect(Arc::new(OneShotTransport::new(tx)))?;
        self.dispatch(&client, message)?;
        self.disconnect(&client)?;
        drop(client);
        Ok(rx.await.ok())
    }

    fn emit(&self, event: ConnectorEvent) -> Result<(), RedboneError> {
        self.events
            .send(event)
            .map_err(|_| RedboneError::TransportClosed("connector".into()))
    }
}

/// Transport delivering outbound actions on an unbounded channel.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Action>,
}

impl ChannelTransport {
    /// Transport and the receiving end of its outbound actions.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Action>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, action: Action) -> Result<(), RedboneError> {
        self.tx
            .send(action)
            .map_err(|_| RedboneError::TransportClosed("channel".into()))
    }
}

/// Transport that can answer exactly once.
struct OneShotTransport {
    reply: Mutex<Option<oneshot::Sender<Action>>>,
}

impl OneShotTransport {
    fn new(reply: oneshot::Sender<Action>) -> Self {
        Self {
            reply: Mutex::new(Some(reply)),
        }
    }
}

impl Transport for OneShotTransport {
    fn send(&self, action: Action) -> Result<(), RedboneError> {
        let reply = self
            .reply
            .lock()
            .map_err(|_| RedboneError::TransportClosed("request".into()))?
            .take();
        match reply {
            Some(reply) => reply
                .send(action)
                .map_err(|_| RedboneError::TransportClosed("request".into())),
            None => Err(RedboneError::TransportClosed("request".into())),
        }
    }
}

enum ClientJob {
    Connect,
    Dispatch(Value),
    Disconnect,
}

struct Worker {
    client: Arc<Client>,
    jobs: mpsc::UnboundedSender<ClientJob>,
}

impl Redbone {
    /// Consume connector events until every [`Connector`] handle is dropped.
    ///
    /// Each client gets a worker task; its actions are processed one at a
    /// time in arrival order. Messages from a client that already
    /// disconnected, or that never announced its connection, are dropped.
    pub async fn serve(self, mut events: mpsc::UnboundedReceiver<ConnectorEvent>) {
        let mut workers: HashMap<String, Worker> = HashMap::new();
        let mut tasks = JoinSet::new();

        while let Some(event) = events.recv().await {
            match event {
                ConnectorEvent::Connection(client) => {
                    let jobs = spawn_worker(&mut tasks, self.clone(), client.clone());
                    let _ = jobs.send(ClientJob::Connect);
                    let worker = Worker { client: client.clone(), jobs };
                    if workers.insert(client.id().to_string(), worker).is_some() {
                        warn!(client_id = %client.id(), "client id reused while still connected");
                    }
                }
                ConnectorEvent::Dispatch(client, message) => match workers.get(client.id()) {
                    Some(worker) if Arc::ptr_eq(&worker.client, &client) && !client.is_disconnected() => {
                        let _ = worker.jobs.send(ClientJob::Dispatch(message));
                    }
                    _ => {
                        debug!(client_id = %client.id(), "dropped message from a client that is not connected");
                    }
                },
                ConnectorEvent::Disconnect(client) => {
                    let owned = workers
                        .get(client.id())
                        .is_some_and(|worker| Arc::ptr_eq(&worker.client, &client));
                    if owned {
                        if let Some(worker) = workers.remove(client.id()) {
                            let _ = worker.jobs.send(ClientJob::Disconnect);
                        }
                    } else if client.is_disconnected() {
                        debug!(client_id = %client.id(), "client already disconnected");
                    } else {
                        let jobs = spawn_worker(&mut tasks, self.clone(), client);
                        let _ = jobs.send(ClientJob::Disconnect);
                    }
                }
            }
            // Reap finished workers so the set does not grow unbounded.
            while tasks.try_join_next().is_some() {}
        }

        debug!(remaining = workers.len(), "connector closed, draining workers");
        workers.clear();
        while tasks.join_next().await.is_some() {}
    }
}

fn spawn_worker(
    tasks: &mut JoinSet<()>,
    router: Redbone,
    client: Arc<Client>,
) -> mpsc::UnboundedSender<ClientJob> {
    let (tx, rx) = mpsc::unbounded_channel();
    tasks.spawn(client_worker(router, client, rx));
    tx
}

async fn client_worker(router: Redbone, client: Arc<Client>, mut jobs: mpsc::UnboundedReceiver<ClientJob>) {
    while let Some(job) = jobs.recv().await {
        let (result, last) = match job {
            ClientJob::Connect => (router.on_connection(&client).await, false),
            ClientJob::Dispatch(message) => (router.dispatch_value(&client, message).await, false),
            ClientJob::Disconnect => (router.on_disconnect(&client).await, true),
        };
        match result {
            Ok(_) => {}
            Err(RedboneError::InvalidAction(message)) => {
                warn!(client_id = %client.id(), %message, "rejected inbound message");
                let error = HttpError::bad_request(message);
                let notice = Action::new(router.lifecycle().error.clone())
                    .with_field("code", error.code)
                    .with_field("status", error.status())
                    .with_field("message", error.message);
                if let Err(error) = client.dispatch(notice) {
                    debug!(client_id = %client.id(), %error, "could not report rejected message");
                }
            }
            Err(RedboneError::ClientDisconnected(_)) => {
                debug!(client_id = %client.id(), "dropped job for a disconnected client");
            }
            Err(error) => {
                warn!(client_id = %client.id(), %error, "unhandled dispatch error");
            }
        }
        if last {
            break;
        }
    }
    client.disconnect();
}
