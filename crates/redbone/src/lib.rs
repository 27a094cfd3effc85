//! # Redbone
//!
//! A two-way action dispatcher for long-lived client connections. Clients
//! send typed actions in, the server dispatches typed actions back out, and
//! everything in between is an ordered chain of async handlers.
//!
//! ## Core Concepts
//!
//! - [`Action`] = a message, `{type, payload?, ...fields}` on the wire
//! - [`Client`] = one connection; outbound actions go through its [`Transport`]
//! - [`Redbone`] = the router; built once with [`RedboneBuilder`], then shared
//!
//! Every handler returns `anyhow::Result<Flow>`: [`Flow::Continue`] passes the
//! action on, [`Flow::Halt`] stops it quietly, and an error stops it and hands
//! it to the [`Catcher`].
//!
//! ## Architecture
//!
//! ```text
//! Transport (WebSocket, IPC, in-process channel)
//!     │
//!     ▼ connect() / dispatch() / disconnect()
//! Connector ─────► ConnectorEvent ─────► Redbone::serve()
//!                                            │
//!                              one worker per client (FIFO)
//!                                            │
//!                                            ▼
//!                                 Redbone::dispatch(client, action)
//!                                            │
//!     ┌──────────────────────────────────────┤
//!     │                                      ▼
//!     │                            BEFORE chain (all → exact → patterns)
//!     │                                      │
//!     │                                      ▼
//!     │                            WATCH (one handler per type)
//!     │                              ├─ Pubsub SUB/UNSUB
//!     │                              └─ Rpc CALL/SUB/UNSUB
//!     │                                      │
//!     │                                      ▼
//!     │                            AFTER chain
//!     │                                      │
//!     └── any error ──► Catcher ──► client.dispatch(ERROR)
//!
//! Model event ──► ListenerCounter listener ──► client.dispatch(backType)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Actions always have a type** - Untyped input is rejected before any handler runs
//! 2. **Handlers run in order** - One at a time, first halt or error wins
//! 3. **The router is frozen after build** - Registration happens on the builder
//! 4. **Listeners are tracked per client** - Disconnect detaches exactly what the client attached
//! 5. **Per-client FIFO** - `serve` never processes two actions of one client at once
//!
//! ## Example
//!
//! ```ignore
//! use redbone_core::{ChannelTransport, Client, Flow, Redbone, Rpc, RpcModule};
//! use serde_json::{json, Value};
//!
//! let mut rpc = Rpc::new();
//! rpc.set_main_lib([(
//!     "hello",
//!     RpcModule::new().method("double", |args: Vec<Value>| async move {
//!         let text = args.first().and_then(Value::as_str).unwrap_or_default();
//!         Ok(json!(text.repeat(2)))
//!     }),
//! )])?;
//!
//! let router = Redbone::builder()
//!     .with_middleware(|client, action, _router| async move {
//!         tracing::info!(client_id = %client.id(), action_type = %action.action_type, "inbound");
//!         Ok(Flow::Continue)
//!     })
//!     .with_extension(rpc)?
//!     .build()?;
//!
//! let (transport, mut outbound) = ChannelTransport::new();
//! let client = Client::new("c1", transport);
//! router.dispatch_value(&client, json!({
//!     "type": "@@server/rpc/CALL",
//!     "module": "hello",
//!     "method": "double",
//!     "arguments": "ab",
//! })).await?;
//!
//! // {type: "@@client/rpc/RETURN", payload: "abab"}
//! let answer = outbound.recv().await;
//! ```

// Macros first so every module can use them
#[macro_use]
mod action_macro;

// Core modules
mod action;
mod client;
mod connector;
mod emitter;
mod error;
mod handler;
mod listeners;
mod middleware;
mod router;
mod types;

// Extensions
pub mod pubsub;
pub mod rpc;



// RPC tests (test-only)
#[cfg(test)]
mod rpc_tests;


// Re-export the action type
pub use action::Action;

// Re-export client types
pub use client::{Client, Transport};

// Re-export transport boundary types
pub use connector::{ChannelTransport, Connector, ConnectorEvent};

// Re-export model types
pub use emitter::{EventEmitter, Listener, ListenerId, Model, Subscribable};

// Re-export error types
pub use error::{status_text, HttpError, RedboneError};

// Re-export handler types
pub use handler::{
    catcher_fn, handler_fn, BoxHandler, Catcher, Flow, FnCatcher, FnHandler, Handler, HandlerType,
};

// Re-export listener bookkeeping
pub use listeners::ListenerCounter;

// Re-export chain types
pub use middleware::{HandlerList, MiddlewareChain};

// Re-export router types
pub use router::{DefaultCatcher, Extension, Redbone, RedboneBuilder, RethrowCatcher};

// Re-export type registry
pub use types::{ActionTypes, LifecycleTypes, TypesDef, COLLECTION_TYPES};

// Re-export extension entry points
pub use pubsub::{ModelGuard, Pubsub, PubsubTypes, Subscription, DEFAULT_SET};
pub use rpc::{Method, MethodFuture, Rpc, RpcModule, RpcTypes, MAIN_LIB};

// Re-export commonly used external types
pub use async_trait::async_trait;
