//! # RPC Echo Demo
//!
//! Wires a router with RPC and Pub/Sub to an in-process connector and plays
//! a short scripted session against it. Run with `RUST_LOG=debug` to see the
//! pipeline at work.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use redbone_core::{
    ChannelTransport, Client, Connector, EventEmitter, Flow, HttpError, Model, Pubsub, Redbone,
    Rpc, RpcModule,
};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Modules
// ============================================================================

fn echo_module() -> RpcModule {
    RpcModule::new()
        .method("echo", |args: Vec<Value>| async move { Ok(Value::Array(args)) })
        .method("double", |args: Vec<Value>| async move {
            let text = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(json!(text.repeat(2)))
        })
}

// ============================================================================
// Router
// ============================================================================

fn build_router(news: Model) -> Result<Redbone> {
    let mut rpc = Rpc::new();
    rpc.set_main_lib([("echo", echo_module())])?;
    rpc.use_for("main.echo.double", |_, action, _| async move {
        if action.get("arguments").is_some_and(Value::is_string) {
            Ok(Flow::Continue)
        } else {
            Err(anyhow::Error::from(HttpError::bad_request("double expects a string")))
        }
    })?;

    let mut pubsub = Pubsub::new();
    pubsub.add_default_set([("news", news)])?;

    let router = Redbone::builder()
        .with_middleware(|client: Arc<Client>, action, _| async move {
            info!(client_id = %client.id(), action_type = %action.action_type, "inbound");
            Ok(())
        })
        .with_extension(rpc)?
        .with_extension(pubsub)?
        .build()?;
    Ok(router)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rpc_echo_demo=info".parse()?))
        .init();

    let news = Arc::new(EventEmitter::new());
    let router = build_router(news.clone())?;

    let (connector, events) = Connector::new();
    let server = tokio::spawn(router.serve(events));

    let (transport, mut outbound) = ChannelTransport::new();
    let client = connector.connect(transport)?;
    info!(client_id = %client.id(), "connected");

    let script = [
        json!({ "type": "@@server/rpc/CALL", "module": "echo", "method": "double", "arguments": "ab", "id": 1 }),
        json!({ "type": "@@server/rpc/CALL", "module": "echo", "method": "echo", "arguments": [1, 2], "flat": true }),
        json!({ "type": "@@server/rpc/CALL", "module": "echo", "method": "double", "arguments": 3 }),
        json!({ "type": "@@server/rpc/CALL", "module": "nope", "method": "x" }),
        json!({ "type": "@@server/SUB", "model": "news", "event": "posted", "backType": "@@client/NEWS" }),
        json!({ "kind": "untyped" }),
    ];
    for message in script {
        connector.dispatch(&client, message)?;
    }

    // Let the worker drain the script before publishing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    news.emit("posted", json!({ "title": "hello" }));

    connector.disconnect(&client)?;
    drop(connector);
    server.await?;

    while let Ok(action) = outbound.try_recv() {
        info!(action = %action.to_value(), "outbound");
    }
    Ok(())
}
