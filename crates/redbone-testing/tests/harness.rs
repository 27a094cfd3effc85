use std::sync::Arc;

use redbone_core::{Action, Client, Model, Pubsub, Redbone, Rpc, RpcModule};
use redbone_testing::{assert_error_code, assert_types, Harness, TrackedModel};
use serde_json::{json, Value};

fn harness(todos: &Arc<TrackedModel>) -> Harness {
    let mut rpc = Rpc::new();
    rpc.set_main_lib([(
        "hello",
        RpcModule::new()
            .method("double", |args: Vec<Value>| async move {
                Ok(json!(args.first().and_then(Value::as_str).unwrap_or_default().repeat(2)))
            })
            .with_events(todos.clone()),
    )])
    .unwrap();

    let model: Model = todos.clone();
    let mut pubsub = Pubsub::new();
    pubsub.add_default_set([("todos", model)]).unwrap();

    let router = Redbone::builder()
        .with_types("client", ["WELCOME"])
        .unwrap()
        .with_watcher("@@server/CONNECTION", |client: Arc<Client>, _, _| async move {
            client.dispatch_type("client", "WELCOME", json!({ "id": client.id() }), true)?;
            Ok::<_, anyhow::Error>(())
        })
        .with_extension(rpc)
        .unwrap()
        .with_extension(pubsub)
        .unwrap()
        .build()
        .unwrap();
    Harness::new(router)
}

#[tokio::test]
async fn connect_runs_the_lifecycle() {
    let todos = TrackedModel::new();
    let harness = harness(&todos);

    let (client, outbox) = harness.connect("c1").await.unwrap();
    assert_types(&outbox, &["@@client/WELCOME"]);
    assert_eq!(outbox.last().unwrap().get("id"), Some(&json!("c1")));
    assert!(client.router().is_some());
}

#[tokio::test]
async fn call_returns_payload_or_error() {
    let todos = TrackedModel::new();
    let harness = harness(&todos);
    let (client, outbox) = harness.connect("c1").await.unwrap();

    let answer = harness
        .call(&client, &outbox, "hello", "double", json!("ab"))
        .await
        .unwrap();
    assert_eq!(answer, json!("abab"));

    let err = harness
        .call(&client, &outbox, "hello", "missing", Value::Null)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn both_extensions_share_the_disconnect_cleanup() {
    let todos = TrackedModel::new();
    let harness = harness(&todos);
    let (client, outbox) = harness.connect("c1").await.unwrap();

    harness
        .send(
            &client,
            json!({ "type": "@@server/SUB", "model": "todos", "event": "change", "backType": "@@client/TODOS" }),
        )
        .await
        .unwrap();
    harness
        .send(&client, json!({ "type": "@@server/rpc/SUB", "module": "hello", "event": "change" }))
        .await
        .unwrap();

    // Same model, same event: the second subscription is refused.
    assert_eq!(todos.attached(), 1);
    let refusal = outbox.last().unwrap();
    assert_eq!(refusal.action_type, "@@server/ERROR");
    assert!(refusal.get("err").and_then(Value::as_str).unwrap().contains("already has a listener"));

    harness.disconnect(&client).await.unwrap();
    assert_eq!(todos.detached(), 1);
    assert_eq!(todos.listener_count("change"), 0);
}

#[tokio::test]
async fn forwarded_events_reach_the_outbox() {
    let todos = TrackedModel::new();
    let harness = harness(&todos);
    let (client, outbox) = harness.connect("c1").await.unwrap();
    outbox.take();

    harness
        .send(&client, json!({ "type": "@@server/rpc/SUB", "module": "hello", "event": "tick", "id": 9 }))
        .await
        .unwrap();
    todos.emit("tick", json!(1));

    let events: Vec<Action> = outbox.of_type("@@client/rpc/EVENT");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload, Some(json!(1)));
    assert_eq!(events[0].id().as_deref(), Some("9"));
}

#[tokio::test]
async fn bad_requests_are_reported() {
    let todos = TrackedModel::new();
    let harness = harness(&todos);
    let (client, outbox) = harness.connect("c1").await.unwrap();

    harness
        .send(&client, json!({ "type": "@@server/rpc/CALL", "module": "hello" }))
        .await
        .unwrap();
    assert_error_code(&outbox, 400);
}
