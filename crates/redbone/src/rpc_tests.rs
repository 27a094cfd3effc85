//! Tests for RPC calls and module event subscriptions.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::{Action, ChannelTransport, Client, EventEmitter, Flow, Redbone, Rpc, RpcModule, RpcTypes};

// ============================================================================
// Helpers
// ============================================================================

fn hello() -> RpcModule {
    RpcModule::new()
        .method("double", |args: Vec<Value>| async move {
            let text = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(json!(text.repeat(2)))
        })
        .method("add", |args: Vec<Value>| async move {
            Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
        })
        .method("stats", |args: Vec<Value>| async move {
            Ok(json!({ "count": args.len(), "payload": "p" }))
        })
        .method("fail", |_| async { Err(anyhow::anyhow!("kaput")) })
}

fn rpc() -> Rpc {
    let mut rpc = Rpc::new();
    rpc.set_main_lib([("hello", hello())]).unwrap();
    rpc
}

fn router(rpc: Rpc) -> Redbone {
    Redbone::builder()
        .with_extension(rpc)
        .unwrap()
        .build()
        .unwrap()
}

fn client(id: &str) -> (Arc<Client>, mpsc::UnboundedReceiver<Action>) {
    let (transport, rx) = ChannelTransport::new();
    (Client::new(id, transport), rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Action>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(action) = rx.try_recv() {
        out.push(action.to_value());
    }
    out
}

fn call(module: &str, method: &str, arguments: Value) -> Value {
    json!({
        "type": "@@server/rpc/CALL",
        "module": module,
        "method": method,
        "arguments": arguments,
    })
}

/// Single notice sent back for a failed call.
async fn failure(router: &Redbone, action: Value) -> Value {
    let (client, mut rx) = client("c1");
    assert!(!router.dispatch_value(&client, action).await.unwrap());
    let mut notices = drain(&mut rx);
    assert_eq!(notices.len(), 1);
    notices.remove(0)
}

// ============================================================================
// Calls
// ============================================================================

#[tokio::test]
async fn call_returns_the_result() {
    let router = router(rpc());
    let (client, mut rx) = client("c1");

    assert!(router
        .dispatch_value(&client, call("hello", "double", json!("ab")))
        .await
        .unwrap());
    assert_eq!(
        drain(&mut rx),
        [json!({ "type": "@@client/rpc/RETURN", "payload": "abab" })]
    );
}

#[tokio::test]
async fn flat_arguments_are_spread() {
    let router = router(rpc());
    let (client, mut rx) = client("c1");

    let mut action = call("hello", "add", json!([1, 2, 3]));
    action["flat"] = json!(true);
    router.dispatch_value(&client, action).await.unwrap();

    // Without `flat` the array is one argument.
    router
        .dispatch_value(&client, call("hello", "stats", json!([1, 2, 3])))
        .await
        .unwrap();

    let answers = drain(&mut rx);
    assert_eq!(answers[0]["payload"], json!(6));
    assert_eq!(answers[1]["payload"], json!({ "count": 1, "payload": "p" }));
}

#[tokio::test]
async fn merge_back_type_and_id_shape_the_answer() {
    let router = router(rpc());
    let (client, mut rx) = client("c1");

    let mut action = call("hello", "stats", Value::Null);
    action["merge"] = json!(true);
    action["backType"] = json!("@@client/STATS");
    action["id"] = json!(42);
    router.dispatch_value(&client, action).await.unwrap();

    assert_eq!(
        drain(&mut rx),
        [json!({ "type": "@@client/STATS", "count": 0, "payload": "p", "id": "42" })]
    );
}

#[tokio::test]
async fn modules_resolve_through_lib_or_dotted_name() {
    let mut rpc = rpc();
    rpc.set_lib("math", [("calc", hello())]).unwrap();
    rpc.set_module("text.upper", RpcModule::new().method("run", |args: Vec<Value>| async move {
        Ok(json!(args.first().and_then(Value::as_str).unwrap_or_default().to_uppercase()))
    }))
    .unwrap();
    let router = router(rpc);
    let (client, mut rx) = client("c1");

    let mut with_lib = call("calc", "double", json!("x"));
    with_lib["lib"] = json!("math");
    router.dispatch_value(&client, with_lib).await.unwrap();
    router
        .dispatch_value(&client, call("math.calc", "double", json!("y")))
        .await
        .unwrap();
    router
        .dispatch_value(&client, call("main.hello", "double", json!("z")))
        .await
        .unwrap();
    router
        .dispatch_value(&client, call("text.upper", "run", json!("abc")))
        .await
        .unwrap();

    let payloads: Vec<Value> = drain(&mut rx).into_iter().map(|a| a["payload"].clone()).collect();
    assert_eq!(payloads, [json!("xx"), json!("yy"), json!("zz"), json!("ABC")]);
}

#[tokio::test]
async fn unknown_targets_are_not_found() {
    let router = router(rpc());

    let notice = failure(&router, call("nope", "double", Value::Null)).await;
    assert_eq!(notice["code"], json!(404));
    assert_eq!(notice["message"], json!("Module main.nope is not found"));

    let notice = failure(&router, call("hello", "triple", Value::Null)).await;
    assert_eq!(notice["code"], json!(404));
    assert_eq!(notice["status"], json!("Not Found"));
    assert_eq!(notice["message"], json!("Method main.hello.triple is not found"));
}

#[tokio::test]
async fn malformed_calls_are_bad_requests() {
    let router = router(rpc());

    let cases = [
        (json!({ "type": "@@server/rpc/CALL", "method": "double" }), "Module is not defined"),
        (json!({ "type": "@@server/rpc/CALL", "module": "hello" }), "Method is not defined"),
        (
            json!({ "type": "@@server/rpc/CALL", "module": "hello", "method": "double", "event": "tick" }),
            "Event is not allowed in a call",
        ),
    ];
    for (action, message) in cases {
        let notice = failure(&router, action).await;
        assert_eq!(notice["code"], json!(400));
        assert_eq!(notice["message"], json!(message));
    }

    let notice = failure(&router, call("a.b.c", "double", Value::Null)).await;
    assert_eq!(notice["code"], json!(400));
}

#[tokio::test]
async fn method_errors_reach_the_catcher() {
    let router = router(rpc());
    let mut action = call("hello", "fail", Value::Null);
    action["id"] = json!("req-1");

    let notice = failure(&router, action).await;
    assert_eq!(notice, json!({ "type": "@@server/ERROR", "err": "kaput", "id": "req-1" }));
}

// ============================================================================
// Middleware
// ============================================================================

#[tokio::test]
async fn middlewares_run_from_global_to_method() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let mut rpc = rpc();

    let record = |name: &'static str| {
        let seen = seen.clone();
        move |_: Arc<Client>, _: Arc<Action>, _: Redbone| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(name.to_string());
                Ok(())
            }
        }
    };
    rpc.use_for("main.hello.double", record("method")).unwrap();
    rpc.use_for("main.hello", record("module")).unwrap();
    rpc.use_for("main", record("lib")).unwrap();
    rpc.use_middleware(record("global"));
    rpc.use_for("main.hello.add", record("other method")).unwrap();
    rpc.use_for("math", record("other lib")).unwrap();

    let router = router(rpc);
    let (client, _rx) = client("c1");
    router
        .dispatch_value(&client, call("hello", "double", json!("ab")))
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), ["global", "lib", "module", "method"]);
}

#[tokio::test]
async fn halting_middleware_drops_the_call() {
    let mut rpc = rpc();
    rpc.use_for("main.hello", |client: Arc<Client>, _, _| async move {
        Ok(if client.get("user").is_some() { Flow::Continue } else { Flow::Halt })
    })
    .unwrap();
    let router = router(rpc);

    let (anonymous, mut anonymous_rx) = client("anon");
    assert!(!router
        .dispatch_value(&anonymous, call("hello", "double", json!("ab")))
        .await
        .unwrap());
    assert!(drain(&mut anonymous_rx).is_empty());

    let (user, mut user_rx) = client("user");
    user.set("user", json!("ann"));
    router
        .dispatch_value(&user, call("hello", "double", json!("ab")))
        .await
        .unwrap();
    assert_eq!(drain(&mut user_rx).len(), 1);
}

// ============================================================================
// Module events
// ============================================================================

fn events_rpc() -> (Rpc, Arc<EventEmitter>) {
    let clock = Arc::new(EventEmitter::new());
    let mut rpc = rpc();
    rpc.set_module("clock", RpcModule::new().with_events(clock.clone()))
        .unwrap();
    (rpc, clock)
}

fn rpc_sub(module: &str, event: &str) -> Value {
    json!({ "type": "@@server/rpc/SUB", "module": module, "event": event })
}

#[tokio::test]
async fn subscription_forwards_module_events() {
    let (rpc, clock) = events_rpc();
    let router = router(rpc);
    let (client, mut rx) = client("c1");

    let mut action = rpc_sub("clock", "tick");
    action["id"] = json!(3);
    assert!(router.dispatch_value(&client, action).await.unwrap());

    clock.emit("tick", json!({ "at": 1 }));
    assert_eq!(
        drain(&mut rx),
        [json!({ "type": "@@client/rpc/EVENT", "payload": { "at": 1 }, "id": "3" })]
    );

    router
        .dispatch_value(
            &client,
            json!({ "type": "@@server/rpc/UNSUB", "module": "clock", "event": "tick" }),
        )
        .await
        .unwrap();
    assert_eq!(clock.emit("tick", json!({ "at": 2 })), 0);
}

#[tokio::test]
async fn subscription_honours_back_type_and_merge() {
    let (rpc, clock) = events_rpc();
    let router = router(rpc);
    let (client, mut rx) = client("c1");

    let mut action = rpc_sub("main.clock", "tick");
    action["backType"] = json!("@@client/TICK");
    action["merge"] = json!(true);
    router.dispatch_value(&client, action).await.unwrap();

    clock.emit("tick", json!({ "at": 1 }));
    assert_eq!(drain(&mut rx), [json!({ "type": "@@client/TICK", "at": 1 })]);
}

#[tokio::test]
async fn invalid_subscriptions_are_rejected() {
    let (rpc, clock) = events_rpc();
    let router = router(rpc);

    let notice = failure(&router, rpc_sub("hello", "tick")).await;
    assert_eq!(notice["code"], json!(404));

    let notice = failure(&router, json!({ "type": "@@server/rpc/SUB", "module": "clock" })).await;
    assert_eq!(notice["message"], json!("Event is not defined"));

    let mut with_method = rpc_sub("clock", "tick");
    with_method["method"] = json!("double");
    let notice = failure(&router, with_method).await;
    assert_eq!(notice["code"], json!(400));

    assert_eq!(clock.listener_count("tick"), 0);
}

#[tokio::test]
async fn disconnect_detaches_module_listeners() {
    let (rpc, clock) = events_rpc();
    let router = router(rpc);
    let (client, _rx) = client("c1");

    router.dispatch_value(&client, rpc_sub("clock", "tick")).await.unwrap();
    assert_eq!(clock.listener_count("tick"), 1);

    router.on_disconnect(&client).await.unwrap();
    assert_eq!(clock.listener_count("tick"), 0);
}

#[tokio::test]
async fn module_subscription_after_disconnect_is_refused() {
    let (rpc, clock) = events_rpc();
    let router = router(rpc);
    let (client, mut rx) = client("c1");

    router.on_disconnect(&client).await.unwrap();
    let err = router.dispatch_value(&client, rpc_sub("clock", "tick")).await.unwrap_err();
    assert!(matches!(err, crate::RedboneError::ClientDisconnected(_)));
    assert_eq!(clock.listener_count("tick"), 0);
    assert!(drain(&mut rx).is_empty());
}

// ============================================================================
// Types
// ============================================================================

#[tokio::test]
async fn types_are_registered_and_configurable() {
    let mut rpc = Rpc::with_types(RpcTypes {
        return_type: "@@app/RESULT".into(),
        ..RpcTypes::default()
    });
    rpc.set_main_lib([("hello", hello())]).unwrap();
    let router = router(rpc);

    assert_eq!(router.types().get("server/rpc", "CALL"), Some("@@server/rpc/CALL"));
    assert_eq!(router.types().get("client/rpc", "RETURN"), Some("@@app/RESULT"));
    assert_eq!(router.types().get("client/rpc", "EVENT"), Some("@@client/rpc/EVENT"));

    let (client, mut rx) = client("c1");
    router
        .dispatch_value(&client, call("hello", "double", json!("a")))
        .await
        .unwrap();
    assert_eq!(drain(&mut rx)[0]["type"], json!("@@app/RESULT"));
}

#[test]
fn types_deserialize_return_key() {
    let types: RpcTypes = serde_json::from_value(json!({ "return": "@@x/RETURN" })).unwrap();
    assert_eq!(types.return_type, "@@x/RETURN");
    assert_eq!(types.call, "@@server/rpc/CALL");
}
