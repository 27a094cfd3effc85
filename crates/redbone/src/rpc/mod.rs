//! Remote procedure calls over actions.
//!
//! Callables are organised as `lib.module.method`; the lib defaults to
//! `"main"`. Three inbound control actions are handled:
//!
//! - `CALL {module, method, lib?, arguments?, flat?, merge?, backType?, id?}`
//!   invokes the method and answers with `RETURN` (or `backType`).
//! - `SUB {module, event, ...}` forwards the module's events as `EVENT`
//!   (or `backType`) actions until `UNSUB` or disconnect.
//! - `UNSUB {module, event}` stops forwarding.
//!
//! `method` and `event` are mutually exclusive. Middlewares registered with
//! [`Rpc::use_middleware`] and [`Rpc::use_for`] run before the call in the
//! order global → lib → module → method; a halt drops the call without an
//! answer.

mod module;

pub use module::{Method, MethodFuture, RpcModule};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use smallvec::SmallVec;
use tracing::debug;

use crate::action::Action;
use crate::client::Client;
use crate::error::{HttpError, RedboneError};
use crate::handler::{handler_fn, BoxHandler, Flow};
use crate::listeners::forwarder;
use crate::middleware::{self, HandlerList};
use crate::router::{Extension, Redbone, RedboneBuilder};
use crate::types::check_name;

use module::call_arguments;

/// Lib used when a name or action does not specify one.
pub const MAIN_LIB: &str = "main";

/// RPC action types.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcTypes {
    /// Inbound call.
    pub call: String,
    /// Inbound subscribe.
    pub sub: String,
    /// Inbound unsubscribe.
    pub unsub: String,
    /// Outbound call result.
    #[serde(rename = "return")]
    pub return_type: String,
    /// Outbound error.
    pub error: String,
    /// Outbound module event.
    pub event: String,
}

impl Default for RpcTypes {
    fn default() -> Self {
        Self {
            call: "@@server/rpc/CALL".into(),
            sub: "@@server/rpc/SUB".into(),
            unsub: "@@server/rpc/UNSUB".into(),
            return_type: "@@client/rpc/RETURN".into(),
            error: "@@client/rpc/ERROR".into(),
            event: "@@client/rpc/EVENT".into(),
        }
    }
}

type Lib = HashMap<String, Arc<RpcModule>>;

/// RPC extension. Configure it, then install it with
/// [`RedboneBuilder::with_extension`].
#[derive(Default)]
pub struct Rpc {
    types: RpcTypes,
    libs: HashMap<String, Lib>,
    global: Vec<BoxHandler>,
    scoped: HashMap<String, Vec<BoxHandler>>,
}

impl Rpc {
    /// Extension with the default types.
    pub fn new() -> Self {
        Self::default()
    }

    /// Extension with custom types.
    pub fn with_types(types: RpcTypes) -> Self {
        Self {
            types,
            ..Self::default()
        }
    }

    /// Types in use.
    pub fn types(&self) -> &RpcTypes {
        &self.types
    }

    /// Register (or replace) lib `name`.
    pub fn set_lib<I, S>(&mut self, name: &str, modules: I) -> Result<&mut Self, RedboneError>
    where
        I: IntoIterator<Item = (S, RpcModule)>,
        S: Into<String>,
    {
        check_name(name)?;
        let mut lib = Lib::new();
        for (module_name, module) in modules {
            let module_name = module_name.into();
            check_segment(&module_name)?;
            check_module(&module)?;
            lib.insert(module_name, Arc::new(module));
        }
        self.libs.insert(name.to_string(), lib);
        Ok(self)
    }

    /// Register (or replace) the `"main"` lib.
    pub fn set_main_lib<I, S>(&mut self, modules: I) -> Result<&mut Self, RedboneError>
    where
        I: IntoIterator<Item = (S, RpcModule)>,
        S: Into<String>,
    {
        self.set_lib(MAIN_LIB, modules)
    }

    /// Lib by name.
    pub fn get_lib(&self, name: &str) -> Option<&HashMap<String, Arc<RpcModule>>> {
        self.libs.get(name)
    }

    /// Drop a lib; `false` if it did not exist.
    pub fn remove_lib(&mut self, name: &str) -> bool {
        self.libs.remove(name).is_some()
    }

    /// Register `module` under `lib.module` (or `module` in `"main"`),
    /// creating the lib if needed.
    pub fn set_module(&mut self, name: &str, module: RpcModule) -> Result<&mut Self, RedboneError> {
        let (lib, module_name) = split_module_name(name)?;
        check_module(&module)?;
        self.libs
            .entry(lib)
            .or_default()
            .insert(module_name, Arc::new(module));
        Ok(self)
    }

    /// Module registered as `lib.module` (or `module` in `"main"`).
    ///
    /// Fails only on a malformed name.
    pub fn get_module(&self, name: &str) -> Result<Option<&Arc<RpcModule>>, RedboneError> {
        let (lib, module_name) = split_module_name(name)?;
        Ok(self.module(&lib, &module_name))
    }

    fn module(&self, lib: &str, module: &str) -> Option<&Arc<RpcModule>> {
        self.libs.get(lib)?.get(module)
    }

    /// Middleware run before every call and subscription.
    pub fn use_middleware<F, Fut, R>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Flow> + Send + 'static,
    {
        self.global.push(handler_fn(middleware));
        self
    }

    /// Middleware scoped to `lib`, `lib.module` or `lib.module.method`.
    pub fn use_for<F, Fut, R>(&mut self, target: &str, middleware: F) -> Result<&mut Self, RedboneError>
    where
        F: Fn(Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Flow> + Send + 'static,
    {
        let segments: Vec<&str> = target.split('.').collect();
        if segments.len() > 3 {
            return Err(RedboneError::InvalidName(format!(
                "middleware target {target} should have at most three dot notated values"
            )));
        }
        for segment in &segments {
            check_segment(segment)?;
        }
        self.scoped
            .entry(target.to_string())
            .or_default()
            .push(handler_fn(middleware));
        Ok(self)
    }

    /// Global, lib, module and (optionally) method middlewares, in order.
    fn middlewares_for(&self, lib: &str, module: &str, method: Option<&str>) -> HandlerList {
        let mut keys: SmallVec<[String; 3]> = SmallVec::new();
        keys.push(lib.to_string());
        keys.push(format!("{lib}.{module}"));
        if let Some(method) = method {
            keys.push(format!("{lib}.{module}.{method}"));
        }
        let mut handlers: HandlerList = self.global.iter().cloned().collect();
        for key in &keys {
            if let Some(scoped) = self.scoped.get(key) {
                handlers.extend(scoped.iter().cloned());
            }
        }
        handlers
    }

    /// Resolve `(lib, module)` from an action.
    fn target(&self, action: &Action) -> Result<(String, String), HttpError> {
        let module = action
            .get_str("module")
            .ok_or_else(|| HttpError::bad_request("Module is not defined"))?;
        match action.get_str("lib") {
            Some(lib) if !module.contains('.') => Ok((lib.to_string(), module.to_string())),
            Some(_) => Err(HttpError::bad_request(format!("Invalid module name {module}"))),
            None => split_module_name(module).map_err(|e| HttpError::bad_request(e.to_string())),
        }
    }

    fn resolve(&self, lib: &str, module: &str) -> Result<&Arc<RpcModule>, HttpError> {
        self.module(lib, module)
            .ok_or_else(|| HttpError::not_found(format!("Module {lib}.{module} is not found")))
    }

    /// Response for `action` carrying `data`: `backType` or `default_type`,
    /// merged or nested per `merge`, with the stringified `id` echoed.
    fn response(&self, action: &Action, default_type: &str, data: Value) -> Action {
        let action_type = action.get_str("backType").unwrap_or(default_type);
        let response = Action::reply(action_type, data, action.flag("merge"));
        match action.id() {
            Some(id) => response.with_field("id", id),
            None => response,
        }
    }

    async fn watch_call(&self, client: Arc<Client>, action: Arc<Action>, router: Redbone) -> anyhow::Result<Flow> {
        let (lib, module_name) = self.target(&action)?;
        let method_name = action
            .get_str("method")
            .ok_or_else(|| HttpError::bad_request("Method is not defined"))?;
        if has_field(&action, "event") {
            return Err(HttpError::bad_request("Event is not allowed in a call").into());
        }

        let middlewares = self.middlewares_for(&lib, &module_name, Some(method_name));
        if middleware::run(&middlewares, &client, &action, &router).await? == Flow::Halt {
            debug!(client_id = %client.id(), %lib, module = %module_name, method = method_name, "call dropped by middleware");
            return Ok(Flow::Halt);
        }

        let module = self.resolve(&lib, &module_name)?;
        let method = module.get_method(method_name).ok_or_else(|| {
            HttpError::not_found(format!("Method {lib}.{module_name}.{method_name} is not found"))
        })?;

        let args = call_arguments(action.get("arguments"), action.flag("flat"));
        let result = method(args).await?;
        client.dispatch(self.response(&action, &self.types.return_type, result))?;
        Ok(Flow::Continue)
    }

    async fn watch_sub(&self, client: Arc<Client>, action: Arc<Action>, router: Redbone) -> anyhow::Result<Flow> {
        let (lib, module_name) = self.target(&action)?;
        let event = subscription_event(&action)?;

        let middlewares = self.middlewares_for(&lib, &module_name, None);
        if middleware::run(&middlewares, &client, &action, &router).await? == Flow::Halt {
            return Ok(Flow::Halt);
        }

        let module = self.resolve(&lib, &module_name)?;
        let model = module
            .events()
            .ok_or_else(|| HttpError::not_found(format!("Module {lib}.{module_name} has no events")))?;

        let back_type = action
            .get_str("backType")
            .unwrap_or(&self.types.event)
            .to_string();
        let listener = forwarder(&client, back_type, action.flag("merge"), action.id());
        client.listeners().add(model, event, listener)?;
        debug!(client_id = %client.id(), %lib, module = %module_name, event, "subscribed to module events");
        Ok(Flow::Continue)
    }

    async fn watch_unsub(&self, client: Arc<Client>, action: Arc<Action>) -> anyhow::Result<Flow> {
        let (lib, module_name) = self.target(&action)?;
        let event = subscription_event(&action)?;
        let module = self.resolve(&lib, &module_name)?;
        if let Some(model) = module.events() {
            client.listeners().remove(model, event);
        }
        Ok(Flow::Continue)
    }
}

impl Extension for Rpc {
    fn install(self, mut builder: RedboneBuilder) -> Result<RedboneBuilder, RedboneError> {
        builder.types_mut().extend(
            "server/rpc",
            [
                ("CALL", self.types.call.as_str()),
                ("SUB", self.types.sub.as_str()),
                ("UNSUB", self.types.unsub.as_str()),
            ],
        )?;
        builder.types_mut().extend(
            "client/rpc",
            [
                ("RETURN", self.types.return_type.as_str()),
                ("ERROR", self.types.error.as_str()),
                ("EVENT", self.types.event.as_str()),
            ],
        )?;

        let call_type = self.types.call.clone();
        let sub_type = self.types.sub.clone();
        let unsub_type = self.types.unsub.clone();
        let rpc = Arc::new(self);
        let call = rpc.clone();
        let sub = rpc.clone();

        Ok(builder
            .with_watcher(call_type, move |client, action, router| {
                let rpc = call.clone();
                async move { rpc.watch_call(client, action, router).await }
            })
            .with_watcher(sub_type, move |client, action, router| {
                let rpc = sub.clone();
                async move { rpc.watch_sub(client, action, router).await }
            })
            .with_watcher(unsub_type, move |client, action, _router| {
                let rpc = rpc.clone();
                async move { rpc.watch_unsub(client, action).await }
            }))
    }
}

impl fmt::Debug for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rpc")
            .field("types", &self.types)
            .field("libs", &self.libs)
            .field("global", &self.global.len())
            .field("scoped", &self.scoped.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// `event` of a SUB/UNSUB action; `method` must be absent.
fn subscription_event(action: &Action) -> Result<&str, HttpError> {
    if has_field(action, "method") {
        return Err(HttpError::bad_request("Method is not allowed in a subscription"));
    }
    action
        .get_str("event")
        .ok_or_else(|| HttpError::bad_request("Event is not defined"))
}

fn has_field(action: &Action, key: &str) -> bool {
    !matches!(action.get(key), None | Some(Value::Null))
}

/// Split `lib.module` (or `module`, meaning `main.module`).
fn split_module_name(name: &str) -> Result<(String, String), RedboneError> {
    check_name(name)?;
    let segments: Vec<&str> = name.split('.').collect();
    let (lib, module) = match segments.as_slice() {
        [module] => (MAIN_LIB, *module),
        [lib, module] => (*lib, *module),
        _ => {
            return Err(RedboneError::InvalidName(
                "invalid name of module, it should be string with two dot notated values".into(),
            ))
        }
    };
    check_segment(lib)?;
    check_segment(module)?;
    Ok((lib.to_string(), module.to_string()))
}

fn check_segment(segment: &str) -> Result<(), RedboneError> {
    if segment.is_empty() || segment.contains('.') {
        return Err(RedboneError::InvalidName(format!("invalid name segment {segment:?}")));
    }
    Ok(())
}

fn check_module(module: &RpcModule) -> Result<(), RedboneError> {
    for name in module.method_names() {
        check_segment(name)?;
    }
    Ok(())
}
