//! Remote-callable modules.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::emitter::Model;

/// Future returned by a method.
pub type MethodFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A callable taking positional arguments.
pub type Method = Arc<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

/// Named methods plus an optional event source, exposed under
/// `lib.module`.
#[derive(Clone, Default)]
pub struct RpcModule {
    methods: HashMap<String, Method>,
    events: Option<Model>,
}

impl RpcModule {
    /// Module with no methods.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let method: Method = Arc::new(move |args| method(args).boxed());
        self.methods.insert(name.into(), method);
        self
    }

    /// Make the module subscribable through `SUB`/`UNSUB`.
    pub fn with_events(mut self, model: Model) -> Self {
        self.events = Some(model);
        self
    }

    /// Method by name.
    pub fn get_method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// Event source, if any.
    pub fn events(&self) -> Option<&Model> {
        self.events.as_ref()
    }

    /// Method names.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl fmt::Debug for RpcModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.method_names().collect();
        names.sort_unstable();
        f.debug_struct("RpcModule")
            .field("methods", &names)
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// Positional arguments for a call.
///
/// With `flat` and an array, the array is spread; otherwise a present value
/// is the single argument; absent (or `null`) means no arguments.
pub(crate) fn call_arguments(arguments: Option<&Value>, flat: bool) -> Vec<Value> {
    match arguments {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) if flat => items.clone(),
        Some(value) => vec![value.clone()],
    }
}
