//! The router: lifecycle actions, the before/watch/after pipeline and the catcher.
//!
//! ```text
//! dispatch(client, action)
//!     │ validate type, bind client
//!     ▼
//! BEFORE chain ── Halt ──► Ok(false)
//!     │
//!     ▼
//! WATCH (one watcher per exact type) ── Halt ──► Ok(false)
//!     │
//!     ▼
//! AFTER chain ── Halt ──► Ok(false)
//!     │
//!     ▼
//! Ok(true)
//!
//! any Err ──► catcher ──► Ok(false) | Err(Unhandled)
//! ```
//!
//! All registration happens on [`RedboneBuilder`]. [`RedboneBuilder::build`]
//! freezes the chains, the watcher map and the type registry, so request
//! processing reads them without locks.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::action::Action;
use crate::client::Client;
use crate::error::{HttpError, RedboneError};
use crate::handler::{catcher_fn, handler_fn, BoxHandler, Catcher, Flow, HandlerType};
use crate::middleware::MiddlewareChain;
use crate::types::{ActionTypes, LifecycleTypes, TypesDef};

/// Something that plugs watchers, middlewares and types into a router.
pub trait Extension {
    /// Register everything the extension needs on `builder`.
    fn install(self, builder: RedboneBuilder) -> Result<RedboneBuilder, RedboneError>;
}

/// Catcher used unless one is installed: notifies the client.
///
/// An [`HttpError`] becomes `{type: ERROR, code, status, message}`; anything
/// else becomes `{type: ERROR, err}`. The failing action's `id`, if any, is
/// echoed back.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCatcher;

#[async_trait]
impl Catcher for DefaultCatcher {
    async fn catch(
        &self,
        error: anyhow::Error,
        client: Arc<Client>,
        action: Arc<Action>,
        router: Redbone,
    ) -> anyhow::Result<()> {
        let error_type = router.lifecycle().error.as_str();
        let mut notice = match error.downcast_ref::<HttpError>() {
            Some(http) => Action::new(error_type)
                .with_field("code", http.code)
                .with_field("status", http.status())
                .with_field("message", http.message.clone()),
            None => Action::new(error_type).with_field("err", error.to_string()),
        };
        if let Some(id) = action.id() {
            notice = notice.with_field("id", id);
        }
        client.dispatch(notice)?;
        Ok(())
    }
}

/// Catcher that hands every error back to the caller of `dispatch`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RethrowCatcher;

#[async_trait]
impl Catcher for RethrowCatcher {
    async fn catch(
        &self,
        error: anyhow::Error,
        _client: Arc<Client>,
        _action: Arc<Action>,
        _router: Redbone,
    ) -> anyhow::Result<()> {
        Err(error)
    }
}

/// Builder for [`Redbone`].
pub struct RedboneBuilder {
    types: ActionTypes,
    lifecycle: LifecycleTypes,
    before: MiddlewareChain,
    watchers: HashMap<String, BoxHandler>,
    after: MiddlewareChain,
    catcher: Option<Arc<dyn Catcher>>,
}

impl Default for RedboneBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RedboneBuilder {
    /// Builder with default lifecycle types and the default catcher.
    pub fn new() -> Self {
        Self {
            types: ActionTypes::new(),
            lifecycle: LifecycleTypes::default(),
            before: MiddlewareChain::new(),
            watchers: HashMap::new(),
            after: MiddlewareChain::new(),
            catcher: None,
        }
    }

    /// Override the lifecycle types.
    pub fn with_lifecycle_types(mut self, lifecycle: LifecycleTypes) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Register an action type namespace `@@<name>/<KEY>`.
    pub fn with_types<I, S>(mut self, name: &str, keys: I) -> Result<Self, RedboneError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types.register(name, keys)?;
        Ok(self)
    }

    /// Register an action type namespace from its declaration.
    pub fn with_types_def(mut self, name: &str, def: &TypesDef) -> Result<Self, RedboneError> {
        self.types.register_def(name, def)?;
        Ok(self)
    }

    /// Type registry being built.
    pub fn types_mut(&mut self) -> &mut ActionTypes {
        &mut self.types
    }

    /// Type registry being built.
    pub fn types(&self) -> &ActionTypes {
        &self.types
    }

    /// Before-middleware for every action.
    pub fn with_middleware<F, Fut, R>(self, middleware: F) -> Self
    where
        F: Fn(Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Flow> + Send + 'static,
    {
        self.use_handler(HandlerType::All, handler_fn(middleware))
    }

    /// Before-middleware for actions selected by `key`.
    pub fn with_middleware_for<K, F, Fut, R>(self, key: K, middleware: F) -> Self
    where
        K: Into<HandlerType>,
        F: Fn(Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Flow> + Send + 'static,
    {
        self.use_handler(key.into(), handler_fn(middleware))
    }

    /// Register several before-middlewares for one key, in order.
    pub fn with_middlewares<K, I>(mut self, key: K, handlers: I) -> Self
    where
        K: Into<HandlerType>,
        I: IntoIterator<Item = BoxHandler>,
    {
        let key = key.into();
        for handler in handlers {
            self.before.use_handler(key.clone(), handler);
        }
        self
    }

    /// Register a type-erased before-middleware.
    pub fn use_handler(mut self, key: HandlerType, handler: BoxHandler) -> Self {
        self.before.use_handler(key, handler);
        self
    }

    /// Watcher for one exact action type. A later registration for the same
    /// type replaces the earlier one.
    pub fn with_watcher<F, Fut, R>(self, action_type: impl Into<String>, watcher: F) -> Self
    where
        F: Fn(Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Flow> + Send + 'static,
    {
        self.watch(action_type, handler_fn(watcher))
    }

    /// Register a type-erased watcher.
    pub fn watch(mut self, action_type: impl Into<String>, watcher: BoxHandler) -> Self {
        let action_type = action_type.into();
        if self.watchers.insert(action_type.clone(), watcher).is_some() {
            debug!(%action_type, "watcher replaced");
        }
        self
    }

    /// Register `(type, watcher)` pairs.
    pub fn with_watchers<I, S>(self, watchers: I) -> Self
    where
        I: IntoIterator<Item = (S, BoxHandler)>,
        S: Into<String>,
    {
        watchers
            .into_iter()
            .fold(self, |builder, (action_type, watcher)| builder.watch(action_type, watcher))
    }

    /// After-handler for every action that passed the watch stage.
    pub fn with_after<F, Fut, R>(self, handler: F) -> Self
    where
        F: Fn(Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Flow> + Send + 'static,
    {
        self.use_after(HandlerType::All, handler_fn(handler))
    }

    /// After-handler for actions selected by `key`.
    pub fn with_after_for<K, F, Fut, R>(self, key: K, handler: F) -> Self
    where
        K: Into<HandlerType>,
        F: Fn(Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Flow> + Send + 'static,
    {
        self.use_after(key.into(), handler_fn(handler))
    }

    /// Register a type-erased after-handler.
    pub fn use_after(mut self, key: HandlerType, handler: BoxHandler) -> Self {
        self.after.use_handler(key, handler);
        self
    }

    /// Replace the catcher with an async closure.
    pub fn with_catcher<F, Fut>(self, catcher: F) -> Self
    where
        F: Fn(anyhow::Error, Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.catch(catcher_fn(catcher))
    }

    /// Replace the catcher.
    pub fn catch(mut self, catcher: Arc<dyn Catcher>) -> Self {
        if self.catcher.replace(catcher).is_some() {
            warn!("replacing previously installed catcher");
        }
        self
    }

    /// Install an extension.
    pub fn with_extension<E: Extension>(self, extension: E) -> Result<Self, RedboneError> {
        extension.install(self)
    }

    /// Freeze the configuration.
    pub fn build(mut self) -> Result<Redbone, RedboneError> {
        let lifecycle = self.lifecycle.clone();
        self.types.extend(
            "server",
            [
                ("CONNECTION", lifecycle.connection.as_str()),
                ("DISCONNECT", lifecycle.disconnect.as_str()),
                ("ERROR", lifecycle.error.as_str()),
            ],
        )?;
        debug!(
            before = self.before.len(),
            watchers = self.watchers.len(),
            after = self.after.len(),
            "router built"
        );
        Ok(Redbone {
            inner: Arc::new(RouterInner {
                types: self.types,
                lifecycle,
                before: self.before,
                watchers: self.watchers,
                after: self.after,
                catcher: self.catcher.unwrap_or_else(|| Arc::new(DefaultCatcher)),
            }),
        })
    }
}

struct RouterInner {
    types: ActionTypes,
    lifecycle: LifecycleTypes,
    before: MiddlewareChain,
    watchers: HashMap<String, BoxHandler>,
    after: MiddlewareChain,
    catcher: Arc<dyn Catcher>,
}

/// Two-way action dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Redbone {
    inner: Arc<RouterInner>,
}

impl Redbone {
    /// Start configuring a router.
    pub fn builder() -> RedboneBuilder {
        RedboneBuilder::new()
    }

    /// Action type registry.
    pub fn types(&self) -> &ActionTypes {
        &self.inner.types
    }

    /// Lifecycle types.
    pub fn lifecycle(&self) -> &LifecycleTypes {
        &self.inner.lifecycle
    }

    /// Whether a watcher is registered for `action_type`.
    pub fn has_watcher(&self, action_type: &str) -> bool {
        self.inner.watchers.contains_key(action_type)
    }

    /// Bind `client` to this router unless it is already bound elsewhere.
    pub fn bind(&self, client: &Arc<Client>) -> &Self {
        if client.bind(self) {
            debug!(client_id = %client.id(), "client bound");
        }
        self
    }

    /// Run `action` through the pipeline for `client`.
    ///
    /// Returns `Ok(true)` when every stage completed, `Ok(false)` when a
    /// handler halted the dispatch or an error was handled by the catcher.
    /// An action without a type, or a client that already disconnected,
    /// fails before any handler runs.
    pub async fn dispatch(&self, client: &Arc<Client>, action: Action) -> Result<bool, RedboneError> {
        action.validate()?;
        if client.is_disconnected() {
            return Err(RedboneError::ClientDisconnected(client.id().to_string()));
        }
        self.bind(client);
        let action = Arc::new(action);

        match self.run_stages(client, &action).await {
            Ok(Flow::Continue) => Ok(true),
            Ok(Flow::Halt) => {
                debug!(
                    client_id = %client.id(),
                    action_type = %action.action_type,
                    "dispatch short-circuited"
                );
                Ok(false)
            }
            Err(error) => {
                warn!(
                    client_id = %client.id(),
                    action_type = %action.action_type,
                    error = %error,
                    "dispatch failed"
                );
                self.inner
                    .catcher
                    .catch(error, client.clone(), action, self.clone())
                    .await
                    .map_err(RedboneError::Unhandled)?;
                Ok(false)
            }
        }
    }

    /// Validate a raw wire value and dispatch it.
    pub async fn dispatch_value(&self, client: &Arc<Client>, value: Value) -> Result<bool, RedboneError> {
        let action = Action::from_value(value)?;
        self.dispatch(client, action).await
    }

    async fn run_stages(&self, client: &Arc<Client>, action: &Arc<Action>) -> anyhow::Result<Flow> {
        if self.inner.before.dispatch(client, action, self).await? == Flow::Halt {
            return Ok(Flow::Halt);
        }
        if let Some(watcher) = self.inner.watchers.get(&action.action_type) {
            let flow = watcher
                .handle(client.clone(), action.clone(), self.clone())
                .await?;
            if flow == Flow::Halt {
                return Ok(Flow::Halt);
            }
        }
        self.inner.after.dispatch(client, action, self).await
    }

    /// Dispatch the CONNECTION lifecycle action.
    pub async fn on_connection(&self, client: &Arc<Client>) -> Result<bool, RedboneError> {
        debug!(client_id = %client.id(), "client connected");
        let action = Action::new(self.inner.lifecycle.connection.clone());
        self.dispatch(client, action).await
    }

    /// Dispatch the DISCONNECT lifecycle action, then detach every listener
    /// the client still holds.
    pub async fn on_disconnect(&self, client: &Arc<Client>) -> Result<bool, RedboneError> {
        debug!(client_id = %client.id(), "client disconnected");
        let action = Action::new(self.inner.lifecycle.disconnect.clone());
        let result = self.dispatch(client, action).await;
        client.disconnect();
        result
    }
}

impl fmt::Debug for Redbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redbone")
            .field("lifecycle", &self.inner.lifecycle)
            .field("before", &self.inner.before)
            .field("watchers", &self.inner.watchers.keys().collect::<Vec<_>>())
            .field("after", &self.inner.after)
            .finish()
    }
}
