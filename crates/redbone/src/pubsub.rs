//! Pub/Sub: subscribe clients to model events through `SUB`/`UNSUB` actions.
//!
//! Models are grouped into named sets (`"default"` unless the action names
//! one). A `SUB` action `{model, event, backType, set?, merge?}` attaches a
//! listener that re-dispatches every `event` of the model to the client as
//! `backType`. `UNSUB {model, event, set?}` detaches it. Listeners go through
//! the client's [`ListenerCounter`](crate::ListenerCounter), so they are
//! detached automatically on disconnect.
//!
//! Gates run before a subscription is attached, in this order: global
//! middlewares, then the model's guards, then the model-event's guards. Any
//! of them may halt. Guards belong to the model itself, so they also apply
//! when the same model is registered under another set or name.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::action::Action;
use crate::client::Client;
use crate::emitter::Model;
use crate::error::{HttpError, RedboneError};
use crate::handler::{handler_fn, BoxHandler, Flow};
use crate::listeners::{forwarder, ModelKey};
use crate::middleware;
use crate::router::{Extension, Redbone, RedboneBuilder};
use crate::types::check_name;

/// Set used when an action or registration names none.
pub const DEFAULT_SET: &str = "default";

/// Control action types.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PubsubTypes {
    /// Subscribe.
    pub sub: String,
    /// Unsubscribe.
    pub unsub: String,
}

impl Default for PubsubTypes {
    fn default() -> Self {
        Self {
            sub: "@@server/SUB".into(),
            unsub: "@@server/UNSUB".into(),
        }
    }
}

/// A resolved subscription request, handed to model guards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Model set.
    pub set: String,
    /// Model name inside the set.
    pub model: String,
    /// Model event.
    pub event: String,
    /// Type of the forwarded actions.
    pub back_type: String,
    /// Flatten event data into the action root.
    pub merge: bool,
}

/// Gate deciding whether a client may subscribe to a model (event).
#[async_trait]
pub trait ModelGuard: Send + Sync + 'static {
    /// `Flow::Halt` refuses the subscription silently.
    async fn check(&self, client: Arc<Client>, subscription: Arc<Subscription>) -> anyhow::Result<Flow>;
}

struct FnGuard<F> {
    f: F,
}

#[async_trait]
impl<F, Fut, R> ModelGuard for FnGuard<F>
where
    F: Fn(Arc<Client>, Arc<Subscription>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Into<Flow> + Send + 'static,
{
    async fn check(&self, client: Arc<Client>, subscription: Arc<Subscription>) -> anyhow::Result<Flow> {
        (self.f)(client, subscription).await.map(Into::into)
    }
}

#[derive(Default)]
struct ModelGuards {
    main: Vec<Arc<dyn ModelGuard>>,
    events: HashMap<String, Vec<Arc<dyn ModelGuard>>>,
}

/// Pub/Sub extension. Configure it, then install it with
/// [`RedboneBuilder::with_extension`].
#[derive(Default)]
pub struct Pubsub {
    types: PubsubTypes,
    sets: HashMap<String, HashMap<String, Model>>,
    middlewares: Vec<BoxHandler>,
    guards: HashMap<ModelKey, ModelGuards>,
}

impl Pubsub {
    /// Extension with the default control types.
    pub fn new() -> Self {
        Self::default()
    }

    /// Extension with custom control types.
    pub fn with_types(types: PubsubTypes) -> Self {
        Self {
            types,
            ..Self::default()
        }
    }

    /// Control types in use.
    pub fn types(&self) -> &PubsubTypes {
        &self.types
    }

    /// Register (or replace) a whole set of models.
    pub fn add_set_of_models<I, S>(&mut self, set: &str, models: I) -> Result<&mut Self, RedboneError>
    where
        I: IntoIterator<Item = (S, Model)>,
        S: Into<String>,
    {
        check_name(set)?;
        let mut table = HashMap::new();
        for (name, model) in models {
            let name = name.into();
            check_name(&name)?;
            table.insert(name, model);
        }
        self.sets.insert(set.to_string(), table);
        Ok(self)
    }

    /// Register (or replace) the `"default"` set.
    pub fn add_default_set<I, S>(&mut self, models: I) -> Result<&mut Self, RedboneError>
    where
        I: IntoIterator<Item = (S, Model)>,
        S: Into<String>,
    {
        self.add_set_of_models(DEFAULT_SET, models)
    }

    /// Add one model to a set, creating the set if needed.
    pub fn add_model_to_set(&mut self, set: &str, name: &str, model: Model) -> Result<&mut Self, RedboneError> {
        check_name(set)?;
        check_name(name)?;
        self.sets
            .entry(set.to_string())
            .or_default()
            .insert(name.to_string(), model);
        Ok(self)
    }

    /// Model registered as `set/name`.
    pub fn find_model(&self, set: &str, name: &str) -> Option<&Model> {
        self.sets.get(set)?.get(name)
    }

    /// Middleware run for every `SUB` action, before any model lookup.
    pub fn use_middleware<F, Fut, R>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Flow> + Send + 'static,
    {
        self.middlewares.push(handler_fn(middleware));
        self
    }

    /// Guard for subscriptions to the model registered as `set/model`, or
    /// only to its `event`. The model must be registered first.
    pub fn use_for_model<F, Fut, R>(
        &mut self,
        set: &str,
        model: &str,
        event: Option<&str>,
        guard: F,
    ) -> Result<&mut Self, RedboneError>
    where
        F: Fn(Arc<Client>, Arc<Subscription>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Flow> + Send + 'static,
    {
        let key = self
            .find_model(set, model)
            .map(ModelKey::of)
            .ok_or_else(|| RedboneError::UnknownModel {
                set: set.to_string(),
                model: model.to_string(),
            })?;
        if let Some(event) = event {
            check_name(event)?;
        }
        let guard: Arc<dyn ModelGuard> = Arc::new(FnGuard { f: guard });
        let guards = self.guards.entry(key).or_default();
        match event {
            Some(event) => guards.events.entry(event.to_string()).or_default().push(guard),
            None => guards.main.push(guard),
        }
        Ok(self)
    }

    /// A halting middleware or guard ends the whole dispatch, so
    /// [`Redbone::dispatch`] returns `Ok(false)` for a refused subscription.
    async fn watch_sub(&self, client: Arc<Client>, action: Arc<Action>, router: Redbone) -> anyhow::Result<Flow> {
        let model_name = action
            .get_str("model")
            .ok_or_else(|| HttpError::bad_request("Model is not defined"))?;
        let event = action
            .get_str("event")
            .ok_or_else(|| HttpError::bad_request("Event is not defined"))?;
        let back_type = action
            .get_str("backType")
            .ok_or_else(|| HttpError::bad_request("Back Type is not defined"))?;
        let set = action.get_str("set").unwrap_or(DEFAULT_SET);

        if middleware::run(&self.middlewares, &client, &action, &router).await? == Flow::Halt {
            return Ok(Flow::Halt);
        }

        let Some(model) = self.find_model(set, model_name) else {
            debug!(client_id = %client.id(), set, model = model_name, "subscribe to unknown model ignored");
            return Ok(Flow::Continue);
        };

        let subscription = Arc::new(Subscription {
            set: set.to_string(),
            model: model_name.to_string(),
            event: event.to_string(),
            back_type: back_type.to_string(),
            merge: action.flag("merge"),
        });

        if let Some(guards) = self.guards.get(&ModelKey::of(model)) {
            let event_guards = guards.events.get(event).into_iter().flatten();
            for guard in guards.main.iter().chain(event_guards) {
                if guard.check(client.clone(), subscription.clone()).await? == Flow::Halt {
                    return Ok(Flow::Halt);
                }
            }
        }

        let listener = forwarder(&client, subscription.back_type.clone(), subscription.merge, None);
        client.listeners().add(model, event, listener)?;
        debug!(client_id = %client.id(), set, model = model_name, event, "subscribed");
        Ok(Flow::Continue)
    }

    async fn watch_unsub(&self, client: Arc<Client>, action: Arc<Action>) -> anyhow::Result<Flow> {
        let model_name = action
            .get_str("model")
            .ok_or_else(|| HttpError::bad_request("Model is not defined"))?;
        let event = action
            .get_str("event")
            .ok_or_else(|| HttpError::bad_request("Event is not defined"))?;
        let set = action.get_str("set").unwrap_or(DEFAULT_SET);

        if let Some(model) = self.find_model(set, model_name) {
            if client.listeners().remove(model, event) {
                debug!(client_id = %client.id(), set, model = model_name, event, "unsubscribed");
            }
        }
        Ok(Flow::Continue)
    }
}

impl Extension for Pubsub {
    fn install(self, mut builder: RedboneBuilder) -> Result<RedboneBuilder, RedboneError> {
        builder.types_mut().extend(
            "server",
            [("SUB", self.types.sub.as_str()), ("UNSUB", self.types.unsub.as_str())],
        )?;
        let sub_type = self.types.sub.clone();
        let unsub_type = self.types.unsub.clone();
        let pubsub = Arc::new(self);
        let sub = pubsub.clone();

        Ok(builder
            .with_watcher(sub_type, move |client, action, router| {
                let pubsub = sub.clone();
                async move { pubsub.watch_sub(client, action, router).await }
            })
            .with_watcher(unsub_type, move |client, action, _router| {
                let pubsub = pubsub.clone();
                async move { pubsub.watch_unsub(client, action).await }
            }))
    }
}

impl fmt::Debug for Pubsub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pubsub")
            .field("types", &self.types)
            .field("sets", &self.sets.keys().collect::<Vec<_>>())
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}
