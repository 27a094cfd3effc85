//! Handler, catcher and type-key abstractions shared by every stage.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::action::Action;
use crate::client::Client;
use crate::router::Redbone;

/// Outcome of one handler invocation.
///
/// Together with `Err(_)` this is the three-state result every handler
/// produces: continue the chain, halt it, or fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next handler.
    Continue,
    /// Stop the dispatch here. Not an error.
    Halt,
}

impl Flow {
    /// `true` for [`Flow::Continue`].
    pub fn is_continue(self) -> bool {
        self == Flow::Continue
    }
}

impl From<()> for Flow {
    fn from(_: ()) -> Self {
        Flow::Continue
    }
}

impl From<bool> for Flow {
    fn from(proceed: bool) -> Self {
        if proceed {
            Flow::Continue
        } else {
            Flow::Halt
        }
    }
}

/// A chain participant: middleware, watcher or after-handler.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process `action` for `client`.
    async fn handle(
        &self,
        client: Arc<Client>,
        action: Arc<Action>,
        router: Redbone,
    ) -> anyhow::Result<Flow>;
}

/// Shared, type-erased handler.
pub type BoxHandler = Arc<dyn Handler>;

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut, R> Handler for FnHandler<F>
where
    F: Fn(Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Into<Flow> + Send + 'static,
{
    async fn handle(
        &self,
        client: Arc<Client>,
        action: Arc<Action>,
        router: Redbone,
    ) -> anyhow::Result<Flow> {
        (self.f)(client, action, router).await.map(Into::into)
    }
}

/// Wrap an async closure as a [`BoxHandler`].
///
/// The closure may resolve to `()` (continue), a `bool` (`false` halts) or a
/// [`Flow`].
pub fn handler_fn<F, Fut, R>(f: F) -> BoxHandler
where
    F: Fn(Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Into<Flow> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Error sink for the pipeline.
#[async_trait]
pub trait Catcher: Send + Sync + 'static {
    /// Handle `error` raised while processing `action`.
    ///
    /// Returning an error rethrows it to the caller of `dispatch`.
    async fn catch(
        &self,
        error: anyhow::Error,
        client: Arc<Client>,
        action: Arc<Action>,
        router: Redbone,
    ) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`Catcher`].
pub struct FnCatcher<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Catcher for FnCatcher<F>
where
    F: Fn(anyhow::Error, Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn catch(
        &self,
        error: anyhow::Error,
        client: Arc<Client>,
        action: Arc<Action>,
        router: Redbone,
    ) -> anyhow::Result<()> {
        (self.f)(error, client, action, router).await
    }
}

/// Wrap an async closure as a catcher.
pub fn catcher_fn<F, Fut>(f: F) -> Arc<dyn Catcher>
where
    F: Fn(anyhow::Error, Arc<Client>, Arc<Action>, Redbone) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnCatcher { f })
}

/// Which action types a handler applies to.
#[derive(Debug, Clone)]
pub enum HandlerType {
    /// Every action.
    All,
    /// Actions whose type equals the key.
    Exact(String),
    /// Actions whose type matches the pattern.
    Pattern(Regex),
}

impl HandlerType {
    /// Compile a pattern key.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(HandlerType::Pattern(Regex::new(pattern)?))
    }

    /// Whether an action of `action_type` is selected.
    pub fn matches(&self, action_type: &str) -> bool {
        match self {
            HandlerType::All => true,
            HandlerType::Exact(key) => key == action_type,
            HandlerType::Pattern(re) => re.is_match(action_type),
        }
    }

    /// Whether `action` is selected.
    pub fn is(&self, action: &Action) -> bool {
        self.matches(&action.action_type)
    }
}

impl From<&str> for HandlerType {
    fn from(key: &str) -> Self {
        HandlerType::Exact(key.to_string())
    }
}

impl From<String> for HandlerType {
    fn from(key: String) -> Self {
        HandlerType::Exact(key)
    }
}

impl From<&String> for HandlerType {
    fn from(key: &String) -> Self {
        HandlerType::Exact(key.clone())
    }
}

impl From<Regex> for HandlerType {
    fn from(re: Regex) -> Self {
        HandlerType::Pattern(re)
    }
}

impl<T: Into<HandlerType>> From<Option<T>> for HandlerType {
    fn from(key: Option<T>) -> Self {
        key.map_or(HandlerType::All, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_from_return_values() {
        assert_eq!(Flow::from(()), Flow::Continue);
        assert_eq!(Flow::from(true), Flow::Continue);
        assert_eq!(Flow::from(false), Flow::Halt);
    }

    #[test]
    fn handler_type_matching() {
        let exact = HandlerType::from("@@client/HELLO");
        let pattern = HandlerType::pattern("^@@client/").unwrap();
        let none: Option<&str> = None;

        assert!(exact.matches("@@client/HELLO"));
        assert!(!exact.matches("@@client/HELLO2"));
        assert!(pattern.matches("@@client/BYE"));
        assert!(!pattern.matches("@@server/BYE"));
        assert!(HandlerType::from(none).matches("anything"));
        assert!(exact.is(&Action::new("@@client/HELLO")));
    }
}
