//! Ordered, short-circuiting handler chains.
//!
//! A chain backs every multi-handler stage of the router (before, after) and
//! the gate lists of the extensions. For a given action type the handlers run
//! in this order:
//!
//! 1. unconditional handlers, in registration order
//! 2. handlers registered for exactly that type, in registration order
//! 3. handlers of every matching pattern, patterns in the order they were
//!    first registered, each pattern's handlers in registration order
//!
//! Handlers run strictly one after another. The first [`Flow::Halt`] stops
//! the chain; the first error aborts it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use smallvec::SmallVec;
use tracing::trace;

use crate::action::Action;
use crate::client::Client;
use crate::handler::{BoxHandler, Flow, HandlerType};
use crate::router::Redbone;

/// Handlers selected for one action.
pub type HandlerList = SmallVec<[BoxHandler; 8]>;

/// Typed handler chain for one processing stage.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    all: Vec<BoxHandler>,
    exact: HashMap<String, Vec<BoxHandler>>,
    // Keyed by pattern source; one entry per distinct pattern.
    patterns: Vec<(Regex, Vec<BoxHandler>)>,
}

impl MiddlewareChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `key`.
    pub fn use_handler(&mut self, key: HandlerType, handler: BoxHandler) -> &mut Self {
        match key {
            HandlerType::All => self.all.push(handler),
            HandlerType::Exact(action_type) => {
                self.exact.entry(action_type).or_default().push(handler);
            }
            HandlerType::Pattern(re) => {
                match self
                    .patterns
                    .iter_mut()
                    .find(|(existing, _)| existing.as_str() == re.as_str())
                {
                    Some((_, handlers)) => handlers.push(handler),
                    None => self.patterns.push((re, vec![handler])),
                }
            }
        }
        self
    }

    /// Ordered handlers applying to `action_type`.
    pub fn handlers(&self, action_type: &str) -> HandlerList {
        let mut handlers: HandlerList = self.all.iter().cloned().collect();
        if let Some(exact) = self.exact.get(action_type) {
            handlers.extend(exact.iter().cloned());
        }
        for (re, pattern_handlers) in &self.patterns {
            if re.is_match(action_type) {
                handlers.extend(pattern_handlers.iter().cloned());
            }
        }
        handlers
    }

    /// Total number of registered handlers.
    pub fn len(&self) -> usize {
        self.all.len()
            + self.exact.values().map(Vec::len).sum::<usize>()
            + self.patterns.iter().map(|(_, h)| h.len()).sum::<usize>()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the handlers selected for `action`.
    pub async fn dispatch(
        &self,
        client: &Arc<Client>,
        action: &Arc<Action>,
        router: &Redbone,
    ) -> anyhow::Result<Flow> {
        let handlers = self.handlers(&action.action_type);
        run(&handlers, client, action, router).await
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("all", &self.all.len())
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field(
                "patterns",
                &self.patterns.iter().map(|(re, _)| re.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Await `handlers` in order, stopping at the first halt.
pub async fn run(
    handlers: &[BoxHandler],
    client: &Arc<Client>,
    action: &Arc<Action>,
    router: &Redbone,
) -> anyhow::Result<Flow> {
    for (index, handler) in handlers.iter().enumerate() {
        let flow = handler
            .handle(client.clone(), action.clone(), router.clone())
            .await?;
        if flow == Flow::Halt {
            trace!(
                client_id = %client.id(),
                action_type = %action.action_type,
                index,
                "handler halted the chain"
            );
            return Ok(Flow::Halt);
        }
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn noop() -> BoxHandler {
        handler_fn(|_, _, _| async { Ok(()) })
    }

    #[test]
    fn same_pattern_shares_one_bucket() {
        let mut chain = MiddlewareChain::new();
        chain
            .use_handler(HandlerType::pattern("^a").unwrap(), noop())
            .use_handler(HandlerType::pattern("^a").unwrap(), noop())
            .use_handler("b".into(), noop());

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.handlers("abc").len(), 2);
        assert_eq!(chain.handlers("b").len(), 1);
        assert!(chain.handlers("c").is_empty());
        assert!(format!("{chain:?}").contains(r#"patterns: ["^a"]"#));
    }

    #[test]
    fn empty_chain() {
        let chain = MiddlewareChain::new();
        assert!(chain.is_empty());
        assert!(chain.handlers("anything").is_empty());
    }
}
