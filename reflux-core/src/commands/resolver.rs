//! Handler Resolution
//!
//! Resolution turns the registered handlers into the ordered chain for one
//! command type. Results are cached per command type and capability closure,
//! failures included. A hand-built [`CommandTypeInfo`] with a different
//! closure for the same type gets its own resolution.
//!
//! # Algorithm
//!
//! 1. Keep every handler whose target is in the command type's capability
//!    closure and that every [`HandlerFilter`] accepts
//! 2. Order by priority (descending), then by distance of the target from
//!    the command type (descending, so broader targets wrap narrower ones).
//!    Ties keep registration order
//! 3. Drop repeated handler ids, keeping the first
//! 4. Require at most one terminal handler. More than one is a
//!    [`ConfigurationError`], logged once and returned by every later
//!    resolution of the type

use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, error};

use super::command::{Command, CommandType, CommandTypeInfo};
use super::handler::{CommandHandler, HandlerId};
use crate::error::ConfigurationError;

/// Predicate deciding whether a handler takes part in a command's chain.
pub trait HandlerFilter: Send + Sync {
    fn is_used(&self, handler: &CommandHandler, command: &CommandType) -> bool;
}

impl<F> HandlerFilter for F
where
    F: Fn(&CommandHandler, &CommandType) -> bool + Send + Sync,
{
    fn is_used(&self, handler: &CommandHandler, command: &CommandType) -> bool {
        self(handler, command)
    }
}

/// The handler chain of one command type, outermost first.
#[derive(Debug)]
pub struct ResolvedHandlers {
    command: CommandType,
    handlers: Vec<CommandHandler>,
}

impl ResolvedHandlers {
    pub fn command(&self) -> CommandType {
        self.command
    }

    pub fn get(&self, position: usize) -> Option<&CommandHandler> {
        self.handlers.get(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandHandler> {
        self.handlers.iter()
    }

    pub fn ids(&self) -> Vec<&HandlerId> {
        self.handlers.iter().map(|handler| handler.id()).collect()
    }

    pub fn terminal(&self) -> Option<&CommandHandler> {
        self.handlers.iter().find(|handler| !handler.is_filter())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub type Resolution = Result<Arc<ResolvedHandlers>, ConfigurationError>;

/// Cache key: the command type plus its closure, distances included.
type ResolutionKey = Vec<(TypeId, usize)>;

fn resolution_key(info: &CommandTypeInfo) -> ResolutionKey {
    info.closure()
        .iter()
        .map(|(target, distance)| (target.id(), *distance))
        .collect()
}

/// Registry of handlers with a per-type resolution cache.
#[derive(Default)]
pub struct HandlerResolver {
    handlers: RwLock<Vec<CommandHandler>>,
    filters: RwLock<Vec<Arc<dyn HandlerFilter>>>,
    cache: DashMap<ResolutionKey, Resolution>,
}

impl HandlerResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handlers(handlers: impl IntoIterator<Item = CommandHandler>) -> Self {
        let resolver = Self::new();
        resolver.handlers.write().extend(handlers);
        resolver
    }

    /// Add a handler. Invalidates every cached resolution.
    pub fn register(&self, handler: CommandHandler) {
        debug!(handler = %handler, "registered command handler");
        self.handlers.write().push(handler);
        self.cache.clear();
    }

    /// Add a filter. Invalidates every cached resolution.
    pub fn add_filter(&self, filter: impl HandlerFilter + 'static) {
        self.filters.write().push(Arc::new(filter));
        self.cache.clear();
    }

    /// The handler chain for `C`.
    pub fn resolve<C: Command>(&self) -> Resolution {
        self.resolve_info(&CommandTypeInfo::of::<C>())
    }

    /// The handler chain for a command described at runtime.
    pub fn resolve_info(&self, info: &CommandTypeInfo) -> Resolution {
        let key = resolution_key(info);
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }
        self.cache
            .entry(key)
            .or_insert_with(|| self.build(info))
            .clone()
    }

    /// Drop every cached resolution.
    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    fn build(&self, info: &CommandTypeInfo) -> Resolution {
        let command = info.command();
        let handlers = self.handlers.read();
        let filters = self.filters.read();

        let mut matched: Vec<(usize, &CommandHandler)> = handlers
            .iter()
            .filter_map(|handler| info.distance(&handler.target()).map(|distance| (distance, handler)))
            .filter(|(_, handler)| filters.iter().all(|filter| filter.is_used(handler, &command)))
            .collect();
        matched.sort_by(|(a_distance, a), (b_distance, b)| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| b_distance.cmp(a_distance))
        });

        let mut seen = HashSet::new();
        let chain: Vec<CommandHandler> = matched
            .into_iter()
            .filter(|(_, handler)| seen.insert(handler.id().clone()))
            .map(|(_, handler)| handler.clone())
            .collect();

        let terminals: Vec<String> = chain
            .iter()
            .filter(|handler| !handler.is_filter())
            .map(|handler| handler.id().to_string())
            .collect();
        if terminals.len() > 1 {
            let err = ConfigurationError {
                command: command.name(),
                handlers: terminals,
            };
            let resolved: Vec<String> = chain.iter().map(|handler| handler.to_string()).collect();
            error!(
                severity = "critical",
                command = %command,
                handlers = ?resolved,
                "{err}"
            );
            return Err(err);
        }

        debug!(command = %command, handlers = chain.len(), "resolved command handlers");
        Ok(Arc::new(ResolvedHandlers { command, handlers: chain }))
    }
}

impl fmt::Debug for HandlerResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerResolver")
            .field("handlers", &self.handlers.read().len())
            .field("filters", &self.filters.read().len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::AnyCommand;

    trait Audited {}

    #[derive(Debug)]
    struct Deposit;

    impl Audited for Deposit {}

    impl Command for Deposit {
        fn capabilities() -> Vec<CommandType> {
            vec![CommandType::of::<dyn Audited>()]
        }
    }

    #[derive(Debug)]
    struct Withdraw;

    impl Command for Withdraw {}

    fn noop_terminal<C: Command>(id: &str, priority: i32) -> CommandHandler {
        CommandHandler::terminal::<C, _, _>(id, priority, |_, _| async { Ok(()) })
    }

    fn noop_filter<T: ?Sized + 'static>(id: &str, priority: i32) -> CommandHandler {
        CommandHandler::filter::<T, _, _>(id, priority, |ctx| async move { ctx.next().await })
    }

    fn ids(resolution: &Resolution) -> Vec<String> {
        resolution
            .as_ref()
            .unwrap()
            .ids()
            .into_iter()
            .map(|id| id.to_string())
            .collect()
    }

    #[test]
    fn broader_targets_wrap_narrower_ones_at_equal_priority() {
        let resolver = HandlerResolver::with_handlers([
            noop_terminal::<Deposit>("deposit", 0),
            noop_filter::<dyn Audited>("audit", 0),
            noop_filter::<AnyCommand>("log", 0),
        ]);
        assert_eq!(ids(&resolver.resolve::<Deposit>()), ["log", "audit", "deposit"]);
    }

    #[test]
    fn priority_beats_distance() {
        let resolver = HandlerResolver::with_handlers([
            noop_filter::<AnyCommand>("log", 0),
            noop_filter::<Deposit>("validate", 100),
            noop_terminal::<Deposit>("deposit", 0),
        ]);
        assert_eq!(ids(&resolver.resolve::<Deposit>()), ["validate", "log", "deposit"]);
    }

    #[test]
    fn unrelated_handlers_are_skipped() {
        let resolver = HandlerResolver::with_handlers([
            noop_terminal::<Deposit>("deposit", 0),
            noop_terminal::<Withdraw>("withdraw", 0),
            noop_filter::<dyn Audited>("audit", 0),
        ]);
        assert_eq!(ids(&resolver.resolve::<Withdraw>()), ["withdraw"]);
    }

    #[test]
    fn duplicate_ids_keep_first() {
        let resolver = HandlerResolver::with_handlers([
            noop_filter::<AnyCommand>("log", 5),
            noop_filter::<AnyCommand>("log", 1),
            noop_terminal::<Withdraw>("withdraw", 0),
        ]);
        let resolved = resolver.resolve::<Withdraw>().unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved.get(0).map(|h| h.priority()), Some(5));
    }

    #[test]
    fn filters_exclude_handlers() {
        let resolver = HandlerResolver::with_handlers([
            noop_filter::<AnyCommand>("log", 0),
            noop_terminal::<Withdraw>("withdraw", 0),
        ]);
        resolver.add_filter(|handler: &CommandHandler, _: &CommandType| handler.id().as_str() != "log");
        assert_eq!(ids(&resolver.resolve::<Withdraw>()), ["withdraw"]);
    }

    #[test]
    fn clear_rebuilds_chain() {
        let resolver = HandlerResolver::with_handlers([noop_terminal::<Withdraw>("withdraw", 0)]);
        let first = resolver.resolve::<Withdraw>().unwrap();
        resolver.clear();
        let second = resolver.resolve::<Withdraw>().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn closures_are_resolved_separately() {
        let resolver = HandlerResolver::with_handlers([
            noop_terminal::<Deposit>("deposit", 0),
            noop_filter::<dyn Audited>("audit", 0),
        ]);
        let bare = CommandTypeInfo::new(CommandType::of::<Deposit>(), Vec::new());
        assert_eq!(ids(&resolver.resolve_info(&bare)), ["deposit"]);
        assert_eq!(ids(&resolver.resolve::<Deposit>()), ["audit", "deposit"]);
        assert_eq!(ids(&resolver.resolve_info(&bare)), ["deposit"]);
    }
}
