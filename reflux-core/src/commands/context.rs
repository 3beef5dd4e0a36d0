//! Command Context
//!
//! A command runs twice through the same handler chain: once to perform
//! its mutation ([`DispatchMode::Execute`]) and once to declare what the
//! mutation made stale ([`DispatchMode::Invalidate`]). Both passes share one
//! [`OperationItems`] bag, the only channel between them. The bag is
//! sealed when the execute pass completes.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use super::command::{AsAny, Command, CommandType};
use super::handler::CommandHandler;
use super::resolver::ResolvedHandlers;
use crate::error::CommandError;
use crate::graph::{AnyValue, ComputeKey, ComputeMethod, ComputedGraph, InvalidationTicket, KeyArgs};

/// Which pass of a command is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    /// Perform the command's side effects.
    Execute,
    /// Invalidate what the execute pass changed; perform no side effects.
    Invalidate,
}

/// Per-operation data shared by the two passes of a command.
///
/// Items are keyed either by their type or by name. Named items keep
/// insertion order.
#[derive(Default)]
pub struct OperationItems {
    sealed: AtomicBool,
    typed: RwLock<HashMap<TypeId, AnyValue>>,
    named: RwLock<IndexMap<String, AnyValue>>,
}

impl OperationItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under its type, replacing any previous one.
    pub fn set<T: Any + Send + Sync>(&self, value: T) -> Result<(), CommandError> {
        self.check_open()?;
        self.typed.write().insert(TypeId::of::<T>(), Arc::new(value));
        Ok(())
    }

    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.typed
            .read()
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains<T: Any>(&self) -> bool {
        self.typed.read().contains_key(&TypeId::of::<T>())
    }

    pub fn set_named<T: Any + Send + Sync>(&self, name: impl Into<String>, value: T) -> Result<(), CommandError> {
        self.check_open()?;
        self.named.write().insert(name.into(), Arc::new(value));
        Ok(())
    }

    pub fn get_named<T: Any + Clone>(&self, name: &str) -> Option<T> {
        self.named
            .read()
            .get(name)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Names of the named items, in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.named.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.typed.read().len() + self.named.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    fn check_open(&self) -> Result<(), CommandError> {
        if self.is_sealed() {
            return Err(CommandError::ItemsSealed);
        }
        Ok(())
    }
}

impl fmt::Debug for OperationItems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationItems")
            .field("typed", &self.typed.read().len())
            .field("named", &self.names())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

/// State of one command dispatch, shared by both passes.
pub(crate) struct OperationState {
    pub command: Arc<dyn Command>,
    pub command_type: CommandType,
    pub items: OperationItems,
    pub graph: ComputedGraph,
    pub tickets: Mutex<Vec<InvalidationTicket>>,
    pub result: Mutex<Option<AnyValue>>,
}

/// What a handler sees of the command it is handling.
#[derive(Clone)]
pub struct CommandContext {
    state: Arc<OperationState>,
    mode: DispatchMode,
    handlers: Arc<ResolvedHandlers>,
    position: usize,
}

impl CommandContext {
    pub(crate) fn new(state: Arc<OperationState>, mode: DispatchMode, handlers: Arc<ResolvedHandlers>) -> Self {
        Self {
            state,
            mode,
            handlers,
            position: 0,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn is_invalidating(&self) -> bool {
        self.mode == DispatchMode::Invalidate
    }

    pub fn command(&self) -> &Arc<dyn Command> {
        &self.state.command
    }

    pub fn command_type(&self) -> CommandType {
        self.state.command_type
    }

    /// The command as a `C`.
    pub fn command_as<C: Command>(&self) -> Result<Arc<C>, CommandError> {
        AsAny::into_any(Arc::clone(&self.state.command))
            .downcast::<C>()
            .map_err(|_| CommandError::UnexpectedCommand {
                expected: type_name::<C>(),
            })
    }

    pub fn items(&self) -> &OperationItems {
        &self.state.items
    }

    pub fn graph(&self) -> &ComputedGraph {
        &self.state.graph
    }

    /// The handler this context was handed to.
    pub fn handler(&self) -> Option<&CommandHandler> {
        self.handlers.get(self.position)
    }

    /// Run the rest of the chain.
    pub async fn next(&self) -> Result<(), CommandError> {
        self.invoke_at(self.position + 1).await
    }

    /// Record the command's result. The last value set wins.
    pub fn set_result<R: Any + Send + Sync>(&self, result: R) {
        *self.state.result.lock() = Some(Arc::new(result));
    }

    /// Invalidate `method(args)` as part of this operation.
    ///
    /// The operation's [`settled`](super::Operation::settled) waits for the
    /// resulting propagation.
    pub fn invalidate<A, T>(&self, method: &ComputeMethod<A, T>, args: &A)
    where
        A: KeyArgs + Clone + 'static,
        T: Clone + Send + Sync + 'static,
    {
        self.invalidate_key(&method.key(args));
    }

    pub fn invalidate_key(&self, key: &ComputeKey) {
        let ticket = self.state.graph.invalidate_key(key);
        self.state.tickets.lock().push(ticket);
    }

    pub(crate) fn invoke_at(&self, position: usize) -> BoxFuture<'static, Result<(), CommandError>> {
        match self.handlers.get(position) {
            Some(handler) => handler.invoke(Self {
                position,
                ..self.clone()
            }),
            None => CommandHandler::missing(self.state.command_type),
        }
    }
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("command", &self.state.command)
            .field("mode", &self.mode)
            .field("handler", &self.handler().map(|handler| handler.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_are_typed_and_named() {
        let items = OperationItems::new();
        items.set(41u32).unwrap();
        items.set_named("before", "old".to_string()).unwrap();
        items.set_named("after", "new".to_string()).unwrap();

        assert_eq!(items.get::<u32>(), Some(41));
        assert_eq!(items.get::<u64>(), None);
        assert_eq!(items.get_named::<String>("before").as_deref(), Some("old"));
        assert_eq!(items.get_named::<u32>("before"), None);
        assert_eq!(items.names(), vec!["before", "after"]);
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn sealed_items_reject_writes() {
        let items = OperationItems::new();
        items.set(1u8).unwrap();
        items.seal();

        assert!(matches!(items.set(2u8), Err(CommandError::ItemsSealed)));
        assert!(matches!(items.set_named("x", 1), Err(CommandError::ItemsSealed)));
        assert_eq!(items.get::<u8>(), Some(1));
    }
}
