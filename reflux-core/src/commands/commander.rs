//! Commander
//!
//! Dispatches a command through its resolved handler chain twice:
//!
//! 1. **Execute**: handlers perform the mutation and leave whatever the
//!    second pass needs (a pre-mutation snapshot, affected ids) in the
//!    operation items
//! 2. **Invalidate**: after the items are sealed, the same chain runs again
//!    and handlers invalidate the computed entries the mutation affected
//!
//! A failing execute pass fails the call and skips invalidation. A failing
//! invalidate pass is logged; the mutation has already happened, so the
//! call still succeeds.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use super::command::{Command, CommandType, CommandTypeInfo};
use super::context::{CommandContext, DispatchMode, OperationItems, OperationState};
use super::resolver::{HandlerResolver, ResolvedHandlers};
use crate::error::CommandError;
use crate::feed::ChangeFeed;
use crate::graph::{ComputedGraph, InvalidationTicket};

/// Entry point for dispatching commands.
#[derive(Clone)]
pub struct Commander {
    resolver: Arc<HandlerResolver>,
    graph: ComputedGraph,
    feed: Option<Arc<dyn ChangeFeed>>,
}

impl Commander {
    pub fn new(resolver: Arc<HandlerResolver>, graph: ComputedGraph) -> Self {
        Self {
            resolver,
            graph,
            feed: None,
        }
    }

    /// Notify `feed` with the command's type name after every completed
    /// command, so other processes can invalidate what it touched.
    pub fn with_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn resolver(&self) -> &Arc<HandlerResolver> {
        &self.resolver
    }

    pub fn graph(&self) -> &ComputedGraph {
        &self.graph
    }

    pub async fn call<C: Command>(&self, command: C) -> Result<Operation, CommandError> {
        self.call_arc(Arc::new(command)).await
    }

    pub async fn call_arc<C: Command>(&self, command: Arc<C>) -> Result<Operation, CommandError> {
        let handlers = self.resolver.resolve::<C>()?;
        self.dispatch(command, CommandType::of::<C>(), handlers).await
    }

    /// Dispatch a command whose type is only known at runtime.
    pub async fn call_dyn(&self, command: Arc<dyn Command>, info: &CommandTypeInfo) -> Result<Operation, CommandError> {
        let handlers = self.resolver.resolve_info(info)?;
        self.dispatch(command, info.command(), handlers).await
    }

    async fn dispatch(
        &self,
        command: Arc<dyn Command>,
        command_type: CommandType,
        handlers: Arc<ResolvedHandlers>,
    ) -> Result<Operation, CommandError> {
        if handlers.is_empty() {
            return Err(CommandError::NoHandler(command_type.name()));
        }

        let state = Arc::new(OperationState {
            command,
            command_type,
            items: OperationItems::new(),
            graph: self.graph.clone(),
            tickets: Mutex::new(Vec::new()),
            result: Mutex::new(None),
        });

        CommandContext::new(Arc::clone(&state), DispatchMode::Execute, Arc::clone(&handlers))
            .invoke_at(0)
            .await?;
        state.items.seal();

        if let Err(err) = CommandContext::new(Arc::clone(&state), DispatchMode::Invalidate, handlers)
            .invoke_at(0)
            .await
        {
            error!(command = %command_type, error = %err, "invalidation pass failed");
        }

        let invalidations = state.tickets.lock().len();
        debug!(command = %command_type, invalidations, "command completed");

        if let Some(feed) = &self.feed {
            feed.notify(command_type.name());
        }
        Ok(Operation { state })
    }
}

impl fmt::Debug for Commander {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commander")
            .field("resolver", &self.resolver)
            .field("has_feed", &self.feed.is_some())
            .finish()
    }
}

/// A completed command.
pub struct Operation {
    state: Arc<OperationState>,
}

impl Operation {
    pub fn command(&self) -> &Arc<dyn Command> {
        &self.state.command
    }

    pub fn command_type(&self) -> CommandType {
        self.state.command_type
    }

    pub fn items(&self) -> &OperationItems {
        &self.state.items
    }

    /// The result set by a handler, if it is an `R`.
    pub fn result<R: Any + Clone>(&self) -> Option<R> {
        self.state
            .result
            .lock()
            .as_ref()
            .and_then(|result| result.downcast_ref::<R>())
            .cloned()
    }

    /// Wait until every invalidation the command issued has propagated.
    ///
    /// Returns the number of entries invalidated.
    pub async fn settled(self) -> usize {
        let tickets = std::mem::take(&mut *self.state.tickets.lock());
        InvalidationTicket::all(tickets).await
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("command", &self.state.command)
            .field("items", &self.state.items)
            .finish()
    }
}
