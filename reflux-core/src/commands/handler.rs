//! Command Handlers

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};

use super::command::{Command, CommandType};
use super::context::CommandContext;
use crate::error::CommandError;

/// Identity of a handler. Handlers with equal ids are the same handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(Arc<str>);

impl HandlerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HandlerId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl From<String> for HandlerId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type HandlerBody = dyn Fn(CommandContext) -> BoxFuture<'static, Result<(), CommandError>> + Send + Sync;

/// A registered handler: what it applies to, where it sits in the chain,
/// and what it runs.
///
/// A filter handler wraps the rest of the chain and must call
/// [`CommandContext::next`] to continue it. A terminal handler ends the
/// chain. Both are invoked once per pass; [`CommandContext::mode`] tells
/// them which one.
#[derive(Clone)]
pub struct CommandHandler {
    id: HandlerId,
    target: CommandType,
    priority: i32,
    is_filter: bool,
    body: Arc<HandlerBody>,
}

impl CommandHandler {
    pub fn new<F, Fut>(id: impl Into<HandlerId>, target: CommandType, priority: i32, is_filter: bool, body: F) -> Self
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CommandError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            target,
            priority,
            is_filter,
            body: Arc::new(move |ctx: CommandContext| body(ctx).boxed()),
        }
    }

    /// Terminal handler for commands of type `C`, receiving the typed
    /// command.
    pub fn terminal<C, F, Fut>(id: impl Into<HandlerId>, priority: i32, body: F) -> Self
    where
        C: Command,
        F: Fn(Arc<C>, CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CommandError>> + Send + 'static,
    {
        let body = Arc::new(body);
        Self::new(id, CommandType::of::<C>(), priority, false, move |ctx: CommandContext| {
            let body = Arc::clone(&body);
            async move {
                let command = ctx.command_as::<C>()?;
                body(command, ctx).await
            }
        })
    }

    /// Filter handler for every command with capability `T`.
    pub fn filter<T, F, Fut>(id: impl Into<HandlerId>, priority: i32, body: F) -> Self
    where
        T: ?Sized + 'static,
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CommandError>> + Send + 'static,
    {
        Self::new(id, CommandType::of::<T>(), priority, true, body)
    }

    pub fn id(&self) -> &HandlerId {
        &self.id
    }

    pub fn target(&self) -> CommandType {
        self.target
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_filter(&self) -> bool {
        self.is_filter
    }

    pub(crate) fn invoke(&self, ctx: CommandContext) -> BoxFuture<'static, Result<(), CommandError>> {
        (self.body)(ctx)
    }

    pub(crate) fn missing(command: CommandType) -> BoxFuture<'static, Result<(), CommandError>> {
        future::ready(Err(CommandError::NoHandler(command.name()))).boxed()
    }
}

impl fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHandler")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("priority", &self.priority)
            .field("is_filter", &self.is_filter)
            .finish()
    }
}

impl fmt::Display for CommandHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_filter { "filter" } else { "terminal" };
        write!(f, "{}({kind}, {}, priority {})", self.id, self.target, self.priority)
    }
}
