//! Command dispatch and invalidation.
//!
//! Handlers are registered with a [`HandlerResolver`], which orders them
//! into a chain per command type. The [`Commander`] runs that chain twice
//! per command: once to execute it, once to invalidate what it changed.

mod command;
mod commander;
mod context;
mod handler;
mod resolver;

pub use command::{AnyCommand, AsAny, Command, CommandType, CommandTypeInfo};
pub use commander::{Commander, Operation};
pub use context::{CommandContext, DispatchMode, OperationItems};
pub use handler::{CommandHandler, HandlerId};
pub use resolver::{HandlerFilter, HandlerResolver, Resolution, ResolvedHandlers};
