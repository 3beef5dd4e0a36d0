//! Error Types
//!
//! Every fallible operation in the crate returns one of the enums below.
//! Errors that are handed to more than one caller (a shared computation's
//! failure, a cached handler-resolution failure) are `Clone`, so every
//! waiter observes the identical value.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Failure to acquire a key in a [`LockTable`](crate::locking::LockTable).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The owner already holds the lock for this key.
    #[error("reentrant acquisition of lock {key} by owner {owner}")]
    Reentry { key: String, owner: u64 },
}

/// Failure of a memoized computation.
#[derive(Debug, Clone, Error)]
pub enum ComputeError {
    /// The caller stopped waiting. The shared computation is unaffected.
    #[error("computation cancelled")]
    Cancelled,

    /// A computation requested its own key, directly or transitively.
    #[error("reentrant computation: {path}")]
    Reentry { path: String },

    #[error(transparent)]
    Lock(#[from] LockError),

    /// The detached task running the computation panicked or was aborted.
    #[error("computation task failed: {0}")]
    TaskFailed(String),

    /// The cached value for a key is not of the requested type.
    #[error("type mismatch for {key}: expected {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    /// Failure reported by the compute function itself.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl ComputeError {
    /// Wrap a compute function's own failure.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    /// Build a failure from a plain message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// More than one terminal handler survived resolution for a command type.
///
/// Resolution results are cached, so the same value is returned for every
/// later dispatch of the command type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("multiple non-filter handlers for command {command}: {}", handlers.join(", "))]
pub struct ConfigurationError {
    pub command: &'static str,
    pub handlers: Vec<String>,
}

/// Failure while dispatching a command.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("no handler found for command {0}")]
    NoHandler(&'static str),

    /// Operation items can only be written during the execute pass.
    #[error("operation items are sealed once the execute pass completes")]
    ItemsSealed,

    #[error("command is not a {expected}")]
    UnexpectedCommand { expected: &'static str },

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl CommandError {
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }
}

/// Failure to deliver a message to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("subscriber {0} is not connected")]
    NotConnected(u64),

    #[error("channel to subscriber {0} is closed")]
    Closed(u64),

    #[error("transport failure: {0}")]
    Other(String),
}

/// Failure in the publication bridge.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("unknown publication {0}")]
    UnknownPublication(String),

    #[error("publication {0} already exists")]
    DuplicatePublication(String),

    #[error("no publication constructor registered for {0}")]
    UnregisteredType(String),

    #[error("computed value is not a {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Compute(#[from] ComputeError),
}

/// Invalid or unparsable configuration.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid settings: {0}")]
    Invalid(String),

    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}
