//! Publication Bridge
//!
//! Makes graph entries observable from outside the process.
//!
//! # Overview
//!
//! - A [`Publisher`] binds a [`Computed`](crate::graph::Computed) to a
//!   [`PublicationId`] and owns the resulting [`Publication`]
//! - Subscribers receive versioned MessagePack payloads through a
//!   [`Transport`]
//! - A subscriber that misses updates (failed pushes, reconnect) catches up
//!   by subscribing again and reading the snapshot, never by replay
//!
//! # Design Decisions
//!
//! 1. Value types are bound to publication constructors through an
//!    explicit [`PublicationFactory`] registry keyed by `TypeId`.
//!
//! 2. Update timing is delegated to an [`UpdateDelayer`](crate::delay::UpdateDelayer),
//!    which debounces invalidation bursts and backs off failed pushes.

mod factory;
mod ids;
mod publication;
mod publisher;
mod transport;

pub use factory::{AnyComputed, PublicationContext, PublicationFactory};
pub use ids::{PublicationId, SubscriberId};
pub use publication::{AnyPublication, Publication};
pub use publisher::{Publisher, PublisherOptions};
pub use transport::{decode_payload, ChannelTransport, PublicationMessage, Transport};
