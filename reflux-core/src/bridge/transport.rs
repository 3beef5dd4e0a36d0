//! Transports
//!
//! A transport delivers publication updates to subscribers. The bridge
//! only needs [`Transport::send`]; connection management belongs to the
//! host, which reports dropped connections through
//! [`Publisher::on_disconnected`](super::Publisher::on_disconnected).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use super::ids::{PublicationId, SubscriberId};
use crate::error::{PublishError, TransportError};

/// One versioned update of a publication.
///
/// The payload is the MessagePack encoding of `Result<T, String>`: the
/// computed value, or the message of the error its computation failed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationMessage {
    pub publication_id: PublicationId,
    pub version: u64,
    pub payload: Bytes,
}

impl PublicationMessage {
    /// Decode the payload. The outer error is a codec failure, the inner one
    /// a computation error carried in the message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Result<T, String>, PublishError> {
        decode_payload(&self.payload)
    }
}

pub(crate) fn encode_payload<T: Serialize>(output: Result<&T, String>) -> Result<Bytes, PublishError> {
    rmp_serde::to_vec_named(&output)
        .map(Bytes::from)
        .map_err(|err| PublishError::Encode(err.to_string()))
}

/// Decode a raw payload the way [`PublicationMessage::decode`] does.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<Result<T, String>, PublishError> {
    rmp_serde::from_slice(payload).map_err(|err| PublishError::Decode(err.to_string()))
}

/// Delivers publication messages to connected subscribers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        subscriber: SubscriberId,
        publication: &PublicationId,
        version: u64,
        payload: Bytes,
    ) -> Result<(), TransportError>;
}

/// In-process transport: one unbounded channel per subscriber.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    channels: Arc<DashMap<SubscriberId, mpsc::UnboundedSender<PublicationMessage>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for a new subscriber.
    pub fn connect(&self) -> (SubscriberId, mpsc::UnboundedReceiver<PublicationMessage>) {
        let subscriber = SubscriberId::new();
        (subscriber, self.connect_as(subscriber))
    }

    /// Open a channel for `subscriber`, replacing any previous one.
    pub fn connect_as(&self, subscriber: SubscriberId) -> mpsc::UnboundedReceiver<PublicationMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.channels.insert(subscriber, sender);
        receiver
    }

    /// Drop the subscriber's channel. Later sends to it fail.
    pub fn disconnect(&self, subscriber: SubscriberId) -> bool {
        self.channels.remove(&subscriber).is_some()
    }

    pub fn is_connected(&self, subscriber: SubscriberId) -> bool {
        self.channels.contains_key(&subscriber)
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("connections", &self.channels.len())
            .finish()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(
        &self,
        subscriber: SubscriberId,
        publication: &PublicationId,
        version: u64,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let sender = self
            .channels
            .get(&subscriber)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::NotConnected(subscriber.raw()))?;

        let message = PublicationMessage {
            publication_id: publication.clone(),
            version,
            payload,
        };
        if sender.send(message).is_err() {
            self.channels
                .remove_if(&subscriber, |_, current| current.same_channel(&sender));
            return Err(TransportError::Closed(subscriber.raw()));
        }
        trace!(%subscriber, %publication, version, "sent update");
        Ok(())
    }
}
