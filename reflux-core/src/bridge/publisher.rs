//! Publisher
//!
//! The publisher owns every live publication, routes subscriptions to
//! them, and forgets a publication once it is revoked or expires.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use super::factory::{AnyComputed, DroppedHook, PublicationContext, PublicationFactory, StoppedHook};
use super::ids::{PublicationId, SubscriberId};
use super::publication::{AnyPublication, Publication};
use super::transport::{PublicationMessage, Transport};
use crate::clock::Clock;
use crate::commands::AsAny;
use crate::delay::{DelayerRegistry, UpdateDelayer};
use crate::error::PublishError;
use crate::graph::Computed;
use crate::settings::Settings;

/// Per-publisher tunables. See [`Settings`] for the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherOptions {
    pub update_delay: Duration,
    pub max_push_attempts: usize,
    pub publication_expiration: Duration,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Settings::default().publisher_options()
    }
}

struct PublisherInner {
    publications: DashMap<PublicationId, Arc<dyn AnyPublication>>,
    factory: Arc<PublicationFactory>,
    transport: Arc<dyn Transport>,
    delayer: Arc<dyn UpdateDelayer>,
    clock: Arc<dyn Clock>,
    options: PublisherOptions,
}

/// Handle to the set of live publications. Cloning shares it.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    /// Publisher whose delayer comes from `delayers` for the configured
    /// update delay.
    pub fn new(transport: Arc<dyn Transport>, delayers: &DelayerRegistry, options: PublisherOptions) -> Self {
        let delayer = delayers.get(options.update_delay);
        Self::with_delayer(transport, delayer, delayers.clock(), options)
    }

    pub fn with_delayer(
        transport: Arc<dyn Transport>,
        delayer: Arc<dyn UpdateDelayer>,
        clock: Arc<dyn Clock>,
        options: PublisherOptions,
    ) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                publications: DashMap::new(),
                factory: Arc::new(PublicationFactory::new()),
                transport,
                delayer,
                clock,
                options,
            }),
        }
    }

    pub fn from_settings(transport: Arc<dyn Transport>, settings: &Settings, clock: Arc<dyn Clock>) -> Self {
        let delayers = settings.delayer_registry(clock);
        Self::new(transport, &delayers, settings.publisher_options())
    }

    pub fn factory(&self) -> &PublicationFactory {
        &self.inner.factory
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.inner.options
    }

    /// Publish `computed` under a generated id.
    ///
    /// Must be called within a tokio runtime.
    pub fn publish<T>(&self, computed: Computed<T>) -> Result<Arc<Publication<T>>, PublishError>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        self.publish_as(PublicationId::generate(), computed)
    }

    /// Publish `computed` under `id`. Fails if `id` is taken.
    pub fn publish_as<T>(&self, id: PublicationId, computed: Computed<T>) -> Result<Arc<Publication<T>>, PublishError>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        match self.inner.publications.entry(id.clone()) {
            Entry::Occupied(_) => Err(PublishError::DuplicatePublication(id.to_string())),
            Entry::Vacant(vacant) => {
                let publication = self.inner.factory.create(id, computed, self.context());
                vacant.insert(Arc::clone(&publication) as Arc<dyn AnyPublication>);
                info!(publication = %publication.id(), "published");
                Ok(publication)
            }
        }
    }

    /// Publish a type-erased entry. Its value type must be registered with
    /// the [`factory`](Self::factory).
    pub fn publish_dyn(&self, id: PublicationId, computed: &AnyComputed) -> Result<Arc<dyn AnyPublication>, PublishError> {
        match self.inner.publications.entry(id.clone()) {
            Entry::Occupied(_) => Err(PublishError::DuplicatePublication(id.to_string())),
            Entry::Vacant(vacant) => {
                let publication = self.inner.factory.create_dyn(id, computed, self.context())?;
                vacant.insert(Arc::clone(&publication));
                info!(publication = %publication.id(), value_type = computed.type_name(), "published");
                Ok(publication)
            }
        }
    }

    /// Look up a live publication by id.
    pub fn get(&self, id: &PublicationId) -> Option<Arc<dyn AnyPublication>> {
        self.inner
            .publications
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// The publication `id`, if it exists and publishes values of type `T`.
    pub fn get_typed<T>(&self, id: &PublicationId) -> Option<Arc<Publication<T>>>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let publication = self.get(id)?;
        <dyn AnyPublication as AsAny>::into_any(publication)
            .downcast::<Publication<T>>()
            .ok()
    }

    /// Subscribe to `id`, returning the snapshot to start from.
    pub async fn subscribe(&self, id: &PublicationId, subscriber: SubscriberId) -> Result<PublicationMessage, PublishError> {
        let publication = self
            .get(id)
            .ok_or_else(|| PublishError::UnknownPublication(id.to_string()))?;
        Ok(publication.subscribe(subscriber).await)
    }

    /// Stop pushing `id` to `subscriber`. Returns whether it was subscribed.
    pub fn unsubscribe(&self, id: &PublicationId, subscriber: SubscriberId) -> bool {
        self.get(id)
            .map(|publication| publication.unsubscribe(subscriber))
            .unwrap_or(false)
    }

    /// Drop `subscriber` from every publication. Returns how many it was
    /// subscribed to.
    pub fn on_disconnected(&self, subscriber: SubscriberId) -> usize {
        self.inner.disconnect(subscriber)
    }

    /// Stop and forget publication `id`.
    pub fn revoke(&self, id: &PublicationId) -> bool {
        match self.inner.publications.remove(id) {
            Some((_, publication)) => {
                publication.stop();
                info!(publication = %id, "revoked");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.publications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.publications.is_empty()
    }

    /// Ids of every live publication, in no particular order.
    pub fn ids(&self) -> Vec<PublicationId> {
        self.inner
            .publications
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Revoke every publication.
    pub fn shutdown(&self) {
        for id in self.ids() {
            self.revoke(&id);
        }
    }

    fn context(&self) -> PublicationContext {
        let publisher: Weak<PublisherInner> = Arc::downgrade(&self.inner);
        let on_stopped: StoppedHook = Arc::new(move |id: &PublicationId| {
            if let Some(publisher) = publisher.upgrade() {
                publisher
                    .publications
                    .remove_if(id, |_, publication| publication.is_stopped());
            }
        });
        let publisher: Weak<PublisherInner> = Arc::downgrade(&self.inner);
        let on_dropped: DroppedHook = Arc::new(move |subscriber: SubscriberId| {
            if let Some(publisher) = publisher.upgrade() {
                publisher.disconnect(subscriber);
            }
        });
        PublicationContext::new(
            Arc::clone(&self.inner.transport),
            Arc::clone(&self.inner.delayer),
            Arc::clone(&self.inner.clock),
            self.inner.options,
        )
        .with_stopped_hook(on_stopped)
        .with_dropped_hook(on_dropped)
    }
}

impl PublisherInner {
    /// Unsubscribe `subscriber` from every publication.
    fn disconnect(&self, subscriber: SubscriberId) -> usize {
        let publications: Vec<_> = self
            .publications
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let removed = publications
            .iter()
            .filter(|publication| publication.unsubscribe(subscriber))
            .count();
        debug!(%subscriber, publications = removed, "subscriber disconnected");
        removed
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("publications", &self.inner.publications.len())
            .field("delayer", &self.inner.delayer)
            .field("options", &self.inner.options)
            .finish()
    }
}
