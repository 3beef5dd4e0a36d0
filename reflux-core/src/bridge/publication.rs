//! Publications
//!
//! A publication binds one graph entry to a [`PublicationId`] and keeps
//! every subscriber up to date with it. Its background task:
//!
//! 1. waits until the entry is invalidated or recomputed by someone else
//! 2. waits on the update delayer, so bursts of invalidations coalesce
//! 3. recomputes the entry and encodes the result
//! 4. if the encoded result changed, bumps the publication version and
//!    pushes it to every subscriber
//!
//! Versions are local to the publication, start at 1 and only grow. Each
//! subscriber's last delivered version is kept behind its own async lock,
//! so a subscriber never receives a version at or below one it already has.

use std::any::{type_name, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::factory::PublicationContext;
use super::ids::{PublicationId, SubscriberId};
use super::transport::{encode_payload, PublicationMessage};
use crate::clock::Moment;
use crate::commands::AsAny;
use crate::error::{ComputeError, PublishError};
use crate::graph::{ComputeKey, Computed, ComputedState, EntrySnapshot, Version};

/// Object-safe view of a [`Publication`] of any value type.
#[async_trait]
pub trait AnyPublication: AsAny + fmt::Debug {
    fn id(&self) -> &PublicationId;

    fn value_type(&self) -> TypeId;

    fn value_type_name(&self) -> &'static str;

    /// Latest publication version.
    fn version(&self) -> u64;

    /// Latest version and payload.
    fn snapshot(&self) -> PublicationMessage;

    /// Key of the published entry.
    fn key(&self) -> &ComputeKey;

    /// Add `subscriber` and return the snapshot it should start from.
    ///
    /// Subscribing again resynchronizes: the subscriber receives the
    /// current snapshot and only newer versions after it.
    async fn subscribe(&self, subscriber: SubscriberId) -> PublicationMessage;

    fn unsubscribe(&self, subscriber: SubscriberId) -> bool;

    fn subscriber_count(&self) -> usize;

    /// Postpone expiration.
    fn touch(&self);

    /// Stop the background task and drop every subscriber.
    fn stop(&self);

    fn is_stopped(&self) -> bool;
}

struct Published {
    version: u64,
    entry_version: Version,
    payload: Bytes,
    retry_count: usize,
}

pub struct Publication<T> {
    id: PublicationId,
    computed: Computed<T>,
    context: PublicationContext,
    state: Mutex<Published>,
    subscribers: DashMap<SubscriberId, Arc<AsyncMutex<u64>>>,
    last_touched: Mutex<Moment>,
    membership: Notify,
    cancel: CancellationToken,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Publication<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    /// Create the publication at version 1 and spawn its update task.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(id: PublicationId, computed: Computed<T>, context: PublicationContext) -> Arc<Self> {
        let entry_version = computed.version();
        let payload = match computed.output() {
            Some(output) => encode_output(output),
            None => encode_output::<T>(Err(ComputeError::msg("not computed yet"))),
        }
        .unwrap_or_default();
        let now = context.clock.now();

        let publication = Arc::new(Self {
            id,
            computed,
            context,
            state: Mutex::new(Published {
                version: 1,
                entry_version,
                payload,
                retry_count: 0,
            }),
            subscribers: DashMap::new(),
            last_touched: Mutex::new(now),
            membership: Notify::new(),
            cancel: CancellationToken::new(),
            _marker: PhantomData,
        });
        debug!(publication = %publication.id, key = %publication.key(), "publication started");
        tokio::spawn(Arc::clone(&publication).run());
        publication
    }

    /// The handle being published. It may re-bind after the entry is removed.
    pub fn computed(&self) -> &Computed<T> {
        &self.computed
    }

    /// Subscribers and the last version delivered to each.
    pub async fn delivered(&self) -> Vec<(SubscriberId, u64)> {
        let subscribers: Vec<_> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        let mut delivered = Vec::with_capacity(subscribers.len());
        for (subscriber, last) in subscribers {
            delivered.push((subscriber, *last.lock().await));
        }
        delivered
    }

    async fn run(self: Arc<Self>) {
        let mut changes = self.computed.changes();
        while self.wait_stale(&mut changes).await {
            let retry_count = self.state.lock().retry_count;
            self.context.delayer.delay(retry_count, &self.cancel).await;
            if self.cancel.is_cancelled() {
                break;
            }

            let output = self.computed.update().await;
            // The update may have moved the handle onto a new entry.
            changes = self.computed.changes();
            if let Some((version, payload)) = self.refresh(output) {
                self.push(version, payload).await;
            }
        }

        self.cancel.cancel();
        self.subscribers.clear();
        debug!(publication = %self.id, "publication stopped");
        if let Some(on_stopped) = &self.context.on_stopped {
            on_stopped(&self.id);
        }
    }

    /// Resolves `true` once the entry needs republishing, `false` once the
    /// publication is stopped or expired.
    async fn wait_stale(&self, changes: &mut watch::Receiver<EntrySnapshot>) -> bool {
        loop {
            let notified = self.membership.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cancel.is_cancelled() {
                return false;
            }
            let snapshot = *changes.borrow_and_update();
            if self.is_stale(snapshot) {
                return true;
            }

            let expires_in = self.expires_in();
            if expires_in == Some(Duration::ZERO) {
                info!(publication = %self.id, "publication expired");
                return false;
            }
            let expiry = async {
                match expires_in {
                    Some(remaining) => {
                        self.context.clock.delay(remaining, &self.cancel).await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = changes.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = &mut notified => {}
                _ = expiry => {}
            }
        }
    }

    fn is_stale(&self, snapshot: EntrySnapshot) -> bool {
        match snapshot.state {
            ComputedState::Invalidated => true,
            ComputedState::Consistent => snapshot.version != self.state.lock().entry_version,
            ComputedState::Computing => false,
        }
    }

    /// Time left before expiry, if nobody is subscribed.
    fn expires_in(&self) -> Option<Duration> {
        if !self.subscribers.is_empty() {
            return None;
        }
        let idle = self.context.clock.now().saturating_since(*self.last_touched.lock());
        Some(self.context.options.publication_expiration.saturating_sub(idle))
    }

    /// Record a new output. Returns the version to push if it changed.
    fn refresh(&self, output: Result<T, ComputeError>) -> Option<(u64, Bytes)> {
        let entry_version = self.computed.version();
        let failed = output.is_err();
        let encoded = encode_output(output);

        let mut state = self.state.lock();
        state.retry_count = if failed { state.retry_count + 1 } else { 0 };
        let payload = match encoded {
            Ok(payload) => payload,
            Err(err) => {
                warn!(publication = %self.id, error = %err, "failed to encode publication payload");
                state.entry_version = entry_version;
                state.retry_count += 1;
                return None;
            }
        };

        if payload == state.payload && entry_version == state.entry_version {
            trace!(publication = %self.id, "output unchanged");
            return None;
        }
        state.version += 1;
        state.entry_version = entry_version;
        state.payload = payload.clone();
        debug!(publication = %self.id, version = state.version, failed, "publication updated");
        Some((state.version, payload))
    }

    async fn push(&self, version: u64, payload: Bytes) {
        let targets: Vec<_> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        join_all(
            targets
                .into_iter()
                .map(|(subscriber, last)| self.deliver(subscriber, last, version, payload.clone())),
        )
        .await;
    }

    async fn deliver(&self, subscriber: SubscriberId, last: Arc<AsyncMutex<u64>>, version: u64, payload: Bytes) {
        let mut delivered = last.lock().await;
        let max_attempts = self.context.options.max_push_attempts.max(1);

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let backoff = self.context.delayer.get_delay(attempt);
                if !self.context.clock.delay(backoff, &self.cancel).await {
                    return;
                }
            }
            if *delivered >= version || self.version() > version || !self.subscribers.contains_key(&subscriber) {
                trace!(publication = %self.id, %subscriber, version, "push superseded");
                return;
            }

            match self
                .context
                .transport
                .send(subscriber, &self.id, version, payload.clone())
                .await
            {
                Ok(()) => {
                    *delivered = version;
                    return;
                }
                Err(err) => {
                    debug!(publication = %self.id, %subscriber, attempt, error = %err, "push failed");
                }
            }
        }

        warn!(
            publication = %self.id,
            %subscriber,
            attempts = max_attempts,
            "dropping subscriber after failed pushes"
        );
        drop(delivered);
        if self
            .subscribers
            .remove_if(&subscriber, |_, current| Arc::ptr_eq(current, &last))
            .is_some()
        {
            self.touch();
            self.membership.notify_waiters();
            // Drop it from the publisher's other publications too.
            if let Some(on_dropped) = &self.context.on_dropped {
                on_dropped(subscriber);
            }
        }
    }
}

#[async_trait]
impl<T> AnyPublication for Publication<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    fn id(&self) -> &PublicationId {
        &self.id
    }

    fn value_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn value_type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn version(&self) -> u64 {
        self.state.lock().version
    }

    fn snapshot(&self) -> PublicationMessage {
        let state = self.state.lock();
        PublicationMessage {
            publication_id: self.id.clone(),
            version: state.version,
            payload: state.payload.clone(),
        }
    }

    fn key(&self) -> &ComputeKey {
        self.computed.key()
    }

    async fn subscribe(&self, subscriber: SubscriberId) -> PublicationMessage {
        let last = Arc::clone(
            self.subscribers
                .entry(subscriber)
                .or_insert_with(|| Arc::new(AsyncMutex::new(0)))
                .value(),
        );
        let mut delivered = last.lock().await;
        let snapshot = self.snapshot();
        *delivered = (*delivered).max(snapshot.version);
        drop(delivered);

        self.touch();
        self.membership.notify_waiters();
        debug!(publication = %self.id, %subscriber, version = snapshot.version, "subscribed");
        snapshot
    }

    fn unsubscribe(&self, subscriber: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&subscriber).is_some();
        if removed {
            self.touch();
            self.membership.notify_waiters();
            debug!(publication = %self.id, %subscriber, "unsubscribed");
        }
        removed
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn touch(&self) {
        *self.last_touched.lock() = self.context.clock.now();
        self.membership.notify_waiters();
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> fmt::Debug for Publication<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publication")
            .field("id", &self.id)
            .field("value_type", &type_name::<T>())
            .field("version", &self.state.lock().version)
            .field("subscribers", &self.subscribers.len())
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

fn encode_output<T: Serialize>(output: Result<T, ComputeError>) -> Result<Bytes, PublishError> {
    match output {
        Ok(value) => encode_payload(Ok(&value)),
        Err(err) => encode_payload::<T>(Err(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::publisher::PublisherOptions;
    use crate::bridge::transport::ChannelTransport;
    use crate::clock::TokioClock;
    use crate::delay::FixedDelayer;
    use crate::graph::{ComputeMethod, ComputedGraph};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context(transport: &ChannelTransport) -> PublicationContext {
        PublicationContext::new(
            Arc::new(transport.clone()),
            Arc::new(FixedDelayer::with_update_delay(Duration::from_millis(10))),
            TokioClock::shared(),
            PublisherOptions::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_new_versions_after_invalidation() {
        let graph = ComputedGraph::new();
        let counter = Arc::new(AtomicU32::new(0));
        let method = {
            let counter = Arc::clone(&counter);
            ComputeMethod::new("counter", move |_ctx, _: ()| {
                let counter = Arc::clone(&counter);
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
            })
        };
        let transport = ChannelTransport::new();
        let computed = graph.capture(&method, ()).await.unwrap();
        let publication = Publication::start(PublicationId::from("p1"), computed, context(&transport));

        let (subscriber, mut updates) = transport.connect();
        let snapshot = publication.subscribe(subscriber).await;
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.decode::<u32>().unwrap(), Ok(1));

        graph.invalidate(&method, &()).completed().await;
        let update = updates.recv().await.unwrap();
        assert_eq!(update.version, 2);
        assert_eq!(update.decode::<u32>().unwrap(), Ok(2));
        assert_eq!(publication.delivered().await, vec![(subscriber, 2)]);
        publication.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribing_resynchronizes_from_the_snapshot() {
        let graph = ComputedGraph::new();
        let method = ComputeMethod::new("constant", |_ctx, _: ()| async { Ok("x".to_string()) });
        let transport = ChannelTransport::new();
        let computed = graph.capture(&method, ()).await.unwrap();
        let publication = Publication::start(PublicationId::from("p2"), computed, context(&transport));

        let (subscriber, _updates) = transport.connect();
        let first = publication.subscribe(subscriber).await;
        let again = publication.subscribe(subscriber).await;
        assert_eq!(first, again);
        assert_eq!(publication.subscriber_count(), 1);
        assert!(publication.unsubscribe(subscriber));
        assert!(!publication.unsubscribe(subscriber));
        publication.stop();
    }
}
