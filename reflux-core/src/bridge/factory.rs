//! Publication Factory
//!
//! Publications are generic over the published value type, but the
//! publisher also accepts computed handles whose type is only known at
//! runtime. The factory maps a value [`TypeId`] to a constructor registered
//! ahead of time with [`PublicationFactory::register`], so no type is ever
//! assembled on the fly.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use super::ids::{PublicationId, SubscriberId};
use super::publication::{AnyPublication, Publication};
use super::publisher::PublisherOptions;
use super::transport::Transport;
use crate::clock::Clock;
use crate::delay::UpdateDelayer;
use crate::error::PublishError;
use crate::graph::Computed;

/// A [`Computed`] handle with its value type erased.
#[derive(Clone)]
pub struct AnyComputed {
    inner: Arc<dyn Any + Send + Sync>,
    value_type: TypeId,
    type_name: &'static str,
}

impl AnyComputed {
    pub fn new<T>(computed: Computed<T>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(computed),
            value_type: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    /// Type id of the wrapped `Computed`'s value.
    pub fn value_type(&self) -> TypeId {
        self.value_type
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Recover the typed handle. Fails with a type mismatch.
    pub fn downcast<T>(&self) -> Result<Computed<T>, PublishError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner
            .downcast_ref::<Computed<T>>()
            .cloned()
            .ok_or(PublishError::TypeMismatch {
                expected: type_name::<T>(),
            })
    }
}

impl<T> From<Computed<T>> for AnyComputed
where
    T: Clone + Send + Sync + 'static,
{
    fn from(computed: Computed<T>) -> Self {
        Self::new(computed)
    }
}

impl fmt::Debug for AnyComputed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyComputed")
            .field("value_type", &self.type_name)
            .finish()
    }
}

pub(crate) type StoppedHook = Arc<dyn Fn(&PublicationId) + Send + Sync>;

/// Called when a publication gives up on a subscriber after failed pushes.
pub(crate) type DroppedHook = Arc<dyn Fn(SubscriberId) + Send + Sync>;

/// Everything a publication needs besides its entry.
#[derive(Clone)]
pub struct PublicationContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) delayer: Arc<dyn UpdateDelayer>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) options: PublisherOptions,
    pub(crate) on_stopped: Option<StoppedHook>,
    pub(crate) on_dropped: Option<DroppedHook>,
}

impl PublicationContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        delayer: Arc<dyn UpdateDelayer>,
        clock: Arc<dyn Clock>,
        options: PublisherOptions,
    ) -> Self {
        Self {
            transport,
            delayer,
            clock,
            options,
            on_stopped: None,
            on_dropped: None,
        }
    }

    pub(crate) fn with_stopped_hook(mut self, hook: StoppedHook) -> Self {
        self.on_stopped = Some(hook);
        self
    }

    pub(crate) fn with_dropped_hook(mut self, hook: DroppedHook) -> Self {
        self.on_dropped = Some(hook);
        self
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.options
    }
}

impl fmt::Debug for PublicationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicationContext")
            .field("delayer", &self.delayer)
            .field("options", &self.options)
            .finish()
    }
}

type Constructor =
    Arc<dyn Fn(PublicationId, &AnyComputed, PublicationContext) -> Result<Arc<dyn AnyPublication>, PublishError> + Send + Sync>;

/// Registry of publication constructors keyed by value type.
#[derive(Default)]
pub struct PublicationFactory {
    constructors: DashMap<TypeId, Constructor>,
}

impl PublicationFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make values of type `T` publishable through [`create_dyn`](Self::create_dyn).
    ///
    /// Registering a type twice keeps the first constructor.
    pub fn register<T>(&self)
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        self.constructors.entry(TypeId::of::<T>()).or_insert_with(|| {
            debug!(value_type = type_name::<T>(), "registered publication type");
            Arc::new(
                |id: PublicationId,
                 computed: &AnyComputed,
                 context: PublicationContext|
                 -> Result<Arc<dyn AnyPublication>, PublishError> {
                    let computed = computed.downcast::<T>()?;
                    Ok(Publication::start(id, computed, context) as Arc<dyn AnyPublication>)
                },
            )
        });
    }

    /// Whether `create_dyn` can build publications for `value_type`.
    pub fn is_registered(&self, value_type: TypeId) -> bool {
        self.constructors.contains_key(&value_type)
    }

    /// Start a publication of a statically typed entry. Also registers `T`.
    pub fn create<T>(&self, id: PublicationId, computed: Computed<T>, context: PublicationContext) -> Arc<Publication<T>>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        self.register::<T>();
        Publication::start(id, computed, context)
    }

    /// Start a publication of a type-erased entry through its registered
    /// constructor.
    pub fn create_dyn(
        &self,
        id: PublicationId,
        computed: &AnyComputed,
        context: PublicationContext,
    ) -> Result<Arc<dyn AnyPublication>, PublishError> {
        let constructor = self
            .constructors
            .get(&computed.value_type())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PublishError::UnregisteredType(computed.type_name().to_string()))?;
        constructor(id, computed, context)
    }

    /// Number of registered value types.
    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    pub fn clear(&self) {
        self.constructors.clear();
    }
}

impl fmt::Debug for PublicationFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicationFactory")
            .field("types", &self.constructors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::ChannelTransport;
    use crate::clock::TokioClock;
    use crate::delay::FixedDelayer;
    use crate::graph::{ComputeMethod, ComputedGraph};
    use std::time::Duration;

    fn context() -> PublicationContext {
        PublicationContext::new(
            Arc::new(ChannelTransport::new()),
            Arc::new(FixedDelayer::with_update_delay(Duration::ZERO)),
            TokioClock::shared(),
            PublisherOptions::default(),
        )
    }

    #[tokio::test]
    async fn create_dyn_requires_registration() {
        let graph = ComputedGraph::new();
        let count = ComputeMethod::new("count", |_ctx, _: ()| async { Ok(3u32) });
        let computed = AnyComputed::new(graph.capture(&count, ()).await.unwrap());
        let factory = PublicationFactory::new();

        let err = factory
            .create_dyn(PublicationId::from("p1"), &computed, context())
            .unwrap_err();
        assert!(matches!(err, PublishError::UnregisteredType(_)));

        factory.register::<u32>();
        factory.register::<u32>();
        assert_eq!(factory.len(), 1);
        assert!(factory.is_registered(TypeId::of::<u32>()));

        let publication = factory
            .create_dyn(PublicationId::from("p1"), &computed, context())
            .unwrap();
        assert_eq!(publication.version(), 1);
        assert_eq!(publication.snapshot().decode::<u32>().unwrap(), Ok(3));
        publication.stop();
    }

    #[tokio::test]
    async fn any_computed_downcast_checks_the_type() {
        let graph = ComputedGraph::new();
        let name = ComputeMethod::new("name", |_ctx, _: ()| async { Ok("reflux".to_string()) });
        let computed = AnyComputed::from(graph.capture(&name, ()).await.unwrap());

        assert_eq!(computed.value_type(), TypeId::of::<String>());
        assert!(computed.downcast::<String>().is_ok());
        assert!(matches!(
            computed.downcast::<u32>(),
            Err(PublishError::TypeMismatch { .. })
        ));
    }
}
