//! Delayer Registry
//!
//! Shares [`FixedDelayer`]s by update delay. Requested delays are clamped
//! up to the registry's minimum, so a misconfigured zero delay cannot turn
//! a publication into a busy loop. [`DelayerRegistry::zero_unsafe`] is the
//! one way around the floor and is meant for tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::delayer::FixedDelayer;
use super::retry::RetryDelaySeq;
use crate::clock::{Clock, TokioClock};
use crate::settings::Settings;

struct RegistryConfig {
    min_delay: Duration,
    retry_delays: RetryDelaySeq,
    clock: Arc<dyn Clock>,
}

pub struct DelayerRegistry {
    config: RwLock<RegistryConfig>,
    cache: DashMap<Duration, Arc<FixedDelayer>>,
}

impl DelayerRegistry {
    pub fn new(min_delay: Duration, retry_delays: RetryDelaySeq, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: RwLock::new(RegistryConfig {
                min_delay,
                retry_delays,
                clock,
            }),
            cache: DashMap::new(),
        }
    }

    pub fn from_settings(settings: &Settings, clock: Arc<dyn Clock>) -> Self {
        Self::new(settings.min_update_delay, settings.retry_delays.clone(), clock)
    }

    /// The shared delayer for `update_delay`, raised to the minimum delay.
    pub fn get(&self, update_delay: Duration) -> Arc<FixedDelayer> {
        let config = self.config.read();
        let update_delay = update_delay.max(config.min_delay);
        let delayer = self.cache.entry(update_delay).or_insert_with(|| {
            Arc::new(FixedDelayer::new(
                update_delay,
                config.retry_delays.clone(),
                Arc::clone(&config.clock),
            ))
        });
        Arc::clone(delayer.value())
    }

    /// The delayer with the shortest allowed update delay.
    pub fn instant(&self) -> Arc<FixedDelayer> {
        self.get(Duration::ZERO)
    }

    /// A delayer that never waits before an update, ignoring the minimum
    /// delay. Not cached.
    pub fn zero_unsafe(&self) -> Arc<FixedDelayer> {
        let config = self.config.read();
        Arc::new(FixedDelayer::new(
            Duration::ZERO,
            config.retry_delays.clone(),
            Arc::clone(&config.clock),
        ))
    }

    pub fn min_delay(&self) -> Duration {
        self.config.read().min_delay
    }

    pub fn retry_delays(&self) -> RetryDelaySeq {
        self.config.read().retry_delays.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.config.read().clock)
    }

    pub fn set_min_delay(&self, min_delay: Duration) {
        self.reconfigure(|config| config.min_delay = min_delay);
    }

    pub fn set_retry_delays(&self, retry_delays: RetryDelaySeq) {
        self.reconfigure(|config| config.retry_delays = retry_delays);
    }

    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        self.reconfigure(|config| config.clock = clock);
    }

    /// Drop every cached delayer. Delayers already handed out keep working.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of cached delayers.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn reconfigure(&self, change: impl FnOnce(&mut RegistryConfig)) {
        let mut config = self.config.write();
        change(&mut config);
        // Cleared under the write lock so no reader caches a delayer built
        // from the old configuration.
        self.cache.clear();
    }
}

impl Default for DelayerRegistry {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), TokioClock::shared())
    }
}

impl fmt::Debug for DelayerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.config.read();
        f.debug_struct("DelayerRegistry")
            .field("min_delay", &config.min_delay)
            .field("retry_delays", &config.retry_delays)
            .field("cached", &self.cache.len())
            .finish()
    }
}
