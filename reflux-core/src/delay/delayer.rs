//! Update Delayers
//!
//! A delayer decides how long a publication waits between noticing its
//! entry went stale and recomputing it. The wait debounces bursts of
//! invalidations into one update and backs off after failed updates.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::retry::RetryDelaySeq;
use crate::clock::{Clock, TokioClock};

#[async_trait]
pub trait UpdateDelayer: Send + Sync + fmt::Debug {
    /// Wait before the next update attempt.
    ///
    /// Returns early, without error, when `cancel` fires.
    async fn delay(&self, retry_count: usize, cancel: &CancellationToken);

    /// Delay for `retry_count` on its own, before the update delay floor.
    fn get_delay(&self, retry_count: usize) -> Duration;
}

/// Delayer with a fixed update delay and a retry sequence.
///
/// Two delayers are equal when their delays are; the clock is not compared.
#[derive(Clone)]
pub struct FixedDelayer {
    update_delay: Duration,
    retry_delays: RetryDelaySeq,
    clock: Arc<dyn Clock>,
}

impl FixedDelayer {
    pub fn new(update_delay: Duration, retry_delays: RetryDelaySeq, clock: Arc<dyn Clock>) -> Self {
        Self {
            update_delay,
            retry_delays,
            clock,
        }
    }

    /// Delayer on the tokio clock with the default retry sequence.
    pub fn with_update_delay(update_delay: Duration) -> Self {
        Self::new(update_delay, RetryDelaySeq::default(), TokioClock::shared())
    }

    pub fn update_delay(&self) -> Duration {
        self.update_delay
    }

    pub fn retry_delays(&self) -> &RetryDelaySeq {
        &self.retry_delays
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Total wait for `retry_count`.
    pub fn wait_for(&self, retry_count: usize) -> Duration {
        self.update_delay.max(self.get_delay(retry_count))
    }
}

#[async_trait]
impl UpdateDelayer for FixedDelayer {
    async fn delay(&self, retry_count: usize, cancel: &CancellationToken) {
        let wait = self.wait_for(retry_count);
        if wait.is_zero() {
            return;
        }
        if !self.clock.delay(wait, cancel).await {
            trace!(retry_count, "update delay cancelled");
        }
    }

    fn get_delay(&self, retry_count: usize) -> Duration {
        if retry_count > 0 {
            self.retry_delays.get(retry_count)
        } else {
            self.update_delay
        }
    }
}

impl PartialEq for FixedDelayer {
    fn eq(&self, other: &Self) -> bool {
        self.update_delay == other.update_delay && self.retry_delays == other.retry_delays
    }
}

impl Eq for FixedDelayer {}

impl fmt::Debug for FixedDelayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedDelayer")
            .field("update_delay", &self.update_delay)
            .field("retry_delays", &self.retry_delays)
            .finish()
    }
}
