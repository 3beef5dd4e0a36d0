//! Clocks
//!
//! Everything in the crate that waits goes through a [`Clock`], so timing
//! can be driven deterministically in tests.
//!
//! - [`TokioClock`] delegates to `tokio::time` and therefore also honours
//!   tokio's paused test clock.
//! - [`ManualClock`] never moves on its own; pending delays complete only
//!   when [`ManualClock::advance`] moves time past their deadline.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A point in time, measured from the clock's own epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Moment(Duration);

impl Moment {
    pub const EPOCH: Moment = Moment(Duration::ZERO);

    pub fn from_epoch(offset: Duration) -> Self {
        Self(offset)
    }

    pub fn since_epoch(&self) -> Duration {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, saturating at zero.
    pub fn saturating_since(&self, earlier: Moment) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::ops::Add<Duration> for Moment {
    type Output = Moment;

    fn add(self, rhs: Duration) -> Moment {
        Moment(self.0 + rhs)
    }
}

/// Source of time and cancellable delays.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current time.
    fn now(&self) -> Moment;

    /// Wait for `duration`.
    ///
    /// Returns `false` if `cancel` fired before the duration elapsed.
    async fn delay(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

/// Clock backed by the tokio timer.
#[derive(Debug, Clone)]
pub struct TokioClock {
    epoch: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }

    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Moment {
        Moment(self.epoch.elapsed())
    }

    async fn delay(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Deterministic clock for tests.
///
/// Cloning shares the underlying time line.
#[derive(Clone, Default)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_timer: u64,
    timers: BTreeMap<(Duration, u64), oneshot::Sender<()>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward, completing every delay whose deadline is reached.
    pub fn advance(&self, by: Duration) {
        let due = {
            let mut state = self.inner.lock();
            state.now += by;
            let now = state.now;
            // Everything strictly after (now, u64::MAX) stays pending.
            let pending = state.timers.split_off(&(now, u64::MAX));
            std::mem::replace(&mut state.timers, pending)
        };
        for (_, timer) in due {
            let _ = timer.send(());
        }
    }

    /// Number of delays currently waiting on this clock.
    pub fn pending_timers(&self) -> usize {
        self.inner.lock().timers.len()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("pending_timers", &state.timers.len())
            .finish()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Moment {
        Moment(self.inner.lock().now)
    }

    async fn delay(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }

        let (tx, rx) = oneshot::channel();
        let timer_key = {
            let mut state = self.inner.lock();
            let key = (state.now + duration, state.next_timer);
            state.next_timer += 1;
            state.timers.insert(key, tx);
            key
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.inner.lock().timers.remove(&timer_key);
                false
            }
            fired = rx => fired.is_ok(),
        }
    }
}
