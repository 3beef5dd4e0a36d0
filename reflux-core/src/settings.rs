//! Settings
//!
//! Tunables for the publication bridge and the update delayers, loadable
//! from JSON. Every field has a default; durations are milliseconds.
//!
//! ```json
//! {
//!   "update_delay": 100,
//!   "min_update_delay": 25,
//!   "retry_delays": { "kind": "exponential", "min": 1000, "max": 120000 },
//!   "max_push_attempts": 5,
//!   "publication_expiration": 60000,
//!   "lock_reentry": "checked_fail"
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::PublisherOptions;
use crate::clock::Clock;
use crate::delay::{DelayerRegistry, RetryDelaySeq};
use crate::error::SettingsError;
use crate::locking::ReentryMode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Debounce between a publication going stale and its update.
    #[serde(with = "millis")]
    pub update_delay: Duration,
    /// Floor for every update delay handed out by a [`DelayerRegistry`].
    #[serde(with = "millis")]
    pub min_update_delay: Duration,
    pub retry_delays: RetryDelaySeq,
    /// Deliveries attempted per subscriber and update before the
    /// subscriber is dropped.
    pub max_push_attempts: usize,
    /// How long a publication without subscribers lives.
    #[serde(with = "millis")]
    pub publication_expiration: Duration,
    pub lock_reentry: ReentryMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            update_delay: Duration::from_millis(100),
            min_update_delay: Duration::from_millis(25),
            retry_delays: RetryDelaySeq::default(),
            max_push_attempts: 5,
            publication_expiration: Duration::from_secs(60),
            lock_reentry: ReentryMode::default(),
        }
    }
}

impl Settings {
    /// Parse and validate.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_push_attempts == 0 {
            return Err(SettingsError::Invalid(
                "max_push_attempts must be at least 1".to_string(),
            ));
        }
        if self.publication_expiration.is_zero() {
            return Err(SettingsError::Invalid(
                "publication_expiration must be positive".to_string(),
            ));
        }
        self.retry_delays.validate()
    }

    pub fn delayer_registry(&self, clock: Arc<dyn Clock>) -> DelayerRegistry {
        DelayerRegistry::from_settings(self, clock)
    }

    pub fn publisher_options(&self) -> PublisherOptions {
        PublisherOptions {
            update_delay: self.update_delay,
            max_push_attempts: self.max_push_attempts,
            publication_expiration: self.publication_expiration,
        }
    }
}

/// Serde adapter for durations as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod list {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(durations.iter().map(|duration| duration.as_millis() as u64))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
            Vec::<u64>::deserialize(deserializer).map(|millis| millis.into_iter().map(Duration::from_millis).collect())
        }
    }
}
