//! Retry delay sequences.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Delay before each retry, indexed by retry count (1-based).
///
/// Every sequence is non-decreasing in the retry count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryDelaySeq {
    /// `min * 2^(n - 1)`, capped at `max`.
    Exponential {
        #[serde(with = "crate::settings::millis")]
        min: Duration,
        #[serde(with = "crate::settings::millis")]
        max: Duration,
    },
    /// Explicit delays; the last one repeats.
    Fixed {
        #[serde(with = "crate::settings::millis::list")]
        delays: Vec<Duration>,
    },
}

impl RetryDelaySeq {
    /// Fails if `min` exceeds `max`.
    pub fn exponential(min: Duration, max: Duration) -> Result<Self, SettingsError> {
        let seq = Self::Exponential { min, max };
        seq.validate()?;
        Ok(seq)
    }

    /// Fails if a delay is shorter than the one before it.
    pub fn fixed(delays: impl IntoIterator<Item = Duration>) -> Result<Self, SettingsError> {
        let seq = Self::Fixed {
            delays: delays.into_iter().collect(),
        };
        seq.validate()?;
        Ok(seq)
    }

    /// Delay before retry number `retry_count`. Retry 0 is no retry and
    /// has no delay.
    pub fn get(&self, retry_count: usize) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        match self {
            Self::Exponential { min, max } => {
                let factor = u32::try_from(retry_count - 1)
                    .ok()
                    .and_then(|exp| 2u32.checked_pow(exp));
                factor
                    .and_then(|factor| min.checked_mul(factor))
                    .map_or(*max, |delay| delay.min(*max))
            }
            Self::Fixed { delays } => delays
                .get(retry_count - 1)
                .or_else(|| delays.last())
                .copied()
                .unwrap_or(Duration::ZERO),
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        match self {
            Self::Exponential { min, max } if min > max => Err(SettingsError::Invalid(format!(
                "retry delay min {min:?} exceeds max {max:?}"
            ))),
            Self::Fixed { delays } if delays.windows(2).any(|pair| pair[0] > pair[1]) => Err(
                SettingsError::Invalid("retry delays must be non-decreasing".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

impl Default for RetryDelaySeq {
    fn default() -> Self {
        Self::Exponential {
            min: Duration::from_secs(1),
            max: Duration::from_secs(120),
        }
    }
}
