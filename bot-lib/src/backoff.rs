use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::time::Duration;

/// Exponential backoff between retries of a failed outbound call.
#[serde_as]
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in seconds.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub initial: Duration,
    /// Upper bound for computed delays, in seconds.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub cap: Duration,
    pub base: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            base: 2.,
        }
    }
}

impl BackoffPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        // a base below one would shrink the delay
        let base = if self.base.is_finite() && self.base >= 1. {
            self.base
        } else {
            1.
        };

        Duration::try_from_secs_f64(current.as_secs_f64() * base)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// The wait after a rate limit response. A server hint always wins over
    /// the local delay, and isn't clamped.
    pub fn with_hint(&self, hint: Option<Duration>, current: Duration) -> Duration {
        hint.map_or(current, |hint| hint.max(current))
    }

    /// The delays a fresh retry loop will sleep, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial.min(self.cap)), |current| {
            Some(self.next_delay(*current))
        })
    }
}
