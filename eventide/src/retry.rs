use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds the [`ErrorResolution::Retry`](crate::ErrorResolution::Retry) loop.
///
/// Every retry of the same event waits for the next delay of an exponential
/// back-off. When `max_retries` retries were spent the subscription faults
/// with [`SubscriptionError::RetryExhausted`](crate::SubscriptionError::RetryExhausted).
///
/// The default allows 10 retries, starting at 100ms and doubling up to 30s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: Option<usize>,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub factor: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(10),
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Retries `max_retries` times without waiting.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries: Some(max_retries),
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Never gives up.
    pub fn unbounded() -> Self {
        Self {
            max_retries: None,
            ..Self::default()
        }
    }

    pub fn max_retries(mut self, v: usize) -> Self {
        self.max_retries = Some(v);

        self
    }

    pub fn min_delay(mut self, v: Duration) -> Self {
        self.min_delay = v;

        self
    }

    pub fn max_delay(mut self, v: Duration) -> Self {
        self.max_delay = v;

        self
    }

    /// Delays to wait before each retry. Ends when the budget is spent.
    pub(crate) fn backoff(&self) -> impl Iterator<Item = Duration> + Send {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay.max(self.min_delay))
            .with_factor(self.factor.max(1.0))
            .with_max_times(self.max_retries.unwrap_or(usize::MAX))
            .build()
    }
}
