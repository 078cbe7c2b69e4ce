//! Exponential backoff with jitter.
//!
//! A [`Backoff`] hands out a fresh, lazy sequence of delays for every export
//! call. The sequence never ends on its own; the exporter stops drawing from it
//! once a delay reaches the configured retry ceiling.

use crate::config::{check_jitter, RetryConfig};
use crate::error::ExporterBuildError;
use rand::Rng;
use std::fmt::Debug;
use std::time::Duration;

/// Source of retry delays.
pub trait Backoff: Debug + Send + Sync {
    /// Starts a new delay sequence. Each call restarts from the first delay.
    ///
    /// A finite iterator is allowed; running out of delays ends the retry loop.
    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send>;
}

/// Capped exponential growth with multiplicative jitter.
///
/// The n-th delay is `min(initial_delay * 2^n * f, max_delay)` where `f` is
/// drawn uniformly from `[1 - jitter, 1 + jitter]`. The cap is applied after the
/// jitter, and growth continues until `base * (1 - jitter)` reaches
/// `max_delay`, so from then on every delay equals `max_delay` exactly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `initial_delay` and capped at `max_delay`,
    /// with the default jitter of 0.2.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        ExponentialBackoff {
            initial_delay,
            max_delay,
            jitter: RetryConfig::default().jitter,
        }
    }

    /// Sets the relative jitter, which must be within `[0, 1)`. Zero disables
    /// jitter.
    pub fn with_jitter(mut self, jitter: f64) -> Result<Self, ExporterBuildError> {
        check_jitter(jitter)?;
        self.jitter = jitter;
        Ok(self)
    }
}

impl TryFrom<&RetryConfig> for ExponentialBackoff {
    type Error = ExporterBuildError;

    fn try_from(config: &RetryConfig) -> Result<Self, Self::Error> {
        ExponentialBackoff::new(config.initial_delay, config.max_delay).with_jitter(config.jitter)
    }
}

impl Backoff for ExponentialBackoff {
    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        Box::new(ExponentialDelays {
            base: self.initial_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
        })
    }
}

/// Infinite iterator produced by [`ExponentialBackoff::delays`].
#[derive(Debug)]
pub struct ExponentialDelays {
    base: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Iterator for ExponentialDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let factor = if self.jitter > 0.0 {
            rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        } else {
            1.0
        };
        let delay = Duration::try_from_secs_f64(self.base.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        // Growth stops once the smallest jittered delay is already capped.
        if self.base.as_secs_f64() * (1.0 - self.jitter) < self.max_delay.as_secs_f64() {
            self.base = self.base.saturating_mul(2);
        }

        Some(delay)
    }
}
