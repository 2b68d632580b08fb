//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure resubscription backoff.
use std::time;

use rand::Rng;

#[derive(Clone, Debug)]
/// A retry policy to determine how long a partition waits before resubscribing.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// Up to this fraction of the interval is added at random, or taken off
    /// once the interval reached `maximum_interval`.
    pub jitter: f64,
    /// Consecutive failures tolerated before giving up.
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Backoff for a given attempt number (starting at 1), before jitter.
    pub fn base_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self.initial_interval.saturating_mul(
            self.backoff_coefficient
                .saturating_pow(attempt.saturating_sub(1)),
        );

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Determine the interval to wait before retrying at a given attempt number.
    ///
    /// Jitter is added on top of the base interval, up to `maximum_interval`.
    /// Once the base interval is capped, jitter is drawn below the cap instead,
    /// so partitions that keep failing do not all retry at the same moment.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let interval = self.base_interval(attempt);
        if self.jitter <= 0.0 {
            return interval;
        }

        let secs = interval.as_secs_f64();
        let (low, high) = match self.maximum_interval {
            Some(max_interval) if interval >= max_interval => (secs * (1.0 - self.jitter), secs),
            Some(max_interval) => (
                secs,
                (secs * (1.0 + self.jitter)).min(max_interval.as_secs_f64()),
            ),
            None => (secs, secs * (1.0 + self.jitter)),
        };
        let jittered = rand::thread_rng().gen_range(low..=high);
        time::Duration::try_from_secs_f64(jittered).unwrap_or(interval)
    }

    /// Whether a partition that failed `failures` times in a row may try again.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    pub jitter: f64,
    pub max_retries: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(200),
            maximum_interval: None,
            jitter: 0.0,
            max_retries: 5,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn jitter(mut self, jitter: f64) -> RetryPolicyBuilder {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> RetryPolicyBuilder {
        self.max_retries = max_retries;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            jitter: self.jitter,
            max_retries: self.max_retries,
        }
    }
}
