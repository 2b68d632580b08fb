use std::collections::HashMap;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// Records admitted but not yet consumed by the handler, across all partitions.
    #[envconfig(default = "1000")]
    pub max_in_flight: usize,

    #[envconfig(default = "25")]
    pub max_batch_size: usize,

    #[envconfig(default = "1000")]
    pub max_batch_wait: EnvMsDuration,

    /// How long a session waits for gate capacity before pausing.
    #[envconfig(default = "5000")]
    pub backpressure_timeout: EnvMsDuration,

    #[envconfig(default = "100")]
    pub backpressure_pause: EnvMsDuration,

    /// Batches and notifications buffered between sessions and the handler.
    #[envconfig(default = "64")]
    pub delivery_buffer: usize,

    /// A partition that sees no push (not even an empty one) for this long is stalled.
    #[envconfig(default = "30000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "200")]
    pub backoff_base: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub backoff_max: EnvMsDuration,

    /// Fraction of the backoff added at random on top of it, between 0 and 1.
    #[envconfig(default = "0.2")]
    pub backoff_jitter: f64,

    /// Consecutive failures tolerated per partition before giving up on it.
    #[envconfig(default = "5")]
    pub max_retries: u32,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("max_batch_size ({max_batch_size}) cannot exceed max_in_flight ({max_in_flight})")]
    BatchLargerThanGate {
        max_batch_size: usize,
        max_in_flight: usize,
    },
    #[error("backoff_jitter must be between 0 and 1, got {0}")]
    Jitter(f64),
}

impl Config {
    /// Check the settings that would otherwise leave the consumer stuck.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::Zero("max_in_flight"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Zero("max_batch_size"));
        }
        if self.delivery_buffer == 0 {
            return Err(ConfigError::Zero("delivery_buffer"));
        }
        if self.max_batch_size > self.max_in_flight {
            return Err(ConfigError::BatchLargerThanGate {
                max_batch_size: self.max_batch_size,
                max_in_flight: self.max_in_flight,
            });
        }
        let jitter = self.retry_policy.backoff_jitter;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::Jitter(jitter));
        }
        Ok(())
    }

    /// The resubscription policy shared by every partition.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(2, self.retry_policy.backoff_base.0)
            .maximum_interval(self.retry_policy.backoff_max.0)
            .jitter(self.retry_policy.backoff_jitter)
            .max_retries(self.retry_policy.max_retries)
            .provide()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::init_from_hashmap(&HashMap::new()).expect("defaults are valid configuration")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

impl From<time::Duration> for EnvMsDuration {
    fn from(duration: time::Duration) -> Self {
        EnvMsDuration(duration)
    }
}
