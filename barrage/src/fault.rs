//! Fault injection.
//!
//! Every iteration of a virtual user first passes through the [`Fault`]
//! injector. It may add a fixed delay before the iteration and, with the
//! configured probability, swap the synthesized request for the failure
//! request. Both settings are fixed for the lifetime of a run.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Errors produced by [`Fault`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// The rate is a probability.
    #[error("fault rate {0} is not within [0, 1]")]
    Rate(f64),
}

/// Configuration for [`Fault`]
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Probability that an iteration sends the failure request.
    pub rate: f64,
    /// Delay added before every iteration.
    #[serde(with = "humantime_serde")]
    pub extra_latency: Duration,
}

/// The fault injector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fault {
    rate: f64,
    extra_latency: Duration,
}

impl Fault {
    /// Create a new [`Fault`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rate`] unless the rate is within `[0, 1]`.
    pub fn new(config: Config) -> Result<Self, Error> {
        if !(0.0..=1.0).contains(&config.rate) {
            return Err(Error::Rate(config.rate));
        }
        Ok(Self {
            rate: config.rate,
            extra_latency: config.extra_latency,
        })
    }

    /// The configured failure probability.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// The delay to add before an iteration, if any.
    #[must_use]
    pub fn extra_latency(&self) -> Option<Duration> {
        (!self.extra_latency.is_zero()).then_some(self.extra_latency)
    }

    /// Decide whether this iteration is a simulated failure.
    ///
    /// Always consumes exactly one draw in `[0, 1)`, whatever the rate.
    pub fn trips<R>(&self, rng: &mut R) -> bool
    where
        R: Rng + ?Sized,
    {
        rng.random::<f64>() < self.rate
    }
}
