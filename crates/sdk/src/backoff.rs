//! Bounded exponential backoff for connection retries.
//!
//! When a connection attempt fails the connection manager asks the backoff
//! for the next delay. Delays grow geometrically up to a ceiling, and after
//! `max_retries` consecutive failures the backoff gives up so the caller can
//! surface a terminal `Connection` error instead of looping forever.
//!
//! # Algorithm
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)     for n <= max_retries
//! ```
//!
//! With the defaults (initial=1s, multiplier=2.0, max=60s, 10 retries):
//! 1s, 2s, 4s, 8s, 16s, 32s, 60s, 60s, 60s, 60s, then give up.
//!
//! A successful connect calls [`Backoff::reset`] so the next outage starts
//! again from the initial delay.

use std::time::Duration;

use thiserror::Error;

use crate::config::ReconnectConfig;

/// Error type for backoff exhaustion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackoffError {
    /// All retries have been used. Carries the configured limit.
    #[error("Maximum number of connection retries exceeded: {0}")]
    Exhausted(u32),
}

/// Exponential backoff controller.
///
/// Cheap to clone; the connection manager clones a template for every
/// retry sequence so concurrent sequences never share counters.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
    max_retries: u32,
}

impl Backoff {
    /// Creates a backoff with custom timing and a retry ceiling.
    ///
    /// A multiplier below 1.0 is clamped to 1.0 (constant delay).
    pub fn new(initial: Duration, max: Duration, multiplier: f64, max_retries: u32) -> Self {
        let max = max.max(initial);
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            multiplier: multiplier.max(1.0),
            attempt: 0,
            max_retries,
        }
    }

    /// Builds the backoff described by the reconnect section of the client config.
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_secs(config.max_delay_secs),
            config.multiplier,
            config.max_retries,
        )
    }

    /// Resets the retry counter and delay after a successful connection.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the delay to sleep before the next attempt.
    ///
    /// # Returns
    /// - `Ok(Duration)`: wait this long, then retry
    /// - `Err(BackoffError::Exhausted)`: `max_retries` attempts have already been used
    pub fn next_delay(&mut self) -> Result<Duration, BackoffError> {
        if self.attempt >= self.max_retries {
            return Err(BackoffError::Exhausted(self.max_retries));
        }
        self.attempt += 1;

        let delay = self.current_delay;
        let next = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = Duration::from_secs_f64(next).min(self.max_delay);

        Ok(delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// The delay the next call to [`Backoff::next_delay`] will return.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
