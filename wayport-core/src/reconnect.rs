//! Reconnect backoff for the tunnel client
//!
//! Delays grow exponentially from `base` up to `max`, with symmetric jitter so
//! a fleet of clients cut off by a gateway restart does not reconnect in
//! lockstep.

use rand::Rng;
use std::time::Duration;
use wayport_common::TunnelError;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay
    pub base: Duration,
    /// Upper bound on any delay
    pub max: Duration,
    /// Growth per failed attempt
    pub factor: f64,
    /// Jitter as a fraction of the delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.3,
        }
    }
}

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; counts the attempt
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Call after a successful handshake
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.config.base.as_secs_f64() * self.config.factor.powi(exponent);
        let capped = raw.min(self.config.max.as_secs_f64());

        let spread = capped * self.config.jitter.clamp(0.0, 1.0);
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };

        Duration::from_secs_f64((capped + jitter).clamp(0.0, self.config.max.as_secs_f64()))
    }
}

/// Whether a failed session is worth retrying.
///
/// A rejected credential or a route owned by another client will be rejected
/// again on the next attempt, so those end the reconnect loop.
#[must_use]
pub fn is_retryable(err: &TunnelError) -> bool {
    !matches!(
        err,
        TunnelError::Authentication(_)
            | TunnelError::DuplicateRegistration(_)
            | TunnelError::Config(_)
            | TunnelError::Protocol(_)
    )
}

/// Reconnect bookkeeping for one client
#[derive(Debug)]
pub struct ReconnectPolicy {
    backoff: Backoff,
    max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(config: BackoffConfig, max_attempts: Option<u32>) -> Self {
        Self {
            backoff: Backoff::new(config),
            max_attempts,
        }
    }

    pub fn on_connected(&mut self) {
        self.backoff.reset();
    }

    /// Delay before retrying after `err`, or `None` to give up
    pub fn on_failure(&mut self, err: &TunnelError) -> Option<Duration> {
        if !is_retryable(err) {
            return None;
        }
        if self
            .max_attempts
            .is_some_and(|max| self.backoff.attempts() >= max)
        {
            return None;
        }
        Some(self.backoff.next_delay())
    }
}
