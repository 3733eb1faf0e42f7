use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Jitter applied around each computed delay, as a fraction.
const JITTER: f64 = 0.25;

/// Exponential re-link backoff with ±25% jitter.
///
/// The delay for attempt `n` is `initial * factor^n`, capped at `max`, then
/// jittered. A successful connection calls [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Creates a backoff with explicit parameters.
    ///
    /// # Examples
    ///
    /// ```
    /// use peerdroid::backoff::ExponentialBackoff;
    /// use std::time::Duration;
    /// let mut backoff = ExponentialBackoff::new(
    ///     Duration::from_millis(100),
    ///     Duration::from_millis(5000),
    ///     2.0,
    /// );
    /// let delay = backoff.next_delay();
    /// assert!(delay >= Duration::from_millis(75));
    /// assert!(delay <= Duration::from_millis(125));
    /// assert_eq!(backoff.attempts(), 1);
    /// ```
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            attempt: 0,
        }
    }

    /// Creates a backoff from the `[reconnect]` config section.
    #[must_use]
    pub const fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_factor,
        )
    }

    /// Attempts made since creation or the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for the current attempt.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn base_delay(&self) -> Duration {
        let exponent = self.attempt.min(i32::MAX as u32) as i32;
        let ms = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        if ms.is_finite() && ms < self.max.as_millis() as f64 {
            Duration::from_millis(ms.round() as u64)
        } else {
            self.max
        }
    }

    /// Computes the next delay (with jitter) and advances to the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range((1.0 - JITTER)..=(1.0 + JITTER));
        base.mul_f64(jitter)
    }

    /// Goes back to the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
