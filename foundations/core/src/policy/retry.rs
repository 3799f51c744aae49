//! Exponential-backoff retry schedules.

use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(200, Duration::from_millis(50), Duration::from_millis(5_000), 2.0)
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; zero is treated as one.
    #[must_use]
    pub const fn exponential(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        factor: f64,
    ) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            base_delay,
            max_delay,
            factor,
        }
    }

    /// Constant spacing between attempts.
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::exponential(max_attempts, delay, delay, 1.0)
    }

    #[must_use]
    pub const fn network() -> Self {
        Self::exponential(5, Duration::from_millis(500), Duration::from_secs(5), 2.0)
    }

    /// ~600 polls spaced 200ms apart, matching the port discovery deadline.
    #[must_use]
    pub const fn port_discovery() -> Self {
        Self::fixed(600, Duration::from_millis(200))
    }

    #[must_use]
    pub const fn health_check() -> Self {
        Self::exponential(10, Duration::from_millis(100), Duration::from_secs(1), 2.0)
    }

    #[must_use]
    pub const fn provider_connection() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(10), 2.0)
    }

    #[must_use]
    pub const fn websocket_reconnect() -> Self {
        Self::exponential(20, Duration::from_millis(250), Duration::from_secs(10), 1.5)
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_nanos() as f64 * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(scaled as u64)
    }

    /// Runs `operation` until it succeeds or the attempt budget is spent.
    ///
    /// The closure receives the 1-based attempt number. On exhaustion the last
    /// error is returned as is.
    pub async fn retry<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= self.max_attempts => return Err(error),
                Err(_) => {
                    let delay = self.delay_after(attempt);
                    debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
