//! Bounded retry with linear backoff
//!
//! One mechanism for every retry ladder in the crate; call sites differ only
//! in the constants they pass.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use config::RetrySettings;

/// `max_attempts` tries in total; the wait after the n-th failure is `step * n`,
/// clamped to `cap` when one is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub step: Duration,
    pub cap: Option<Duration>,
}

impl RetryPolicy {
    pub const fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts,
            step,
            cap: None,
        }
    }

    pub const fn capped(max_attempts: u32, step: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            step,
            cap: Some(cap),
        }
    }

    /// Single attempt, no waiting
    pub const fn once() -> Self {
        Self::linear(1, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after the failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.step.saturating_mul(attempt);
        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Run `op` until it succeeds, `should_retry` declines the error, or the
    /// attempts are used up. `op` receives the 1-based attempt number.
    pub async fn retry<T, E, F, Fut, R>(&self, label: &str, mut op: F, mut should_retry: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts() && should_retry(&e) => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        label,
                        attempt,
                        self.attempts(),
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            step: Duration::from_millis(settings.step_ms),
            cap: settings.cap_ms.map(Duration::from_millis),
        }
    }
}
