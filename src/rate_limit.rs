use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    pub backoff_base: f64,
    /// Delay after the first failure; later failures scale it by
    /// `backoff_base^(attempt - 1)`.
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let factor = self.backoff_base.powi(exp);
        if !factor.is_finite() || factor < 0.0 {
            return self.backoff_unit;
        }
        self.backoff_unit.mul_f64(factor)
    }
}

/// Paces remote calls and retries failed ones.
///
/// Holds the time of its own last invocation; every call made through the
/// same limiter waits until `min_interval` has passed since the previous one,
/// whichever operation that was.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn wait_turn(&mut self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                let pause = self.min_interval - elapsed;
                debug!(pause_ms = pause.as_millis() as u64, "rate limit pause");
                thread::sleep(pause);
            }
        }
        self.last_call = Some(Instant::now());
    }

    /// Runs `operation` until it succeeds or `policy.max_retries` attempts
    /// have failed. `on_error` sees every failure with its 1-based attempt
    /// number. Exhaustion surfaces as [`PipelineError::ExhaustedRetries`].
    pub fn execute<T>(
        &mut self,
        policy: &RetryPolicy,
        mut operation: impl FnMut() -> Result<T>,
        mut on_error: Option<&mut dyn FnMut(&anyhow::Error, u32)>,
    ) -> Result<T> {
        let attempts = policy.max_retries.max(1);
        let mut attempt = 1u32;
        loop {
            self.wait_turn();
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if let Some(hook) = on_error.as_mut() {
                        hook(&err, attempt);
                    }
                    if attempt >= attempts {
                        return Err(PipelineError::ExhaustedRetries {
                            attempts,
                            last_error: err,
                        }
                        .into());
                    }
                    let delay = policy.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %format!("{err:#}"),
                        "remote call failed, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
