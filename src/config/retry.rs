use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Policy for retrying a failed operation with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (excludes the initial attempt).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that performs no retries (single attempt only).
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Total number of times the operation may run.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Compute the delay for the given attempt number (0-indexed).
    ///
    /// Applies exponential backoff with random jitter in [0.5x, 1.0x] of the
    /// computed delay, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every allowed attempt failed; carries the last error.
    Exhausted { attempts: u32, last_error: E },
    /// The token fired before an attempt succeeded.
    Cancelled { attempts: u32 },
}

/// Execute a closure with retry logic according to the given policy.
///
/// Calls `f` up to `policy.max_retries + 1` times, sleeping with exponential
/// backoff between failures. Both the in-flight attempt and the backoff sleep
/// are abandoned as soon as `cancel` fires.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
            r = f() => r,
        };
        attempts += 1;

        let e = match result {
            Ok(val) => return Ok(val),
            Err(e) => e,
        };

        if attempts >= policy.max_attempts() {
            tracing::warn!(attempt = attempts, error = %e, "final attempt failed");
            return Err(RetryError::Exhausted {
                attempts,
                last_error: e,
            });
        }

        let delay = policy.delay_for_attempt(attempts - 1);
        tracing::warn!(
            attempt = attempts,
            max = policy.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "attempt failed, retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
