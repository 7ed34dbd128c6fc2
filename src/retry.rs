use std::time::Duration;

/// Exponential backoff with jitter for throttled provider calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), with +/-25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exponent = attempt.saturating_sub(1).min(16);
        let delay_ms = base_ms.saturating_mul(2_u64.pow(exponent)).min(max_ms);
        let jitter_range = (delay_ms as f64 * 0.25) as u64;
        let jitter = fastrand::u64(0..=jitter_range * 2);
        Duration::from_millis(delay_ms.saturating_sub(jitter_range).saturating_add(jitter))
    }
}

/// Retries an async operation while it fails with `RateLimited`; other errors return at once.
macro_rules! retry_rate_limited {
    ($context:expr, $policy:expr, $operation:expr) => {{
        let policy: $crate::retry::RetryPolicy = $policy;
        let context_value: String = $context.into();
        let mut attempt: u32 = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if !err.is_rate_limited() || attempt > policy.max_retries => {
                    break Err(err)
                }
                Err(err) => {
                    let delay = policy.delay_for_attempt(attempt);
                    log::warn!(
                        "Attempt {}/{} for {} was rate limited: {}. Retrying in {}ms.",
                        attempt,
                        policy.max_retries + 1,
                        context_value,
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_rate_limited;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BacktestError;
    use std::cell::Cell;

    #[test]
    fn delay_grows_exponentially_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let first = policy.delay_for_attempt(1).as_millis();
        assert!((75..=125).contains(&first));
        let second = policy.delay_for_attempt(2).as_millis();
        assert!((150..=250).contains(&second));
        let capped = policy.delay_for_attempt(6).as_millis();
        assert!((225..=375).contains(&capped));
    }

    #[tokio::test]
    async fn retries_only_rate_limited_errors() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };

        let calls = Cell::new(0u32);
        let result: Result<u32, BacktestError> = retry_rate_limited!("test", policy, async {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(BacktestError::rate_limited("AAA", "slow down"))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result, Ok(3));

        let calls = Cell::new(0u32);
        let result: Result<u32, BacktestError> = retry_rate_limited!("test", policy, async {
            calls.set(calls.get() + 1);
            Err(BacktestError::data_unavailable("AAA", "unknown"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);

        let calls = Cell::new(0u32);
        let result: Result<u32, BacktestError> = retry_rate_limited!("test", policy, async {
            calls.set(calls.get() + 1);
            Err(BacktestError::rate_limited("AAA", "still throttled"))
        });
        assert!(result.unwrap_err().is_rate_limited());
        assert_eq!(calls.get(), 4);
    }
}
