//! Retry with exponential backoff, and a deadline for each attempt

use crate::error::ApiError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in ±30%
    pub jitter: bool,
    /// Deadline for a single attempt; elapsing counts as a retryable failure
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl RetryConfig {
    /// No retries, no jitter. Used by tests and by one-shot calls.
    pub fn once() -> Self {
        Self {
            max_retries: 0,
            jitter: false,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * exp)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Race `future` against a timer; elapsing yields `deadline-exceeded`
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::deadline_exceeded(format!(
            "Operation timed out after {:?}",
            duration
        ))),
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. The last error is returned.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, mut f: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut retry = 0;

    loop {
        let result = match config.attempt_timeout {
            Some(deadline) => with_timeout(deadline, f()).await,
            None => f().await,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                debug!("Not retrying after {}", e);
                return Err(e);
            }
            Err(e) => {
                retry += 1;
                if retry > config.max_retries {
                    warn!("Giving up after {} retries: {}", config.max_retries, e);
                    return Err(e);
                }

                let delay = jittered(config.backoff_for(retry), config.jitter);
                warn!(
                    "Retry attempt {}/{} after {}, waiting {:?}",
                    retry, config.max_retries, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn jittered(base: Duration, jitter: bool) -> Duration {
    if !jitter {
        return base;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(5),
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(350));
        assert_eq!(config.backoff_for(9), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(&fast_config(3), move || {
            let attempt = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(ApiError::new(ErrorCode::Unavailable, "down"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<(), _> = with_retry(&fast_config(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::permission_denied("not a participant")) }
        })
        .await;

        assert_eq!(result.unwrap_err().code, ErrorCode::PermissionDenied);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_returns_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<(), _> = with_retry(&fast_config(2), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::new(ErrorCode::Network, "offline")) }
        })
        .await;

        assert_eq!(result.unwrap_err().code, ErrorCode::Network);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out_and_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let config = RetryConfig {
            attempt_timeout: Some(Duration::from_millis(20)),
            ..fast_config(1)
        };

        let result = with_retry(&config, move || {
            let attempt = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, ApiError>("ok")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_deadline_exceeded() {
        let result: Result<(), _> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert_eq!(result.unwrap_err().code, ErrorCode::DeadlineExceeded);
    }
}
