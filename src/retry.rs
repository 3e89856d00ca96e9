//! Policy-driven retry loop around provider calls.
//!
//! Classification comes from the provider adapter alone: only errors marked
//! retryable are retried, not-supported and fatal errors short-circuit, and
//! cancellation during a back-off wait aborts the loop without issuing
//! another call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::providers::ProviderError;

/// Run `op` under `policy`. `op` receives the 1-indexed call number; a
/// policy with `max_retry_attempts == 0` yields exactly one call.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut retries: u32 = 0;
    loop {
        match op(retries + 1).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || retries >= policy.max_retry_attempts {
                    return Err(err);
                }
                retries += 1;
                let base = policy.delay_for_attempt(retries);
                let wait = base + jitter(policy.jitter_bound(base));
                tracing::debug!(
                    retry = retries,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "retrying after transient provider failure"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
}

/// Uniform sample from `[0, bound)`; zero when the bound is zero.
fn jitter(bound: Duration) -> Duration {
    if bound.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..bound.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_retry_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_retry_attempts,
            initial_delay_ms: 1,
            backoff_multiplier: 2.0,
            max_delay_ms: None,
            jitter_ms: Some(0),
        }
    }

    fn transient() -> ProviderError {
        ProviderError::Retryable(anyhow::anyhow!("boom"))
    }

    #[tokio::test]
    async fn test_success_after_k_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&CancellationToken::new(), &quick_policy(2), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok("answer")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "answer");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&CancellationToken::new(), &quick_policy(1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_means_single_call() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&CancellationToken::new(), &quick_policy(0), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&CancellationToken::new(), &quick_policy(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Other(anyhow::anyhow!("bad request"))) }
        })
        .await;
        assert!(!result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_supported_propagates_verbatim() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&CancellationToken::new(), &quick_policy(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::FeatureNotSupported("vision".to_string())) }
        })
        .await;
        assert!(result.unwrap_err().is_not_supported());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_wait_stops_the_loop() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let slow_policy = RetryPolicy {
            max_retry_attempts: 5,
            initial_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            max_delay_ms: None,
            jitter_ms: Some(0),
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&cancel, &slow_policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_number_is_one_indexed() {
        let result = retry(&CancellationToken::new(), &quick_policy(3), |call| async move {
            if call < 3 {
                Err(transient())
            } else {
                Ok(call)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }
}
