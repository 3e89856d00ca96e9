//! Per-model admission gate.
//!
//! Every `(provider instance, model)` pair gets a dedicated limiter with two
//! independent gates: a time-based token bucket honoring the configured
//! requests-per-minute, and a concurrency gate honoring the provider's
//! in-flight cap. Releasing a guard frees its concurrency slot; time-based
//! tokens are never returned.
//!
//! Bucket shape: the bucket starts full at `rpm` tokens and refills
//! continuously at `rpm / 60` per second, so any 60-second window admits at
//! most `2 * rpm` acquisitions (initial burst plus refill). The limiter
//! itself cannot fail in steady state; `acquire` fails only on cancellation,
//! and a cancelled wait consumes no token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The only failure `acquire` can produce.
#[derive(Debug, thiserror::Error)]
#[error("rate limit wait cancelled")]
pub struct AcquireCancelled;

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rpm: u32) -> Self {
        let capacity = f64::from(rpm);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token if available, otherwise report how long until one is.
    fn try_take(&mut self) -> Option<Duration> {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64(
                (1.0 - self.tokens) / self.refill_per_sec,
            ))
        }
    }
}

/// Admission gate for one `(provider instance, model)` key.
pub struct RateLimiter {
    bucket: Option<tokio::sync::Mutex<Bucket>>,
    concurrency: Option<Arc<Semaphore>>,
}

/// Held for the duration of one provider call; dropping it frees the
/// concurrency slot.
#[derive(Debug)]
pub struct InFlightGuard {
    _permit: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    pub fn new(rpm: u32, max_concurrent: Option<usize>) -> Self {
        Self {
            bucket: (rpm > 0).then(|| tokio::sync::Mutex::new(Bucket::new(rpm))),
            concurrency: max_concurrent.map(|cap| Arc::new(Semaphore::new(cap.max(1)))),
        }
    }

    /// An always-open gate.
    pub fn unlimited() -> Self {
        Self::new(0, None)
    }

    /// Block until a token is available and the in-flight count is below the
    /// concurrency cap. Returns immediately when neither gate is configured.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<InFlightGuard, AcquireCancelled> {
        let permit = match &self.concurrency {
            Some(semaphore) => {
                let acquired = tokio::select! {
                    _ = cancel.cancelled() => return Err(AcquireCancelled),
                    permit = Arc::clone(semaphore).acquire_owned() => permit,
                };
                // The semaphore is never closed while the limiter is alive.
                Some(acquired.map_err(|_| AcquireCancelled)?)
            }
            None => None,
        };

        if let Some(bucket) = &self.bucket {
            loop {
                let wait = bucket.lock().await.try_take();
                match wait {
                    None => break,
                    Some(duration) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(AcquireCancelled),
                            _ = tokio::time::sleep(duration) => {}
                        }
                    }
                }
            }
        }

        Ok(InFlightGuard { _permit: permit })
    }
}

/// Hands out one shared limiter per `(provider, model)` key. The first
/// request for a key fixes its limits.
#[derive(Default)]
pub struct RateLimiterPool {
    limiters: Mutex<HashMap<(String, String), Arc<RateLimiter>>>,
}

impl RateLimiterPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limiter(
        &self,
        provider: &str,
        model: &str,
        rpm: u32,
        max_concurrent: Option<usize>,
    ) -> Arc<RateLimiter> {
        let key = (provider.to_string(), model.to_string());
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            limiters
                .entry(key)
                .or_insert_with(|| Arc::new(RateLimiter::new(rpm, max_concurrent))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_acquires_immediately() {
        let limiter = RateLimiter::unlimited();
        let cancel = CancellationToken::new();
        for _ in 0..100 {
            limiter.acquire(&cancel).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_enforces_rate_after_burst() {
        let limiter = RateLimiter::new(2, None);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        // Initial burst admits the full bucket.
        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The third acquisition waits for one token at 2/min.
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixty_second_window_bounded() {
        let rpm = 6;
        let limiter = RateLimiter::new(rpm, None);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let mut admitted = 0u32;
        while start.elapsed() < Duration::from_secs(60) {
            limiter.acquire(&cancel).await.unwrap();
            admitted += 1;
            if admitted > 3 * rpm {
                break;
            }
        }
        // Burst (rpm) plus one minute of refill (rpm), at most.
        assert!(admitted <= 2 * rpm + 1, "admitted {}", admitted);
    }

    #[tokio::test]
    async fn test_concurrency_gate_blocks_until_release() {
        let limiter = Arc::new(RateLimiter::new(0, Some(1)));
        let cancel = CancellationToken::new();

        let guard = limiter.acquire(&cancel).await.unwrap();

        let contender = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await.is_ok() })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        assert!(contender.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_does_not_consume_a_token() {
        let limiter = RateLimiter::new(1, None);
        let cancel = CancellationToken::new();

        // Drain the bucket.
        limiter.acquire(&cancel).await.unwrap();

        let waiter = CancellationToken::new();
        waiter.cancel();
        assert!(limiter.acquire(&waiter).await.is_err());

        // The failed acquire took nothing: one minute later exactly one
        // token is available again.
        tokio::time::advance(Duration::from_secs(60)).await;
        limiter.acquire(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_shares_limiters_per_key() {
        let pool = RateLimiterPool::new();
        let a = pool.limiter("openai", "gpt-4o", 10, None);
        let b = pool.limiter("openai", "gpt-4o", 99, None);
        let c = pool.limiter("openai", "gpt-4o-mini", 10, None);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
