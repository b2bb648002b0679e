//! Token bucket rate primitive.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket bounding burst and sustained throughput.
///
/// Tokens refill continuously at `rate` per second up to `capacity`.
/// Refill and deduction happen inside a single critical section so two
/// concurrent acquirers can never observe the same token snapshot. The
/// lock is never held across a sleep: waiting callers compute their wait
/// under the lock, release it, sleep, then re-check.
///
/// Cancellation-safe: deduction only happens after the wait completes, so
/// a cancelled `acquire` consumes no tokens.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl std::fmt::Debug for BucketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketState")
            .field("tokens", &self.tokens)
            .finish()
    }
}

impl TokenBucket {
    /// Create a bucket that starts full.
    ///
    /// `rate` is tokens per second; `capacity` is the maximum burst.
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Acquire `amount` tokens, sleeping until enough have refilled.
    ///
    /// Returns the total seconds spent waiting (0.0 if tokens were
    /// immediately available).
    pub async fn acquire(&self, amount: f64) -> f64 {
        let amount = amount.min(self.capacity);
        let mut waited = 0.0_f64;
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                self.refill(&mut state, Instant::now());
                if state.tokens >= amount {
                    state.tokens -= amount;
                    return waited;
                }
                (amount - state.tokens) / self.rate
            };
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            waited += wait;
        }
    }

    /// Deduct `amount` tokens without waiting.
    ///
    /// Returns false if insufficient tokens are available.
    pub fn try_acquire(&self, amount: f64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state, Instant::now());
        if state.tokens >= amount {
            state.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// Current token count after refill. Observability only.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state, Instant::now());
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_bucket_starts_full() {
        let bucket = TokenBucket::new(1.0, 5.0);
        assert!((bucket.available() - 5.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_burst_then_wait() {
        tokio::time::pause();
        let bucket = TokenBucket::new(10.0 / 60.0, 3.0);

        for _ in 0..3 {
            let waited = bucket.acquire(1.0).await;
            assert_eq!(waited, 0.0);
        }

        // Bucket is empty; the next token takes 1/(10/60) = 6 seconds.
        let waited = bucket.acquire(1.0).await;
        assert!((waited - 6.0).abs() < 0.1, "waited {waited}");
    }

    #[tokio::test]
    async fn test_tokens_never_negative_or_above_capacity() {
        tokio::time::pause();
        let bucket = TokenBucket::new(100.0, 4.0);

        for _ in 0..20 {
            bucket.acquire(1.0).await;
            let available = bucket.available();
            assert!(available >= 0.0);
            assert!(available <= 4.0 + 1e-6);
        }
    }

    #[tokio::test]
    async fn test_refill_saturates_at_capacity() {
        tokio::time::pause();
        let bucket = TokenBucket::new(2.0, 10.0);
        assert!(bucket.try_acquire(10.0));
        assert!(bucket.available() < 1e-6);

        // capacity/rate = 5s to refill fully; wait far longer.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((bucket.available() - 10.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_try_acquire_does_not_go_negative() {
        let bucket = TokenBucket::new(1.0, 2.0);
        assert!(bucket.try_acquire(2.0));
        assert!(!bucket.try_acquire(1.0));
        assert!(bucket.available() >= 0.0);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_consumes_nothing() {
        tokio::time::pause();
        let bucket = Arc::new(TokenBucket::new(0.5, 1.0));
        assert!(bucket.try_acquire(1.0));

        let b = Arc::clone(&bucket);
        let waiter = tokio::spawn(async move { b.acquire(1.0).await });
        tokio::task::yield_now().await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        // The aborted waiter must not have deducted anything: after a full
        // refill interval the bucket holds exactly one token again.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!((bucket.available() - 1.0).abs() < 1e-6);
    }
}
