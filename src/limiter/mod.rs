//! Per-provider rate limiting: token buckets, cooldown, exponential backoff.
//!
//! The limiter converts provider-reported throttling into a cooperative wait
//! rather than an error: [`RateLimiter::execute_with_limit`] retries
//! throttling-class failures with backoff and propagates everything else
//! immediately.

mod backoff;
mod bucket;
mod ledger;
mod policy;

pub use backoff::BackoffSchedule;
pub use bucket::TokenBucket;
pub use ledger::CallLedger;
pub use policy::RateLimitPolicy;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Read-only snapshot of one provider's limiter state.
///
/// Observability only; never feed this back into control decisions — the
/// snapshot may be stale by the time it is read.
#[derive(Debug, Clone)]
pub struct ProviderStats {
    pub provider: String,
    pub calls_last_minute: usize,
    pub calls_last_hour: usize,
    pub available_tokens: f64,
    pub consecutive_errors: u32,
    pub in_cooldown: bool,
}

#[derive(Debug)]
struct ProviderState {
    policy: RateLimitPolicy,
    bucket: TokenBucket,
    ledger: CallLedger,
    backoff: BackoffSchedule,
    consecutive_errors: AtomicU32,
    cooldown_until: Mutex<Option<Instant>>,
}

impl ProviderState {
    fn new(policy: RateLimitPolicy) -> Self {
        let bucket = TokenBucket::new(
            policy.effective_rate(),
            f64::from(policy.burst_capacity),
        );
        let backoff = BackoffSchedule::from(&policy);
        Self {
            policy,
            bucket,
            ledger: CallLedger::new(),
            backoff,
            consecutive_errors: AtomicU32::new(0),
            cooldown_until: Mutex::new(None),
        }
    }

    fn cooldown_remaining(&self) -> Option<Duration> {
        let mut until = self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner());
        match *until {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    Some(deadline - now)
                } else {
                    *until = None;
                    None
                }
            }
            None => None,
        }
    }

    fn set_cooldown(&self, duration: Duration) {
        let mut until = self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner());
        *until = Some(Instant::now() + duration);
    }

    fn clear_cooldown(&self) {
        let mut until = self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner());
        *until = None;
    }
}

/// Rate limiter governing calls to external providers.
///
/// One token bucket, call ledger, and cooldown state per configured
/// provider. A provider without a configured policy is a configuration
/// error, never a silent pass-through.
#[derive(Debug, Default)]
pub struct RateLimiter {
    providers: DashMap<String, Arc<ProviderState>>,
}

impl RateLimiter {
    /// Build a limiter from per-provider policies.
    ///
    /// Every policy is validated up front; a zero rate or burst capacity
    /// would otherwise surface much later as a nonsense wait inside
    /// [`acquire`](Self::acquire).
    pub fn new(policies: HashMap<String, RateLimitPolicy>) -> Result<Self> {
        let providers = DashMap::new();
        for (name, policy) in policies {
            policy.validate(&name)?;
            providers.insert(name, Arc::new(ProviderState::new(policy)));
        }
        Ok(Self { providers })
    }

    fn provider(&self, name: &str) -> Result<Arc<ProviderState>> {
        self.providers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::config(format!("no rate limit policy for provider '{name}'")))
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Acquire `tokens` permits for one provider call.
    ///
    /// Waits out any active cooldown window first, then the token bucket.
    /// Returns the total seconds spent waiting. The call is recorded in the
    /// provider's ledger once the permit is granted.
    pub async fn acquire(&self, provider: &str, tokens: u32) -> Result<f64> {
        let state = self.provider(provider)?;
        let mut waited = 0.0_f64;

        if let Some(remaining) = state.cooldown_remaining() {
            debug!(
                provider,
                "in cooldown, waiting {:.2}s",
                remaining.as_secs_f64()
            );
            tokio::time::sleep(remaining).await;
            waited += remaining.as_secs_f64();
        }

        waited += state.bucket.acquire(f64::from(tokens.max(1))).await;
        state.ledger.record();

        if waited > 0.0 {
            debug!(provider, "rate limiter waited {:.2}s for permit", waited);
        }
        Ok(waited)
    }

    /// Record a provider-reported throttle and compute the recommended wait.
    ///
    /// This is the single source of truth for backoff: callers must sleep
    /// the returned number of seconds rather than invent their own delay.
    /// The same duration becomes the cooldown window that delays subsequent
    /// `acquire` calls.
    pub fn report_throttled(&self, provider: &str) -> Result<f64> {
        let state = self.provider(provider)?;
        let errors = state.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = state.backoff.delay_seconds(errors);
        state.set_cooldown(Duration::from_secs_f64(delay));
        warn!(
            provider,
            consecutive_errors = errors,
            "provider throttled, backing off {delay:.1}s"
        );
        Ok(delay)
    }

    /// Record a successful call: clears the error streak and any cooldown so
    /// a recovered provider returns to full throughput without penalty.
    pub fn report_success(&self, provider: &str) -> Result<()> {
        let state = self.provider(provider)?;
        state.consecutive_errors.store(0, Ordering::SeqCst);
        state.clear_cooldown();
        Ok(())
    }

    /// Run `operation` under the provider's rate limit, retrying
    /// throttling-class failures with backoff up to the policy's retry
    /// budget. Non-throttling failures propagate immediately.
    pub async fn execute_with_limit<T, F>(&self, provider: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> BoxFuture<'static, Result<T>>,
    {
        let max_retries = self.provider(provider)?.policy.max_retries;
        let mut attempts = 0_u32;

        loop {
            self.acquire(provider, 1).await?;

            match operation().await {
                Ok(value) => {
                    self.report_success(provider)?;
                    return Ok(value);
                }
                Err(e) if e.is_throttling() => {
                    let backoff = self.report_throttled(provider)?;
                    attempts += 1;
                    if attempts > max_retries {
                        warn!(provider, attempts, "retry budget exhausted");
                        return Err(e);
                    }
                    // Honor a provider-suggested delay when it exceeds ours.
                    let wait = match e.retry_after() {
                        Some(d) => d.as_secs_f64().max(backoff),
                        None => backoff,
                    };
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn stats(&self, provider: &str) -> Result<ProviderStats> {
        let state = self.provider(provider)?;
        Ok(ProviderStats {
            provider: provider.to_string(),
            calls_last_minute: state.ledger.calls_last_minute(),
            calls_last_hour: state.ledger.calls_last_hour(),
            available_tokens: state.bucket.available(),
            consecutive_errors: state.consecutive_errors.load(Ordering::SeqCst),
            in_cooldown: state.cooldown_remaining().is_some(),
        })
    }
}
