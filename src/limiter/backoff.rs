//! Backoff schedule for throttled providers.

use super::policy::RateLimitPolicy;

/// Escalating cooldown derived from a provider's consecutive-error streak.
///
/// The schedule is `cooldown_seconds * backoff_base^(streak - 1)`, capped
/// at the policy ceiling. Values are plain seconds throughout, matching
/// the [`RateLimitPolicy`] fields they come from.
#[derive(Clone, Copy, Debug)]
pub struct BackoffSchedule {
    cooldown_seconds: f64,
    base: f64,
    max_seconds: f64,
}

impl BackoffSchedule {
    pub fn new(cooldown_seconds: f64, base: f64, max_seconds: f64) -> Self {
        Self {
            cooldown_seconds,
            base,
            max_seconds,
        }
    }

    /// Seconds to back off after `streak` consecutive throttles.
    ///
    /// A streak of zero is treated as one so the first throttle always
    /// waits at least the base cooldown.
    pub fn delay_seconds(&self, streak: u32) -> f64 {
        let exponent = streak.max(1) - 1;
        let scaled = self.cooldown_seconds * self.base.powi(exponent as i32);
        scaled.min(self.max_seconds)
    }
}

impl From<&RateLimitPolicy> for BackoffSchedule {
    fn from(policy: &RateLimitPolicy) -> Self {
        Self::new(
            policy.cooldown_seconds,
            policy.backoff_base,
            policy.max_backoff_seconds,
        )
    }
}
