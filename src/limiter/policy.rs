//! Per-provider rate limit policies.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Immutable rate limiting configuration for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Sustained request budget per minute. Drives the bucket refill rate.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Sustained request budget per hour. Diagnostics only.
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u32,

    /// Maximum burst: the bucket capacity.
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: u32,

    /// Base cooldown after a provider-reported throttle, in seconds.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: f64,

    /// Retry budget for throttling-class failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Exponential backoff multiplier applied per consecutive error.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,

    /// Cap on the computed backoff, in seconds.
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: f64,
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_requests_per_hour() -> u32 {
    1000
}

fn default_burst_capacity() -> u32 {
    10
}

fn default_cooldown_seconds() -> f64 {
    5.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_max_backoff_seconds() -> f64 {
    300.0
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            requests_per_hour: default_requests_per_hour(),
            burst_capacity: default_burst_capacity(),
            cooldown_seconds: default_cooldown_seconds(),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            max_backoff_seconds: default_max_backoff_seconds(),
        }
    }
}

impl RateLimitPolicy {
    /// Bucket refill rate in tokens per second.
    pub fn effective_rate(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }

    pub fn validate(&self, provider: &str) -> Result<()> {
        if self.requests_per_minute == 0 {
            return Err(Error::config(format!(
                "provider '{provider}': requests_per_minute must be positive"
            )));
        }
        if self.burst_capacity == 0 {
            return Err(Error::config(format!(
                "provider '{provider}': burst_capacity must be positive"
            )));
        }
        if self.cooldown_seconds <= 0.0 {
            return Err(Error::config(format!(
                "provider '{provider}': cooldown_seconds must be positive"
            )));
        }
        if self.backoff_base < 1.0 {
            return Err(Error::config(format!(
                "provider '{provider}': backoff_base must be at least 1.0"
            )));
        }
        if self.max_backoff_seconds < self.cooldown_seconds {
            return Err(Error::config(format!(
                "provider '{provider}': max_backoff_seconds below cooldown_seconds"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let policy = RateLimitPolicy::default();
        assert!(policy.validate("test").is_ok());
        assert!((policy.effective_rate() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_zero_rate() {
        let policy = RateLimitPolicy {
            requests_per_minute: 0,
            ..Default::default()
        };
        let err = policy.validate("anthropic").unwrap_err();
        assert!(err.to_string().contains("requests_per_minute"));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let policy: RateLimitPolicy =
            serde_json::from_str(r#"{"requests_per_minute": 10, "burst_capacity": 3}"#).unwrap();
        assert_eq!(policy.requests_per_minute, 10);
        assert_eq!(policy.burst_capacity, 3);
        assert_eq!(policy.max_retries, 3);
        assert!((policy.backoff_base - 2.0).abs() < 1e-9);
    }
}
