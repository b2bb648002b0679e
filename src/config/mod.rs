//! Static governance configuration, loaded at startup.
//!
//! Configuration problems are fatal at startup: [`GovernanceConfig::validate`]
//! runs before any component is built, so a missing or nonsensical policy
//! fails fast instead of surfacing mid-flight.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limiter::RateLimitPolicy;
use crate::quota::{BudgetPolicy, QuotaPolicy};
use crate::{Error, Result};

/// Liveness and broadcast tuning for the connection registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Idle threshold before a channel is probed, in seconds.
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
    /// Cadence of the background liveness sweep, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Bound on each broadcast send, in milliseconds.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Bound on each liveness probe, in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_liveness_timeout_secs() -> u64 {
    90
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_send_timeout_ms() -> u64 {
    500
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: default_liveness_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            send_timeout_ms: default_send_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Quota governor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// How long an explicit rate-limited status stays authoritative, in
    /// seconds.
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
    /// Limits applied to tenants without an explicit policy.
    #[serde(default)]
    pub default_policy: QuotaPolicy,
}

fn default_rate_limit_cooldown_secs() -> u64 {
    30
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            default_policy: QuotaPolicy::default(),
        }
    }
}

impl QuotaConfig {
    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }
}

/// Per-tenant policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantPolicy {
    #[serde(default)]
    pub budget: Option<BudgetPolicy>,
    #[serde(default)]
    pub quota: Option<QuotaPolicy>,
}

/// Root configuration for the governance facade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Per-provider rate limit policies. At least one provider is required.
    #[serde(default)]
    pub providers: HashMap<String, RateLimitPolicy>,
    #[serde(default)]
    pub tenants: HashMap<String, TenantPolicy>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

impl GovernanceConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Convenience constructor for a single provider with default tuning.
    pub fn single_provider(name: impl Into<String>, policy: RateLimitPolicy) -> Self {
        let mut providers = HashMap::new();
        providers.insert(name.into(), policy);
        Self {
            providers,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(Error::config("no provider rate limit policies configured"));
        }
        for (name, policy) in &self.providers {
            policy.validate(name)?;
        }
        for (tenant, policy) in &self.tenants {
            if let Some(budget) = &policy.budget {
                budget.validate(tenant)?;
            }
            if let Some(quota) = &policy.quota {
                quota.validate(tenant)?;
            }
        }
        if self.connection.send_timeout_ms == 0 || self.connection.sweep_interval_secs == 0 {
            return Err(Error::config("connection timeouts must be positive"));
        }
        Ok(())
    }

    pub fn quota_policies(&self) -> HashMap<String, QuotaPolicy> {
        self.tenants
            .iter()
            .filter_map(|(id, policy)| policy.quota.clone().map(|q| (id.clone(), q)))
            .collect()
    }

    pub fn budget_policy(&self, tenant_id: &str) -> Option<&BudgetPolicy> {
        self.tenants.get(tenant_id).and_then(|t| t.budget.as_ref())
    }
}
