//! Per-tenant quota governance: rolling usage, status derivation, budget
//! projection, and edge-triggered transitions.
//!
//! The governor owns the authoritative [`QuotaStatus`] per tenant. Status is
//! never set directly by callers; it is derived from counters, or forced by
//! a provider error report. Explicit error states take priority over derived
//! ones and are not overridden while active.
//!
//! The governor never broadcasts: it returns a [`QuotaTransition`] exactly
//! when the stored status changed, and the facade pushes that through the
//! connection registry. This keeps the governor free of external
//! dependencies while preserving the one-notification-per-transition
//! guarantee (transitions are linearized under the tenant's lock).

mod budget;
mod status;
mod window;

pub use budget::{BudgetHealth, BudgetPolicy, BudgetReport};
pub use status::{
    NotificationLevel, ProviderErrorKind, QuotaNotification, QuotaStatus, QuotaTransition,
    notification_for,
};
pub use window::UsageWindow;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Warning fires when a counter reaches this fraction of its limit.
const WARNING_THRESHOLD: f64 = 0.9;

/// Per-tenant request limits driving the `Warning` derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaPolicy {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_requests_per_day")]
    pub requests_per_day: u32,
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_requests_per_day() -> u32 {
    5000
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            requests_per_day: default_requests_per_day(),
        }
    }
}

impl QuotaPolicy {
    pub fn validate(&self, tenant: &str) -> Result<()> {
        if self.requests_per_minute == 0 || self.requests_per_day == 0 {
            return Err(Error::config(format!(
                "tenant '{tenant}': quota limits must be positive"
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TenantState {
    window: UsageWindow,
    status: QuotaStatus,
    rate_limited_until: Option<DateTime<Utc>>,
    /// Minute bucket in which the provider reported insufficient quota.
    /// Cleared by administrative reset or a successful call in a later
    /// minute window.
    quota_exceeded_since_minute: Option<i64>,
    degraded: bool,
}

impl TenantState {
    fn new() -> Self {
        Self {
            window: UsageWindow::new(),
            status: QuotaStatus::Normal,
            rate_limited_until: None,
            quota_exceeded_since_minute: None,
            degraded: false,
        }
    }
}

/// Derives and owns the per-tenant quota status state machine.
#[derive(Debug)]
pub struct QuotaGovernor {
    tenants: DashMap<String, Arc<Mutex<TenantState>>>,
    policies: HashMap<String, QuotaPolicy>,
    default_policy: QuotaPolicy,
    rate_limit_cooldown: chrono::Duration,
}

impl QuotaGovernor {
    pub fn new(
        policies: HashMap<String, QuotaPolicy>,
        default_policy: QuotaPolicy,
        rate_limit_cooldown: Duration,
    ) -> Self {
        Self {
            tenants: DashMap::new(),
            policies,
            default_policy,
            rate_limit_cooldown: chrono::Duration::from_std(rate_limit_cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        }
    }

    fn tenant(&self, tenant_id: &str) -> Arc<Mutex<TenantState>> {
        self.tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TenantState::new())))
            .clone()
    }

    fn policy(&self, tenant_id: &str) -> &QuotaPolicy {
        self.policies.get(tenant_id).unwrap_or(&self.default_policy)
    }

    /// Priority order: explicit RateLimited, explicit QuotaExceeded, manual
    /// Degraded, derived Warning, Normal. Exactly one status is active.
    fn derive(&self, state: &mut TenantState, policy: &QuotaPolicy, now: DateTime<Utc>) -> QuotaStatus {
        if state.rate_limited_until.is_some_and(|until| until > now) {
            return QuotaStatus::RateLimited;
        }
        state.rate_limited_until = None;

        if state.quota_exceeded_since_minute.is_some() {
            return QuotaStatus::QuotaExceeded;
        }
        if state.degraded {
            return QuotaStatus::Degraded;
        }

        let per_minute = state.window.requests_this_minute(now) as f64;
        let per_day = state.window.requests_today(now) as f64;
        if per_minute >= WARNING_THRESHOLD * f64::from(policy.requests_per_minute)
            || per_day >= WARNING_THRESHOLD * f64::from(policy.requests_per_day)
        {
            return QuotaStatus::Warning;
        }
        QuotaStatus::Normal
    }

    fn apply(
        &self,
        tenant_id: &str,
        state: &mut TenantState,
        next: QuotaStatus,
        now: DateTime<Utc>,
    ) -> Option<QuotaTransition> {
        if state.status == next {
            return None;
        }
        let from = state.status;
        state.status = next;
        info!(
            tenant = tenant_id,
            from = from.as_str(),
            to = next.as_str(),
            "quota status transition"
        );
        Some(QuotaTransition {
            tenant_id: tenant_id.to_string(),
            from,
            to: next,
            at: now,
        })
    }

    /// Record one provider call and re-derive the tenant's status.
    ///
    /// Returns `Some` exactly when the stored status changed; repeated calls
    /// that keep the derived status produce no further transitions.
    pub fn record_call(
        &self,
        tenant_id: &str,
        success: bool,
        tokens_used: u64,
    ) -> Option<QuotaTransition> {
        self.record_call_at(tenant_id, success, tokens_used, Utc::now())
    }

    pub fn record_call_at(
        &self,
        tenant_id: &str,
        success: bool,
        tokens_used: u64,
        now: DateTime<Utc>,
    ) -> Option<QuotaTransition> {
        let tenant = self.tenant(tenant_id);
        let mut state = tenant.lock().unwrap_or_else(|e| e.into_inner());
        state.window.record_at(now, success, tokens_used);

        // A successful call in a later minute window clears a provider
        // quota-exceeded report; administrative reset also clears it.
        if success
            && let Some(since) = state.quota_exceeded_since_minute
            && now.timestamp() / 60 > since
        {
            state.quota_exceeded_since_minute = None;
        }

        let next = self.derive(&mut state, self.policy(tenant_id), now);
        self.apply(tenant_id, &mut state, next, now)
    }

    /// Force an explicit status from a provider error class, bypassing
    /// derivation.
    pub fn record_provider_error(
        &self,
        tenant_id: &str,
        kind: ProviderErrorKind,
    ) -> Option<QuotaTransition> {
        self.record_provider_error_at(tenant_id, kind, Utc::now())
    }

    pub fn record_provider_error_at(
        &self,
        tenant_id: &str,
        kind: ProviderErrorKind,
        now: DateTime<Utc>,
    ) -> Option<QuotaTransition> {
        let tenant = self.tenant(tenant_id);
        let mut state = tenant.lock().unwrap_or_else(|e| e.into_inner());
        let next = match kind {
            ProviderErrorKind::RateLimit => {
                state.rate_limited_until = Some(now + self.rate_limit_cooldown);
                QuotaStatus::RateLimited
            }
            ProviderErrorKind::InsufficientQuota => {
                state.quota_exceeded_since_minute = Some(now.timestamp() / 60);
                QuotaStatus::QuotaExceeded
            }
        };
        self.apply(tenant_id, &mut state, next, now)
    }

    /// Manually toggle the fifth, never-auto-assigned status.
    pub fn set_degraded(&self, tenant_id: &str, degraded: bool) -> Option<QuotaTransition> {
        let now = Utc::now();
        let tenant = self.tenant(tenant_id);
        let mut state = tenant.lock().unwrap_or_else(|e| e.into_inner());
        state.degraded = degraded;
        let next = self.derive(&mut state, self.policy(tenant_id), now);
        self.apply(tenant_id, &mut state, next, now)
    }

    /// Administrative reset: clears explicit error states and re-derives.
    pub fn reset_status(&self, tenant_id: &str) -> Option<QuotaTransition> {
        let now = Utc::now();
        let tenant = self.tenant(tenant_id);
        let mut state = tenant.lock().unwrap_or_else(|e| e.into_inner());
        state.rate_limited_until = None;
        state.quota_exceeded_since_minute = None;
        let next = self.derive(&mut state, self.policy(tenant_id), now);
        self.apply(tenant_id, &mut state, next, now)
    }

    /// Current stored status. Does not re-derive.
    pub fn status(&self, tenant_id: &str) -> QuotaStatus {
        self.tenants
            .get(tenant_id)
            .map(|t| {
                t.value()
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .status
            })
            .unwrap_or_default()
    }

    /// Pure advisory payload for the tenant's current status.
    pub fn notification_for(&self, tenant_id: &str) -> QuotaNotification {
        notification_for(self.status(tenant_id))
    }

    /// Project the tenant's monthly spend against its budget.
    pub fn check_budget(&self, tenant_id: &str, policy: &BudgetPolicy) -> Result<BudgetReport> {
        policy.validate(tenant_id)?;
        let report = policy.project();
        debug!(
            tenant = tenant_id,
            projected = report.projected_monthly,
            "budget projection"
        );
        Ok(report)
    }

    pub fn prune(&self, tenant_id: &str) {
        if let Some(tenant) = self.tenants.get(tenant_id) {
            tenant
                .value()
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .window
                .prune_at(Utc::now());
        }
    }

    pub fn prune_all(&self) {
        let now = Utc::now();
        for entry in self.tenants.iter() {
            entry
                .value()
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .window
                .prune_at(now);
        }
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        self.tenants.iter().map(|e| e.key().clone()).collect()
    }
}
