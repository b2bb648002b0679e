//! Tenant quota status and user-facing advisories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authoritative per-tenant status. One value per tenant, mutated only by
/// the quota governor; callers never set it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    #[default]
    Normal,
    Warning,
    RateLimited,
    QuotaExceeded,
    /// Manually signaled partial-capacity operation. Never auto-assigned.
    Degraded,
}

impl QuotaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::RateLimited => "rate_limited",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Degraded => "degraded",
        }
    }
}

/// Provider error classes that force an explicit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// "Slow down" — maps to [`QuotaStatus::RateLimited`].
    RateLimit,
    /// "No budget left" — maps to [`QuotaStatus::QuotaExceeded`].
    InsufficientQuota,
}

/// An edge-triggered status change. Exactly one is produced per transition.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaTransition {
    pub tenant_id: String,
    pub from: QuotaStatus,
    pub to: QuotaStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// User-facing advisory derived from the current status.
///
/// Quota and rate-limit conditions surface only through this payload,
/// never as errors thrown at end users.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaNotification {
    pub show: bool,
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    pub actions: Vec<String>,
}

/// Pure mapping from status to advisory payload. No side effects.
pub fn notification_for(status: QuotaStatus) -> QuotaNotification {
    match status {
        QuotaStatus::Normal => QuotaNotification {
            show: false,
            level: NotificationLevel::Info,
            title: String::new(),
            message: String::new(),
            actions: Vec::new(),
        },
        QuotaStatus::Warning => QuotaNotification {
            show: true,
            level: NotificationLevel::Warning,
            title: "Approaching usage limit".to_string(),
            message: "This workspace is near its request limit. Activity may slow down soon."
                .to_string(),
            actions: vec!["review_usage".to_string()],
        },
        QuotaStatus::RateLimited => QuotaNotification {
            show: true,
            level: NotificationLevel::Warning,
            title: "Rate limited".to_string(),
            message: "The AI provider asked us to slow down. Work resumes automatically."
                .to_string(),
            actions: vec!["review_usage".to_string()],
        },
        QuotaStatus::QuotaExceeded => QuotaNotification {
            show: true,
            level: NotificationLevel::Error,
            title: "Quota exhausted".to_string(),
            message: "The provider quota for this workspace is exhausted. Increase the quota or wait for the next billing window."
                .to_string(),
            actions: vec!["upgrade_plan".to_string(), "contact_support".to_string()],
        },
        QuotaStatus::Degraded => QuotaNotification {
            show: true,
            level: NotificationLevel::Warning,
            title: "Degraded mode".to_string(),
            message: "This workspace is running in essential-only mode.".to_string(),
            actions: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_hides_notification() {
        let n = notification_for(QuotaStatus::Normal);
        assert!(!n.show);
    }

    #[test]
    fn test_levels_match_severity() {
        assert_eq!(
            notification_for(QuotaStatus::Warning).level,
            NotificationLevel::Warning
        );
        assert_eq!(
            notification_for(QuotaStatus::QuotaExceeded).level,
            NotificationLevel::Error
        );
        assert!(notification_for(QuotaStatus::RateLimited).show);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&QuotaStatus::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");
    }
}
