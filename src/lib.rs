//! # flowgate
//!
//! Connection and resource governance for rate-limited AI provider APIs.
//!
//! This crate bounds concurrent access to costly external providers and
//! streams progress events to many connected clients grouped by workspace
//! (tenant). It is built from three cooperating parts:
//!
//! - [`limiter::RateLimiter`] — per-provider token buckets with cooldown and
//!   exponential backoff
//! - [`quota::QuotaGovernor`] — per-tenant rolling usage, a status state
//!   machine with edge-triggered transitions, and budget projection
//! - [`registry::ConnectionRegistry`] — per-tenant duplex channels with
//!   health-aware broadcast and task-scoped subscriptions
//!
//! [`GovernanceFacade`] wires them together: every outbound provider call
//! passes the rate limiter and updates the quota governor, and every status
//! transition is pushed to subscribed clients.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowgate::{GovernanceConfig, GovernanceFacade};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), flowgate::Error> {
//!     let config = GovernanceConfig::from_json_file("governance.json")?;
//!     let facade = GovernanceFacade::new(config)?;
//!     facade.start();
//!
//!     let waited = facade.acquire_permit("anthropic").await?;
//!     // ... call the provider ...
//!     facade.record_usage("workspace-1", true, 1200).await;
//!
//!     facade.shutdown().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod facade;
pub mod limiter;
pub mod quota;
pub mod registry;

// Re-exports for convenience
pub use config::{ConnectionConfig, GovernanceConfig, QuotaConfig, TenantPolicy};
pub use facade::GovernanceFacade;
pub use limiter::{
    BackoffSchedule, CallLedger, ProviderStats, RateLimitPolicy, RateLimiter, TokenBucket,
};
pub use quota::{
    BudgetHealth, BudgetPolicy, BudgetReport, NotificationLevel, ProviderErrorKind, QuotaGovernor,
    QuotaNotification, QuotaPolicy, QuotaStatus, QuotaTransition, UsageWindow,
};
pub use registry::{
    Channel, ChannelTransport, ClientFrame, ConnectionRegistry, EventFrame, EventKind,
    LocalTransport,
};

use thiserror::Error as ThisError;

/// Crate-wide error type.
///
/// The taxonomy follows the governance contract: throttling is absorbed by
/// the rate limiter (converted into waits and retries), transport failures
/// are absorbed by the connection registry (channel teardown), and
/// configuration errors are fatal at startup.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Provider reported throttling. Retryable after backoff.
    #[error("provider throttled{}", match retry_after {
        Some(d) => format!(", retry in {:.0}s", d.as_secs_f64()),
        None => String::new(),
    })]
    Throttled {
        retry_after: Option<std::time::Duration>,
    },

    /// Provider reported insufficient quota. Not retryable until an
    /// external reset.
    #[error("provider quota exhausted: {message}")]
    QuotaExhausted { message: String },

    /// A channel send or liveness probe failed. Isolated to that channel.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation exceeded timeout.
    #[error("operation timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(std::time::Duration),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error surfaced by a governed operation.
    #[error("{0}")]
    Operation(String),
}

/// Coarse error classification used by retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Throttling or transient transport failures that may succeed on retry.
    Transient,
    /// Configuration or setup errors.
    Configuration,
    /// Provider-side resource limits (quota, budget).
    ResourceLimit,
    /// Internal errors (IO, JSON, unexpected states).
    Internal,
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into())
    }

    pub fn throttled(retry_after: Option<std::time::Duration>) -> Self {
        Error::Throttled { retry_after }
    }

    pub fn quota_exhausted(message: impl Into<String>) -> Self {
        Error::QuotaExhausted {
            message: message.into(),
        }
    }

    /// True for throttling-class failures the rate limiter retries.
    pub fn is_throttling(&self) -> bool {
        matches!(self, Error::Throttled { .. })
    }

    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, Error::QuotaExhausted { .. })
    }

    /// Provider-suggested retry delay, if any.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Error::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Throttled { .. } | Error::Transport(_) | Error::Timeout(_) => {
                ErrorCategory::Transient
            }
            Error::Config(_) => ErrorCategory::Configuration,
            Error::QuotaExhausted { .. } => ErrorCategory::ResourceLimit,
            Error::Json(_) | Error::Io(_) | Error::Operation(_) => ErrorCategory::Internal,
        }
    }
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let throttled = Error::throttled(Some(std::time::Duration::from_secs(5)));
        assert!(throttled.is_throttling());
        assert_eq!(
            throttled.retry_after(),
            Some(std::time::Duration::from_secs(5))
        );
        assert_eq!(throttled.category(), ErrorCategory::Transient);

        let quota = Error::quota_exhausted("monthly cap reached");
        assert!(quota.is_quota_exhausted());
        assert!(!quota.is_throttling());
        assert_eq!(quota.category(), ErrorCategory::ResourceLimit);

        let config = Error::config("no policy for provider");
        assert_eq!(config.category(), ErrorCategory::Configuration);
        assert!(config.retry_after().is_none());
    }

    #[test]
    fn test_error_display() {
        let e = Error::throttled(Some(std::time::Duration::from_secs(30)));
        assert_eq!(e.to_string(), "provider throttled, retry in 30s");

        let e = Error::throttled(None);
        assert_eq!(e.to_string(), "provider throttled");
    }
}
