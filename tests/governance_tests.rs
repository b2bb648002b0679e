//! Governance Core Tests
//!
//! End-to-end tests across the facade: rate limiting with backoff, quota
//! status transitions and broadcast, connection registry lifecycle, and
//! configuration loading.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use flowgate::{
    BudgetHealth, Error, EventFrame, EventKind, GovernanceConfig, GovernanceFacade,
    LocalTransport, QuotaPolicy, QuotaStatus, RateLimitPolicy, TenantPolicy,
};
use serde_json::json;

fn test_config() -> GovernanceConfig {
    let mut config = GovernanceConfig::single_provider(
        "anthropic",
        RateLimitPolicy {
            requests_per_minute: 600,
            burst_capacity: 50,
            cooldown_seconds: 0.05,
            max_retries: 2,
            ..Default::default()
        },
    );
    config.tenants.insert(
        "ws-1".to_string(),
        TenantPolicy {
            budget: Some(flowgate::BudgetPolicy {
                monthly_budget: 100.0,
                current_spend: 40.0,
                days_elapsed: 10,
                days_in_period: 30,
            }),
            quota: Some(QuotaPolicy {
                requests_per_minute: 10,
                requests_per_day: 1000,
            }),
        },
    );
    config
}

// =============================================================================
// Rate limiting
// =============================================================================

mod limiter_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_acquire_permit_waits_out_burst() {
        let mut config = GovernanceConfig::single_provider(
            "anthropic",
            RateLimitPolicy {
                requests_per_minute: 10,
                burst_capacity: 3,
                ..Default::default()
            },
        );
        config.connection.send_timeout_ms = 100;
        let facade = GovernanceFacade::new(config).unwrap();

        for _ in 0..3 {
            assert_eq!(facade.acquire_permit("anthropic").await.unwrap(), 0.0);
        }
        let waited = facade.acquire_permit("anthropic").await.unwrap();
        assert!((waited - 6.0).abs() < 0.1, "waited {waited}");
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_with_config_error() {
        let facade = GovernanceFacade::new(test_config()).unwrap();
        let err = facade.acquire_permit("unconfigured").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_governed_retries_then_succeeds() {
        let facade = GovernanceFacade::new(test_config()).unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let result = facade
            .execute_governed("ws-1", "anthropic", move || {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::throttled(None))
                    } else {
                        Ok("done")
                    }
                })
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let stats = facade.provider_stats("anthropic").unwrap();
        assert_eq!(stats.consecutive_errors, 0);
        assert!(!stats.in_cooldown);
        assert_eq!(stats.calls_last_minute, 2);
    }
}

// =============================================================================
// Quota governance
// =============================================================================

mod quota_tests {
    use super::*;

    #[tokio::test]
    async fn test_warning_broadcast_fires_once() {
        let facade = GovernanceFacade::new(test_config()).unwrap();
        let (transport, mut rx) = LocalTransport::new(64);
        facade
            .register_client("ws-1", "observer", Arc::new(transport))
            .await;
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::ConnectionConfirmed);

        // ws-1 allows 10/min; the warning edge is at 9. Recording well past
        // the edge still produces exactly one quota_update frame.
        for _ in 0..15 {
            facade.record_usage("ws-1", true, 100).await;
        }

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.kind, EventKind::QuotaUpdate);
        assert_eq!(frame.data["status"], "warning");
        assert!(rx.try_recv().is_err(), "only one transition frame expected");
        assert_eq!(facade.governor().status("ws-1"), QuotaStatus::Warning);
    }

    #[tokio::test]
    async fn test_quota_exhausted_is_not_retried_and_sets_status() {
        let facade = GovernanceFacade::new(test_config()).unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let result: Result<(), Error> = facade
            .execute_governed("ws-1", "anthropic", move || {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::quota_exhausted("billing hard cap"))
                })
            })
            .await;

        assert!(result.unwrap_err().is_quota_exhausted());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(facade.governor().status("ws-1"), QuotaStatus::QuotaExceeded);

        let notification = facade.get_quota_notification("ws-1");
        assert!(notification.show);
        assert_eq!(notification.title, "Quota exhausted");
    }

    #[tokio::test]
    async fn test_budget_projection_over_budget() {
        let facade = GovernanceFacade::new(test_config()).unwrap();
        let report = facade.check_budget("ws-1").unwrap();
        assert!((report.projected_monthly - 120.0).abs() < 1e-9);
        assert_eq!(report.status, BudgetHealth::OverBudget);
        assert_eq!(report.days_remaining, 20);
    }
}

// =============================================================================
// Connection lifecycle
// =============================================================================

mod registry_tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_counts_only_live_channels() {
        let facade = GovernanceFacade::new(test_config()).unwrap();

        let mut receivers = Vec::new();
        for i in 0..3 {
            let (transport, mut rx) = LocalTransport::new(16);
            facade
                .register_client("ws-1", &format!("client-{i}"), Arc::new(transport))
                .await;
            let _ = rx.recv().await;
            receivers.push(rx);
        }

        // Kill one client's transport behind the registry's back.
        drop(receivers.pop());

        let frame = EventFrame::new(EventKind::WorkspaceUpdate, json!({"goal": "g-1"}));
        let delivered = facade.broadcast("ws-1", &frame).await;
        assert_eq!(delivered, 2);
        assert_eq!(facade.registry().connection_count("ws-1"), 2);
    }

    #[tokio::test]
    async fn test_task_subscription_stream() {
        let facade = GovernanceFacade::new(test_config()).unwrap();
        let (transport, mut rx) = LocalTransport::new(16);
        let channel = facade
            .register_client("ws-1", "client-1", Arc::new(transport))
            .await;
        let _ = rx.recv().await;

        facade.subscribe_task(&channel, "task-7").await;
        let confirm = rx.recv().await.unwrap();
        assert_eq!(confirm.kind, EventKind::SubscriptionConfirmed);

        let delivered = facade
            .broadcast_task_update("task-7", json!({"progress": 0.5}))
            .await;
        assert_eq!(delivered, 1);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.kind, EventKind::TaskUpdate);
        assert_eq!(update.data["progress"], 0.5);
    }

    #[tokio::test]
    async fn test_reconnect_drops_stale_subscriptions() {
        let facade = GovernanceFacade::new(test_config()).unwrap();

        let (transport, mut rx) = LocalTransport::new(16);
        let first = facade
            .register_client("ws-1", "client-1", Arc::new(transport))
            .await;
        let _ = rx.recv().await;
        facade.subscribe_task(&first, "task-1").await;

        let (transport, mut rx2) = LocalTransport::new(16);
        let second = facade
            .register_client("ws-1", "client-1", Arc::new(transport))
            .await;
        let _ = rx2.recv().await;

        assert!(first.is_closed());
        assert!(second.subscriptions().is_empty());
        assert_eq!(facade.registry().subscriber_count("task-1"), 0);
        assert_eq!(facade.registry().connection_count("ws-1"), 1);
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config_tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "providers": {{
                    "anthropic": {{ "requests_per_minute": 120, "burst_capacity": 20 }},
                    "openai": {{}}
                }},
                "connection": {{ "send_timeout_ms": 250 }}
            }}"#
        )
        .unwrap();

        let config = GovernanceConfig::from_json_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers["anthropic"].requests_per_minute, 120);
        assert_eq!(config.providers["openai"].requests_per_minute, 60);
        assert_eq!(config.connection.send_timeout_ms, 250);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = GovernanceConfig::from_json_file("/nonexistent/governance.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_invalid_policy_rejected_at_startup() {
        let mut providers = HashMap::new();
        providers.insert(
            "anthropic".to_string(),
            RateLimitPolicy {
                requests_per_minute: 0,
                ..Default::default()
            },
        );
        let config = GovernanceConfig {
            providers,
            ..Default::default()
        };
        assert!(GovernanceFacade::new(config).is_err());
    }
}
