//! Top-level wiring of limiter, governor, and registry.
//!
//! The facade is the explicit context handle the business layer holds: no
//! ambient singletons, one instance per deployment unit. Every governed
//! provider call passes the rate limiter and updates the quota governor,
//! and every quota transition the governor reports is pushed to the
//! tenant's channels as a `quota_update` frame.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::GovernanceConfig;
use crate::limiter::{ProviderStats, RateLimiter};
use crate::quota::{
    BudgetReport, ProviderErrorKind, QuotaGovernor, QuotaNotification, QuotaTransition,
};
use crate::registry::{Channel, ChannelTransport, ClientFrame, ConnectionRegistry, EventFrame, EventKind};
use crate::{Error, Result};

#[derive(Debug)]
pub struct GovernanceFacade {
    config: GovernanceConfig,
    limiter: Arc<RateLimiter>,
    governor: Arc<QuotaGovernor>,
    registry: Arc<ConnectionRegistry>,
    sweep_cancel: CancellationToken,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl GovernanceFacade {
    /// Build the facade from validated configuration. Fails fast on any
    /// configuration problem.
    pub fn new(config: GovernanceConfig) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(config.providers.clone())?);
        let governor = Arc::new(QuotaGovernor::new(
            config.quota_policies(),
            config.quota.default_policy.clone(),
            config.quota.rate_limit_cooldown(),
        ));
        let registry = Arc::new(ConnectionRegistry::new(config.connection.send_timeout()));
        Ok(Self {
            config,
            limiter,
            governor,
            registry,
            sweep_cancel: CancellationToken::new(),
            sweep_handle: Mutex::new(None),
        })
    }

    /// Spawn the background liveness sweep on its configured cadence.
    /// Calling more than once is a no-op.
    pub fn start(&self) {
        let mut handle = self.sweep_handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return;
        }

        let registry = Arc::clone(&self.registry);
        let governor = Arc::clone(&self.governor);
        let cancel = self.sweep_cancel.clone();
        let liveness = self.config.connection.liveness_timeout();
        let probe = self.config.connection.probe_timeout();
        let every = self.config.connection.sweep_interval();

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        registry.sweep_idle(liveness, probe).await;
                        governor.prune_all();
                    }
                }
            }
            debug!("liveness sweep stopped");
        }));
        info!(
            interval_secs = every.as_secs(),
            "governance facade started"
        );
    }

    /// Stop the sweep and close every channel.
    pub async fn shutdown(&self) {
        self.sweep_cancel.cancel();
        let handle = {
            let mut guard = self.sweep_handle.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.registry.close_all().await;
        info!("governance facade shut down");
    }

    // ---- connection surface ----

    /// Handshake: register the client's channel and confirm the connection.
    pub async fn register_client(
        &self,
        tenant_id: &str,
        client_id: &str,
        transport: Arc<dyn ChannelTransport>,
    ) -> Arc<Channel> {
        let channel = self.registry.register(tenant_id, client_id, transport).await;
        let confirm = EventFrame::new(
            EventKind::ConnectionConfirmed,
            json!({ "tenant_id": tenant_id, "client_id": client_id }),
        );
        self.registry.send_to(&channel, &confirm).await;
        channel
    }

    /// Subscribe the channel to a task's progress stream.
    pub async fn subscribe_task(&self, channel: &Arc<Channel>, task_id: &str) {
        self.registry
            .handle_client_frame(
                channel,
                ClientFrame::SubscribeTask {
                    task_id: task_id.to_string(),
                },
            )
            .await;
    }

    pub async fn handle_client_frame(&self, channel: &Arc<Channel>, frame: ClientFrame) {
        self.registry.handle_client_frame(channel, frame).await;
    }

    /// Push an event to all of a tenant's channels. Returns the delivery
    /// count.
    pub async fn broadcast(&self, tenant_id: &str, frame: &EventFrame) -> usize {
        self.registry.broadcast(tenant_id, frame).await
    }

    /// Push a task progress event to the task's subscribers.
    pub async fn broadcast_task_update(&self, task_id: &str, data: serde_json::Value) -> usize {
        let frame = EventFrame::new(EventKind::TaskUpdate, data);
        self.registry.broadcast_to_task(task_id, &frame).await
    }

    // ---- governed provider calls ----

    /// Acquire a permit for one provider call, waiting out cooldown and
    /// bucket refill. Returns the seconds waited.
    pub async fn acquire_permit(&self, provider: &str) -> Result<f64> {
        self.limiter.acquire(provider, 1).await
    }

    /// Run an operation under the provider's rate limit on behalf of a
    /// tenant, recording the outcome with the quota governor and pushing
    /// any status transition to the tenant's channels.
    ///
    /// Token consumption is not known here; report it afterwards through
    /// [`record_usage`](Self::record_usage).
    pub async fn execute_governed<T, F>(
        &self,
        tenant_id: &str,
        provider: &str,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> BoxFuture<'static, Result<T>>,
    {
        let result = self.limiter.execute_with_limit(provider, operation).await;
        match &result {
            Ok(_) => {
                let transition = self.governor.record_call(tenant_id, true, 0);
                self.push_transition(transition).await;
            }
            Err(e) if e.is_throttling() => {
                let counted = self.governor.record_call(tenant_id, false, 0);
                self.push_transition(counted).await;
                let forced = self
                    .governor
                    .record_provider_error(tenant_id, ProviderErrorKind::RateLimit);
                self.push_transition(forced).await;
            }
            Err(e) if e.is_quota_exhausted() => {
                let counted = self.governor.record_call(tenant_id, false, 0);
                self.push_transition(counted).await;
                let forced = self
                    .governor
                    .record_provider_error(tenant_id, ProviderErrorKind::InsufficientQuota);
                self.push_transition(forced).await;
            }
            Err(_) => {
                let transition = self.governor.record_call(tenant_id, false, 0);
                self.push_transition(transition).await;
            }
        }
        result
    }

    /// Record provider usage for a tenant and push any resulting status
    /// transition.
    pub async fn record_usage(&self, tenant_id: &str, success: bool, tokens_used: u64) {
        let transition = self.governor.record_call(tenant_id, success, tokens_used);
        self.push_transition(transition).await;
    }

    async fn push_transition(&self, transition: Option<QuotaTransition>) {
        let Some(transition) = transition else {
            return;
        };
        let notification = crate::quota::notification_for(transition.to);
        let frame = EventFrame::new(
            EventKind::QuotaUpdate,
            json!({
                "status": transition.to,
                "previous": transition.from,
                "notification": notification,
            }),
        );
        self.registry.broadcast(&transition.tenant_id, &frame).await;
    }

    // ---- quota and budget surface ----

    pub fn get_quota_notification(&self, tenant_id: &str) -> QuotaNotification {
        self.governor.notification_for(tenant_id)
    }

    /// Budget projection for a tenant with a configured budget policy.
    pub fn check_budget(&self, tenant_id: &str) -> Result<BudgetReport> {
        let policy = self
            .config
            .budget_policy(tenant_id)
            .ok_or_else(|| Error::config(format!("no budget policy for tenant '{tenant_id}'")))?;
        self.governor.check_budget(tenant_id, policy)
    }

    pub fn provider_stats(&self, provider: &str) -> Result<ProviderStats> {
        self.limiter.stats(provider)
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn governor(&self) -> &Arc<QuotaGovernor> {
        &self.governor
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}
