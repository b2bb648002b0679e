//! Per-tenant connection registry with health-aware broadcast.
//!
//! Channels are owned exclusively by the registry: created by
//! [`ConnectionRegistry::register`], destroyed by teardown (disconnect,
//! failed send, or failed liveness probe). Broadcast iterates a snapshot of
//! the recipient set, isolates per-channel failures, and reaps dead
//! channels in one pass after delivery — a send failure to one channel
//! never aborts delivery to the rest, and callers only ever see a delivery
//! count.

mod channel;
mod frames;

pub use channel::{Channel, ChannelTransport, LocalTransport};
pub use frames::{ClientFrame, EventFrame, EventKind};

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

/// Tenant- and task-scoped channel sets.
///
/// Per-tenant mutation is serialized by the tenant entry's shard lock;
/// cross-tenant operations proceed concurrently. No lock is held across an
/// `.await`: broadcasts copy the channel set first, then send.
#[derive(Debug)]
pub struct ConnectionRegistry {
    tenants: DashMap<String, AHashMap<String, Arc<Channel>>>,
    subscriptions: DashMap<String, AHashMap<Uuid, Arc<Channel>>>,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            tenants: DashMap::new(),
            subscriptions: DashMap::new(),
            send_timeout,
        }
    }

    /// Register a channel for `(tenant_id, client_id)`.
    ///
    /// Idempotent per client: an existing channel under the same client id
    /// is replaced and torn down best-effort. The new channel starts with a
    /// fresh, empty subscription set.
    pub async fn register(
        &self,
        tenant_id: &str,
        client_id: &str,
        transport: Arc<dyn ChannelTransport>,
    ) -> Arc<Channel> {
        let channel = Arc::new(Channel::new(tenant_id, client_id, transport));
        let replaced = {
            let mut set = self.tenants.entry(tenant_id.to_string()).or_default();
            set.insert(client_id.to_string(), Arc::clone(&channel))
        };
        if let Some(old) = replaced {
            debug!(
                tenant = tenant_id,
                client = client_id,
                "replacing existing channel"
            );
            self.teardown(&old, "replaced by reconnect").await;
        }
        info!(tenant = tenant_id, client = client_id, "channel registered");
        channel
    }

    /// Add the channel to a task's subscriber set. Repeat calls are no-ops.
    pub fn subscribe(&self, channel: &Arc<Channel>, task_id: &str) -> bool {
        if channel.is_closed() {
            return false;
        }
        let newly_added = channel.add_subscription(task_id);
        self.subscriptions
            .entry(task_id.to_string())
            .or_default()
            .insert(channel.conn_id(), Arc::clone(channel));
        // A teardown can land between the liveness check above and the
        // insert, having already walked a subscription list that did not
        // include this task. Undo the insert so a closed channel never
        // lingers in the subscriber map.
        if channel.is_closed() {
            self.unsubscribe_conn(task_id, channel.conn_id());
            return false;
        }
        newly_added
    }

    fn unsubscribe_conn(&self, task_id: &str, conn_id: Uuid) {
        if let Some(mut subs) = self.subscriptions.get_mut(task_id) {
            subs.remove(&conn_id);
        }
        self.subscriptions.remove_if(task_id, |_, subs| subs.is_empty());
    }

    /// Deliver a frame to every live channel of a tenant.
    ///
    /// Returns the number of successful deliveries. Channels whose send
    /// fails or times out are torn down after the pass completes.
    pub async fn broadcast(&self, tenant_id: &str, frame: &EventFrame) -> usize {
        let snapshot: Vec<Arc<Channel>> = self
            .tenants
            .get(tenant_id)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default();
        self.deliver(snapshot, frame).await
    }

    /// Same semantics as [`broadcast`](Self::broadcast), scoped to a task's
    /// subscriber set.
    pub async fn broadcast_to_task(&self, task_id: &str, frame: &EventFrame) -> usize {
        let snapshot: Vec<Arc<Channel>> = self
            .subscriptions
            .get(task_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default();
        self.deliver(snapshot, frame).await
    }

    async fn deliver(&self, channels: Vec<Arc<Channel>>, frame: &EventFrame) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for channel in channels {
            if channel.is_closed() {
                dead.push(channel);
                continue;
            }
            match tokio::time::timeout(self.send_timeout, channel.transport().send(frame)).await {
                Ok(Ok(())) => {
                    channel.touch();
                    delivered += 1;
                }
                Ok(Err(e)) => {
                    debug!(
                        tenant = channel.tenant_id(),
                        client = channel.client_id(),
                        error = %e,
                        "send failed during broadcast"
                    );
                    dead.push(channel);
                }
                Err(_) => {
                    debug!(
                        tenant = channel.tenant_id(),
                        client = channel.client_id(),
                        "send timed out during broadcast"
                    );
                    dead.push(channel);
                }
            }
        }

        for channel in dead {
            self.teardown(&channel, "send failed").await;
        }
        delivered
    }

    /// Send to a single channel; failure triggers teardown. Returns whether
    /// the frame was delivered.
    pub async fn send_to(&self, channel: &Arc<Channel>, frame: &EventFrame) -> bool {
        if channel.is_closed() {
            return false;
        }
        match tokio::time::timeout(self.send_timeout, channel.transport().send(frame)).await {
            Ok(Ok(())) => {
                channel.touch();
                true
            }
            _ => {
                self.teardown(channel, "send failed").await;
                false
            }
        }
    }

    /// Remove the channel from its tenant set and every subscription set,
    /// then close the transport. Safe to call concurrently from the
    /// disconnect path and the liveness sweep; only the first caller acts.
    pub async fn teardown(&self, channel: &Arc<Channel>, reason: &str) {
        let first = channel.mark_closed();
        if first {
            info!(
                tenant = channel.tenant_id(),
                client = channel.client_id(),
                reason,
                "channel teardown"
            );
        }

        // The map purge runs on every call, not just the one that wins the
        // close. A subscribe racing an earlier teardown can land a closed
        // channel back in a subscriber map, and the next delivery pass
        // routes it here again to be swept out.
        if let Some(mut set) = self.tenants.get_mut(channel.tenant_id()) {
            // Only evict our own connection: a reconnect may have already
            // stored a replacement under the same client id.
            let same = set
                .get(channel.client_id())
                .is_some_and(|c| c.conn_id() == channel.conn_id());
            if same {
                set.remove(channel.client_id());
            }
        }
        self.tenants
            .remove_if(channel.tenant_id(), |_, set| set.is_empty());

        for task_id in channel.subscriptions() {
            self.unsubscribe_conn(&task_id, channel.conn_id());
        }

        if first {
            channel.transport().close().await;
        }
    }

    /// One liveness pass: probe channels idle past `liveness_timeout` and
    /// tear down the ones that fail to answer within `probe_timeout`.
    /// Returns the number of channels reaped.
    pub async fn sweep_idle(&self, liveness_timeout: Duration, probe_timeout: Duration) -> usize {
        let snapshot: Vec<Arc<Channel>> = self
            .tenants
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect();

        let mut reaped = 0;
        for channel in snapshot {
            if channel.is_closed() || channel.idle_for() < liveness_timeout {
                continue;
            }
            match tokio::time::timeout(probe_timeout, channel.transport().ping()).await {
                Ok(Ok(())) => channel.touch(),
                _ => {
                    self.teardown(&channel, "liveness probe failed").await;
                    reaped += 1;
                }
            }
        }
        if reaped > 0 {
            info!(reaped, "liveness sweep reaped dead channels");
        }
        reaped
    }

    /// Dispatch one client-sent frame.
    pub async fn handle_client_frame(&self, channel: &Arc<Channel>, frame: ClientFrame) {
        match frame {
            ClientFrame::HeartbeatResponse => channel.touch(),
            ClientFrame::SubscribeTask { task_id } => {
                channel.touch();
                self.subscribe(channel, &task_id);
                let confirm = EventFrame::new(
                    EventKind::SubscriptionConfirmed,
                    json!({ "task_id": task_id }),
                );
                self.send_to(channel, &confirm).await;
            }
            ClientFrame::Unknown => {
                debug!(
                    tenant = channel.tenant_id(),
                    client = channel.client_id(),
                    "ignoring unrecognized client frame"
                );
            }
        }
    }

    pub fn connection_count(&self, tenant_id: &str) -> usize {
        self.tenants.get(tenant_id).map(|set| set.len()).unwrap_or(0)
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.subscriptions
            .get(task_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.tenants.iter().map(|entry| entry.value().len()).sum()
    }

    /// Tear down every channel. Used on shutdown.
    pub async fn close_all(&self) {
        let snapshot: Vec<Arc<Channel>> = self
            .tenants
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect();
        for channel in snapshot {
            self.teardown(&channel, "shutdown").await;
        }
    }
}
