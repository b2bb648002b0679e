//! Channels and the transport seam.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::frames::EventFrame;
use crate::{Error, Result};

/// Opaque transport behind a channel.
///
/// Implementations adapt the registry to a concrete wire (a WebSocket
/// session, an in-process queue, a test double). Failures surface as
/// [`Error::Transport`] and are absorbed by the registry, never by
/// broadcast callers.
#[async_trait]
pub trait ChannelTransport: Send + Sync + std::fmt::Debug {
    /// Deliver one frame. The registry bounds this with its send timeout.
    async fn send(&self, frame: &EventFrame) -> Result<()>;

    /// Liveness probe. An error means the peer is gone.
    async fn ping(&self) -> Result<()>;

    /// Close the underlying transport. Must be idempotent.
    async fn close(&self);
}

/// One live duplex connection: a client within a tenant.
///
/// Owned exclusively by the registry; created on handshake, destroyed on
/// disconnect or a failed liveness probe.
#[derive(Debug)]
pub struct Channel {
    tenant_id: String,
    client_id: String,
    /// Distinguishes this channel from a replacement registered under the
    /// same `client_id`, so a late teardown of the old channel cannot evict
    /// the new one.
    conn_id: Uuid,
    transport: Arc<dyn ChannelTransport>,
    last_activity: Mutex<Instant>,
    subscriptions: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl Channel {
    pub(crate) fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        transport: Arc<dyn ChannelTransport>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            conn_id: Uuid::new_v4(),
            transport,
            last_activity: Mutex::new(Instant::now()),
            subscriptions: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub(crate) fn transport(&self) -> &Arc<dyn ChannelTransport> {
        &self.transport
    }

    /// Refresh the activity timestamp (successful send or heartbeat).
    pub fn touch(&self) {
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        let last = self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Instant::now().duration_since(*last)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Returns false if the task was already subscribed.
    pub(crate) fn add_subscription(&self, task_id: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.to_string())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// First caller wins; teardown is idempotent across the disconnect path
    /// and the liveness sweep.
    pub(crate) fn mark_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// In-process [`ChannelTransport`] backed by a tokio mpsc queue.
///
/// Lets embedders (and tests) consume the event stream without a network
/// layer: frames sent to the channel arrive on the paired receiver.
#[derive(Debug)]
pub struct LocalTransport {
    tx: mpsc::Sender<EventFrame>,
    closed: AtomicBool,
}

impl LocalTransport {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<EventFrame>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }
}

#[async_trait]
impl ChannelTransport for LocalTransport {
    async fn send(&self, frame: &EventFrame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::transport("local transport closed"));
        }
        self.tx
            .send(frame.clone())
            .await
            .map_err(|_| Error::transport("local receiver dropped"))
    }

    async fn ping(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.tx.is_closed() {
            return Err(Error::transport("local transport closed"));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
