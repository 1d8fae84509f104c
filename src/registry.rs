//! Live connection bookkeeping for one role (clients or workers).
//!
//! The registry is the sole owner of connection records. Everything else
//! refers to a connection by [`ConnectionId`] and goes through the accessors
//! below; listings are snapshots and may be stale by the time they are used.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Worker,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection lifecycle. A record that has left the registry is
/// `Closed` by definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Registered,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Models a worker advertised at registration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub worker_id: String,
    pub models: Vec<String>,
    pub default_model: Option<String>,
}

impl Capabilities {
    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model) || self.default_model.as_deref() == Some(model)
    }
}

/// Frames queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Write side of one connection. Open for as long as its writer task holds
/// the receiver.
#[derive(Debug, Clone)]
pub struct OutboundHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl OutboundHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Serialize and queue a frame. Returns false if the writer is gone.
    pub fn send_json<T: Serialize>(&self, msg: &T) -> bool {
        match serde_json::to_string(msg) {
            Ok(text) => self.tx.send(Outbound::Text(text)).is_ok(),
            Err(error) => {
                tracing::warn!(target = "clipboard_relay::registry", error = %error, "failed to encode outbound frame");
                false
            }
        }
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub role: Role,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub capabilities: Option<Capabilities>,
    pub bound_model: Option<String>,
    pub draining: bool,
    pub in_flight: usize,
    /// Registration order, used for deterministic tie-breaks.
    pub seq: u64,
    pub outbound: OutboundHandle,
}

impl ConnectionRecord {
    pub fn is_open(&self) -> bool {
        self.outbound.is_open()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

struct RegistryInner {
    records: HashMap<ConnectionId, ConnectionRecord>,
    next_seq: u64,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    role: Role,
    inner: Arc<Mutex<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            inner: Arc::new(Mutex::new(RegistryInner {
                records: HashMap::new(),
                next_seq: 0,
            })),
        }
    }

    pub fn register(
        &self,
        outbound: OutboundHandle,
        capabilities: Option<Capabilities>,
    ) -> ConnectionId {
        let id = ConnectionId::new();
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.records.insert(
            id,
            ConnectionRecord {
                id,
                role: self.role,
                state: ConnectionState::Connecting,
                connected_at: Utc::now(),
                last_activity: Instant::now(),
                capabilities,
                bound_model: None,
                draining: false,
                in_flight: 0,
                seq,
                outbound,
            },
        );
        id
    }

    pub fn touch(&self, id: &ConnectionId) {
        self.touch_at(id, Instant::now());
    }

    pub fn touch_at(&self, id: &ConnectionId, now: Instant) {
        if let Some(record) = self.inner.lock().records.get_mut(id) {
            record.last_activity = now;
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionRecord> {
        self.inner.lock().records.get(id).cloned()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.lock().records.contains_key(id)
    }

    /// Snapshot of every record, in registration order.
    pub fn list(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<ConnectionRecord> =
            self.inner.lock().records.values().cloned().collect();
        records.sort_by_key(|record| record.seq);
        records
    }

    /// Deletes the record and hands it back. Removing twice is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionRecord> {
        self.inner.lock().records.remove(id).map(|mut record| {
            record.state = ConnectionState::Closed;
            record
        })
    }

    pub fn set_capabilities(&self, id: &ConnectionId, capabilities: Capabilities) -> bool {
        self.update(id, |record| record.capabilities = Some(capabilities))
    }

    pub fn bind_model(&self, id: &ConnectionId, model: String) -> bool {
        self.update(id, |record| record.bound_model = Some(model))
    }

    pub fn set_state(&self, id: &ConnectionId, state: ConnectionState) -> bool {
        self.update(id, |record| record.state = state)
    }

    pub fn mark_draining(&self, id: &ConnectionId) -> bool {
        self.update(id, |record| record.draining = true)
    }

    pub fn adjust_in_flight(&self, id: &ConnectionId, delta: isize) {
        self.update(id, |record| {
            record.in_flight = record.in_flight.saturating_add_signed(delta);
        });
    }

    /// Queue a message for the connection. False when it is unknown or its
    /// writer has gone away.
    pub fn send<T: Serialize>(&self, id: &ConnectionId, msg: &T) -> bool {
        let outbound = self
            .inner
            .lock()
            .records
            .get(id)
            .map(|record| record.outbound.clone());
        outbound.is_some_and(|outbound| outbound.send_json(msg))
    }

    /// Ids of connections whose last activity is older than `threshold`.
    pub fn idle_since(&self, threshold: Duration, now: Instant) -> Vec<ConnectionId> {
        let inner = self.inner.lock();
        let mut idle: Vec<&ConnectionRecord> = inner
            .records
            .values()
            .filter(|record| record.idle_for(now) > threshold)
            .collect();
        idle.sort_by_key(|record| record.seq);
        idle.into_iter().map(|record| record.id).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    fn update(&self, id: &ConnectionId, f: impl FnOnce(&mut ConnectionRecord)) -> bool {
        match self.inner.lock().records.get_mut(id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }
}
