use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use relay_core::ServerEvent;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique connection identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, waiting for its `init` snapshot.
    Connecting,
    /// Receives broadcasts.
    Open,
    Closed,
}

/// A registered connection. Outbound frames go through a bounded queue
/// drained by the session's writer task.
pub struct Connection {
    pub id: ClientId,
    tx: mpsc::Sender<Arc<str>>,
    state: Mutex<ConnectionState>,
    /// Last pong, or registration time before the first one.
    last_pong: Mutex<Instant>,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    fn new(id: ClientId, tx: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id,
            tx,
            state: Mutex::new(ConnectionState::Connecting),
            last_pong: Mutex::new(Instant::now()),
            connected_at: Utc::now(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }
}

/// Result of queueing one frame for one connection.
#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Queued,
    Skipped,
    /// Queue full or closed; the connection must be dropped.
    Failed,
}

fn deliver(conn: &Connection, frame: &Arc<str>) -> Delivery {
    match conn.tx.try_send(Arc::clone(frame)) {
        Ok(()) => Delivery::Queued,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(client_id = %conn.id, "send queue full, dropping connection");
            Delivery::Failed
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!(client_id = %conn.id, "send queue closed, dropping connection");
            Delivery::Failed
        }
    }
}

/// Whether the connection that submitted an event also receives its
/// broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BroadcastPolicy {
    #[default]
    EchoToSender,
    ExcludeSender,
}

impl BroadcastPolicy {
    pub fn from_echo(echo_to_sender: bool) -> Self {
        if echo_to_sender {
            Self::EchoToSender
        } else {
            Self::ExcludeSender
        }
    }

    /// Connection to leave out of a broadcast caused by `origin`.
    pub fn exclusion<'a>(&self, origin: &'a ClientId) -> Option<&'a ClientId> {
        match self {
            Self::EchoToSender => None,
            Self::ExcludeSender => Some(origin),
        }
    }
}

/// Registry of all live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ClientId, Connection>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a new connection in the `Connecting` state and return its
    /// id plus the receiving end of its outbound queue.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<Arc<str>>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.connections
            .insert(id.clone(), Connection::new(id.clone(), tx));
        (id, rx)
    }

    /// Remove a connection. Dropping its sender ends the writer task.
    /// Returns false when it was already gone.
    pub fn unregister(&self, id: &ClientId) -> bool {
        match self.connections.remove(id) {
            Some((_, conn)) => {
                conn.set_state(ConnectionState::Closed);
                true
            }
            None => false,
        }
    }

    /// Move a connection from `Connecting` to `Open`.
    pub fn mark_open(&self, id: &ClientId) -> bool {
        match self.connections.get(id) {
            Some(conn) if conn.state() == ConnectionState::Connecting => {
                conn.set_state(ConnectionState::Open);
                true
            }
            _ => false,
        }
    }

    pub fn state_of(&self, id: &ClientId) -> Option<ConnectionState> {
        self.connections.get(id).map(|conn| conn.state())
    }

    /// Note a pong from `id`.
    pub fn record_pong(&self, id: &ClientId) -> bool {
        match self.connections.get(id) {
            Some(conn) => {
                *conn.last_pong.lock() = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Time since `id` last answered a ping, `None` once it is gone.
    pub fn idle_for(&self, id: &ClientId) -> Option<Duration> {
        self.connections.get(id).map(|conn| conn.last_pong_elapsed())
    }

    /// Whether `id` is still registered and answered a ping within `timeout`.
    pub fn is_alive(&self, id: &ClientId, timeout: Duration) -> bool {
        self.idle_for(id).is_some_and(|idle| idle <= timeout)
    }

    /// Queue one event for a single connection that is not closed.
    pub fn send_to(&self, id: &ClientId, event: &ServerEvent) -> bool {
        let frame: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!(event_type = event.event_type(), error = %e, "failed to serialize event");
                return false;
            }
        };

        let delivery = match self.connections.get(id) {
            Some(conn) if conn.state() != ConnectionState::Closed => deliver(&conn, &frame),
            _ => Delivery::Skipped,
        };
        if delivery == Delivery::Failed {
            self.unregister(id);
        }
        delivery == Delivery::Queued
    }

    /// Queue one event for every `Open` connection except `exclude`.
    /// The event is serialized once. Returns the number of connections
    /// that received it.
    pub fn broadcast(&self, event: &ServerEvent, exclude: Option<&ClientId>) -> usize {
        let frame: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!(event_type = event.event_type(), error = %e, "failed to serialize event");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for entry in self.connections.iter() {
            let conn = entry.value();
            if Some(&conn.id) == exclude || conn.state() != ConnectionState::Open {
                continue;
            }
            match deliver(conn, &frame) {
                Delivery::Queued => delivered += 1,
                Delivery::Failed => failed.push(conn.id.clone()),
                Delivery::Skipped => {}
            }
        }

        for id in &failed {
            self.unregister(id);
        }
        delivered
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections receiving broadcasts.
    pub fn open_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().state() == ConnectionState::Open)
            .count()
    }
}
