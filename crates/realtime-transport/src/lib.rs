//! Transport primitives for realtime table-change feeds.
//!
//! A [`Transport`] opens one [`Connection`] per `(table, filter)` request. Each
//! connection reports its lifecycle and the row changes it observes on a single
//! ordered [`TransportSignal`] stream, so status transitions and change events
//! never overtake each other.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        };
        f.write_str(label)
    }
}

/// A single row change observed on a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub payload: serde_json::Value,
}

/// Lifecycle values reported by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Status(TransportStatus),
    Change(ChangeEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connection closed")]
    Closed,
    #[error("failed to open connection: {0}")]
    Open(String),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

pub type TransportResult<T> = Result<T, TransportError>;

pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;
    /// Stops the connection. Calling it again is a no-op.
    fn close(&self);
}

/// A freshly opened connection together with its signal stream.
pub struct OpenedConnection {
    pub connection: Arc<dyn Connection>,
    pub signals: mpsc::UnboundedReceiver<TransportSignal>,
}

pub trait Transport: Send + Sync {
    /// Opens a connection for `table`, optionally narrowed by `filter`.
    ///
    /// Returning `Ok` only means the request was issued; the connection is live
    /// once it reports [`TransportStatus::Subscribed`].
    fn open(&self, table: &str, filter: Option<&str>) -> TransportResult<OpenedConnection>;
}

struct LocalSlot {
    table: String,
    filter: Option<String>,
    sender: mpsc::UnboundedSender<TransportSignal>,
}

#[derive(Default)]
struct LocalState {
    live: HashMap<ConnectionId, LocalSlot>,
    opened: Vec<(ConnectionId, String, Option<String>)>,
    closes: usize,
    fail_next_opens: usize,
}

#[derive(Default)]
struct LocalInner {
    next_id: AtomicU64,
    state: Mutex<LocalState>,
}

impl LocalInner {
    fn close(&self, id: ConnectionId) {
        let mut guard = self.state.lock();
        if guard.live.remove(&id).is_some() {
            guard.closes += 1;
            debug!(target = "realtime.transport", connection_id = %id, "local connection closed");
        }
    }
}

struct LocalConnection {
    id: ConnectionId,
    inner: Arc<LocalInner>,
}

impl Connection for LocalConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn close(&self) {
        self.inner.close(self.id);
    }
}

/// In-memory transport for tests and non-network contexts.
///
/// Cloning yields another handle onto the same set of connections, so a test
/// can keep one clone to drive signals while the multiplexer owns another.
#[derive(Clone, Default)]
pub struct LocalTransport {
    inner: Arc<LocalInner>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to [`Transport::open`] fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.inner.state.lock().fail_next_opens = count;
    }

    pub fn open_count(&self) -> usize {
        self.inner.state.lock().opened.len()
    }

    pub fn opens_for(&self, table: &str, filter: Option<&str>) -> usize {
        self.inner
            .state
            .lock()
            .opened
            .iter()
            .filter(|(_, t, f)| t == table && f.as_deref() == filter)
            .count()
    }

    pub fn close_count(&self) -> usize {
        self.inner.state.lock().closes
    }

    pub fn live_connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.inner.state.lock().live.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.inner.state.lock().live.contains_key(&id)
    }

    /// Most recently opened connection for the pair that is still live.
    pub fn latest_connection(&self, table: &str, filter: Option<&str>) -> Option<ConnectionId> {
        let guard = self.inner.state.lock();
        guard
            .opened
            .iter()
            .rev()
            .find(|(id, t, f)| t == table && f.as_deref() == filter && guard.live.contains_key(id))
            .map(|(id, _, _)| *id)
    }

    pub fn emit(&self, id: ConnectionId, signal: TransportSignal) -> TransportResult<()> {
        let guard = self.inner.state.lock();
        let slot = guard
            .live
            .get(&id)
            .ok_or(TransportError::UnknownConnection(id))?;
        slot.sender.send(signal).map_err(|_| TransportError::Closed)
    }

    pub fn emit_status(&self, id: ConnectionId, status: TransportStatus) -> TransportResult<()> {
        self.emit(id, TransportSignal::Status(status))
    }

    pub fn acknowledge(&self, id: ConnectionId) -> TransportResult<()> {
        self.emit_status(id, TransportStatus::Subscribed)
    }

    pub fn emit_change(
        &self,
        id: ConnectionId,
        kind: ChangeKind,
        payload: serde_json::Value,
    ) -> TransportResult<()> {
        let table = {
            let guard = self.inner.state.lock();
            let slot = guard
                .live
                .get(&id)
                .ok_or(TransportError::UnknownConnection(id))?;
            slot.table.clone()
        };
        self.emit(
            id,
            TransportSignal::Change(ChangeEvent {
                kind,
                table,
                payload,
            }),
        )
    }

    /// Simulates the remote end going away: the connection's signal stream
    /// ends without a `Closed` status. Not counted as a close.
    pub fn drop_stream(&self, id: ConnectionId) -> TransportResult<()> {
        let mut guard = self.inner.state.lock();
        if guard.live.remove(&id).is_none() {
            return Err(TransportError::UnknownConnection(id));
        }
        debug!(target = "realtime.transport", connection_id = %id, "local stream dropped");
        Ok(())
    }

    /// Table and filter a live connection was opened with.
    pub fn describe(&self, id: ConnectionId) -> Option<(String, Option<String>)> {
        let guard = self.inner.state.lock();
        guard
            .live
            .get(&id)
            .map(|slot| (slot.table.clone(), slot.filter.clone()))
    }
}

impl Transport for LocalTransport {
    fn open(&self, table: &str, filter: Option<&str>) -> TransportResult<OpenedConnection> {
        let mut guard = self.inner.state.lock();
        if guard.fail_next_opens > 0 {
            guard.fail_next_opens -= 1;
            return Err(TransportError::Open(format!(
                "local transport refused {table}"
            )));
        }
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, signals) = mpsc::unbounded_channel();
        guard.live.insert(
            id,
            LocalSlot {
                table: table.to_string(),
                filter: filter.map(str::to_string),
                sender,
            },
        );
        guard
            .opened
            .push((id, table.to_string(), filter.map(str::to_string)));
        drop(guard);
        debug!(target = "realtime.transport", connection_id = %id, table, ?filter, "local connection opened");
        Ok(OpenedConnection {
            connection: Arc::new(LocalConnection {
                id,
                inner: Arc::clone(&self.inner),
            }),
            signals,
        })
    }
}
