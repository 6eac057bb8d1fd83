use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use realtime_transport::{ChangeEvent, ChangeKind};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Stable identity of one logical subscriber, independent of its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync>;

/// Per-kind callbacks of a subscriber. Any of them may be absent.
#[derive(Clone, Default)]
pub struct ListenerCallbacks {
    pub on_insert: Option<ChangeCallback>,
    pub on_update: Option<ChangeCallback>,
    pub on_delete: Option<ChangeCallback>,
}

impl ListenerCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_insert = Some(Arc::new(callback));
        self
    }

    pub fn on_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(callback));
        self
    }

    pub fn on_delete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_delete = Some(Arc::new(callback));
        self
    }

    pub fn for_kind(&self, kind: ChangeKind) -> Option<&ChangeCallback> {
        match kind {
            ChangeKind::Insert => self.on_insert.as_ref(),
            ChangeKind::Update => self.on_update.as_ref(),
            ChangeKind::Delete => self.on_delete.as_ref(),
        }
    }
}

impl fmt::Debug for ListenerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerCallbacks")
            .field("on_insert", &self.on_insert.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .finish()
    }
}

/// Shared, mutable callback slot. The owning handle swaps the contents in
/// place; channel entries only ever read through it.
pub type CallbackCell = Arc<RwLock<ListenerCallbacks>>;

/// What a channel entry keeps per subscriber.
#[derive(Clone)]
pub struct Listener {
    callbacks: CallbackCell,
    status: Arc<watch::Sender<ConnectionStatus>>,
}

impl Listener {
    pub fn new(callbacks: CallbackCell, status: Arc<watch::Sender<ConnectionStatus>>) -> Self {
        Self { callbacks, status }
    }

    /// Listener with its own status channel, for callers that do not track status.
    pub fn detached(callbacks: ListenerCallbacks) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        Self::new(Arc::new(RwLock::new(callbacks)), Arc::new(status))
    }

    pub fn callback_for(&self, kind: ChangeKind) -> Option<ChangeCallback> {
        self.callbacks.read().for_kind(kind).cloned()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub(crate) fn publish_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: ChangeKind) -> ChangeEvent {
        ChangeEvent {
            kind,
            table: "tickets".into(),
            payload: serde_json::json!({"id": "T-1"}),
        }
    }

    #[test]
    fn selects_callback_by_kind() {
        let callbacks = ListenerCallbacks::new()
            .on_insert(|_| Ok(()))
            .on_delete(|_| anyhow::bail!("delete rejected"));
        assert!(callbacks.for_kind(ChangeKind::Insert).is_some());
        assert!(callbacks.for_kind(ChangeKind::Update).is_none());
        let on_delete = callbacks.for_kind(ChangeKind::Delete).expect("delete set");
        assert!(on_delete(&event(ChangeKind::Delete)).is_err());
        assert_eq!(
            format!("{callbacks:?}"),
            "ListenerCallbacks { on_insert: true, on_update: false, on_delete: true }"
        );
    }

    #[test]
    fn cell_swap_is_visible_to_listener() {
        let cell: CallbackCell = Arc::new(RwLock::new(ListenerCallbacks::new()));
        let (tx, _rx) = watch::channel(ConnectionStatus::Connecting);
        let listener = Listener::new(cell.clone(), Arc::new(tx));
        assert!(listener.callback_for(ChangeKind::Update).is_none());

        *cell.write() = ListenerCallbacks::new().on_update(|_| Ok(()));
        assert!(listener.callback_for(ChangeKind::Update).is_some());
    }

    #[test]
    fn status_updates_only_notify_on_change() {
        let listener = Listener::detached(ListenerCallbacks::new());
        let mut rx = listener.status.subscribe();
        listener.publish_status(ConnectionStatus::Connecting);
        assert!(!rx.has_changed().expect("sender alive"));
        listener.publish_status(ConnectionStatus::Connected);
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Connected);
        assert_eq!(listener.status(), ConnectionStatus::Connected);
    }
}
