use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::debug;

use crate::key::ChannelKey;
use crate::listener::{CallbackCell, ConnectionStatus, Listener, ListenerCallbacks, SubscriberId};
use crate::mux::RealtimeMux;

/// Caller-owned side of one logical subscription.
///
/// The handle keeps its subscriber id and callback cell for its whole life;
/// enabling and disabling only attach or detach that listener from the shared
/// channel. Dropping the handle disables it.
pub struct SubscriptionHandle {
    id: SubscriberId,
    key: ChannelKey,
    table: String,
    filter: Option<String>,
    mux: Arc<RealtimeMux>,
    callbacks: CallbackCell,
    status: Arc<watch::Sender<ConnectionStatus>>,
    enabled: Mutex<bool>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        id: SubscriberId,
        mux: Arc<RealtimeMux>,
        table: String,
        filter: Option<String>,
        callbacks: ListenerCallbacks,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            id,
            key: ChannelKey::new(&table, filter.as_deref()),
            table,
            filter,
            mux,
            callbacks: Arc::new(RwLock::new(callbacks)),
            status: Arc::new(status),
            enabled: Mutex::new(false),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    /// Swaps the callbacks in place. The shared channel is left untouched.
    pub fn set_callbacks(&self, callbacks: ListenerCallbacks) {
        *self.callbacks.write() = callbacks;
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut current = self.enabled.lock();
        if *current == enabled {
            return;
        }
        *current = enabled;
        let listener = Listener::new(Arc::clone(&self.callbacks), Arc::clone(&self.status));
        if enabled {
            listener.publish_status(ConnectionStatus::Connecting);
            self.mux.attach(
                &self.key,
                &self.table,
                self.filter.as_deref(),
                self.id,
                listener,
            );
            debug!(target = "realtime.handle", subscriber = %self.id, key = %self.key, "subscription enabled");
        } else {
            self.mux.detach(&self.key, self.id);
            listener.publish_status(ConnectionStatus::Disconnected);
            debug!(target = "realtime.handle", subscriber = %self.id, key = %self.key, "subscription disabled");
        }
    }

    /// Same as `set_enabled(false)`; safe to call any number of times.
    pub fn unsubscribe(&self) {
        self.set_enabled(false);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
