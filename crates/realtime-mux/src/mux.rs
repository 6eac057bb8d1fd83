use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use realtime_transport::Transport;
use tokio::runtime::Handle;
use tracing::debug;

use crate::entry::ChannelEntry;
use crate::handle::SubscriptionHandle;
use crate::key::ChannelKey;
use crate::listener::{Listener, ListenerCallbacks, SubscriberId};
use crate::reconnect::ReconnectPolicy;
use crate::registry::SubscriptionRegistry;

/// Parameters of one logical subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub table: String,
    pub filter: Option<String>,
    pub callbacks: ListenerCallbacks,
    pub enabled: bool,
}

impl SubscribeOptions {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            callbacks: ListenerCallbacks::default(),
            enabled: true,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_callbacks(mut self, callbacks: ListenerCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Factory for subscription handles sharing one registry and transport.
pub struct RealtimeMux {
    registry: Arc<SubscriptionRegistry>,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    runtime: Handle,
    next_subscriber: AtomicU64,
}

impl RealtimeMux {
    /// Creates the factory on the current Tokio runtime. Signal pumps and
    /// reconnect timers run there, so handles may later be created or dropped
    /// from threads outside the runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime; use
    /// [`RealtimeMux::create_with_runtime`] there.
    pub fn create(
        registry: Arc<SubscriptionRegistry>,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        Self::create_with_runtime(registry, transport, policy, Handle::current())
    }

    pub fn create_with_runtime(
        registry: Arc<SubscriptionRegistry>,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            transport,
            policy,
            runtime,
            next_subscriber: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Returns a handle for the subscription. When `options.enabled` is set the
    /// handle joins (or opens) the shared channel immediately.
    pub fn subscribe(self: &Arc<Self>, options: SubscribeOptions) -> SubscriptionHandle {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let handle = SubscriptionHandle::new(
            id,
            Arc::clone(self),
            options.table,
            options.filter,
            options.callbacks,
        );
        if options.enabled {
            handle.set_enabled(true);
        }
        handle
    }

    /// Live entry for the pair, if any subscriber currently holds it open.
    pub fn channel(&self, table: &str, filter: Option<&str>) -> Option<Arc<ChannelEntry>> {
        self.registry.resolve(&ChannelKey::new(table, filter))
    }

    pub(crate) fn attach(
        &self,
        key: &ChannelKey,
        table: &str,
        filter: Option<&str>,
        subscriber: SubscriberId,
        listener: Listener,
    ) -> Arc<ChannelEntry> {
        self.registry.transact(|entries| {
            if let Some(existing) = entries.get(key) {
                match existing.add_listener(subscriber, listener.clone()) {
                    Ok(()) => return Arc::clone(existing),
                    Err(err) => {
                        debug!(target = "realtime.mux", key = %key, error = %err, "replacing retired entry");
                    }
                }
            }
            let entry = ChannelEntry::open(
                key.clone(),
                table,
                filter,
                Arc::clone(&self.transport),
                self.policy,
                Arc::downgrade(&self.registry),
                self.runtime.clone(),
                (subscriber, listener),
            );
            entries.insert(key.clone(), Arc::clone(&entry));
            entry
        })
    }

    pub(crate) fn detach(&self, key: &ChannelKey, subscriber: SubscriberId) {
        if let Some(entry) = self.registry.resolve(key) {
            entry.remove_listener(subscriber);
        }
    }
}
