use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::entry::ChannelEntry;
use crate::key::ChannelKey;

/// Keyed store of live channel entries; the de-duplication point.
///
/// Lifecycle: build one with [`SubscriptionRegistry::create`] at startup, hand
/// it to every [`crate::RealtimeMux`] that should share channels, and call
/// [`SubscriptionRegistry::dispose_all`] on shutdown. Tests create their own
/// instance for isolation.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<ChannelKey, Arc<ChannelEntry>>>,
}

impl SubscriptionRegistry {
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn resolve(&self, key: &ChannelKey) -> Option<Arc<ChannelEntry>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn put(&self, key: ChannelKey, entry: Arc<ChannelEntry>) {
        self.entries.lock().insert(key, entry);
    }

    pub fn remove(&self, key: &ChannelKey) -> Option<Arc<ChannelEntry>> {
        self.entries.lock().remove(key)
    }

    /// Removes `key` only while it still maps to `entry`, so a retiring entry
    /// never evicts its replacement.
    pub fn remove_entry(&self, key: &ChannelKey, entry: &ChannelEntry) -> bool {
        let mut guard = self.entries.lock();
        let is_same = guard
            .get(key)
            .is_some_and(|stored| std::ptr::eq(Arc::as_ptr(stored), entry));
        if is_same {
            guard.remove(key);
            debug!(target = "realtime.registry", key = %key, remaining = guard.len(), "entry removed");
        }
        is_same
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<_> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Runs `f` with the entry map locked, for lookups that must be atomic with
    /// the insert that follows them.
    pub(crate) fn transact<R>(
        &self,
        f: impl FnOnce(&mut HashMap<ChannelKey, Arc<ChannelEntry>>) -> R,
    ) -> R {
        f(&mut self.entries.lock())
    }

    /// Tears down every entry. Returns how many were live.
    pub fn dispose_all(&self) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            entry.teardown();
        }
        info!(target = "realtime.registry", disposed = count, "registry disposed");
        count
    }
}
