//! One shared transport connection and the listeners multiplexed over it.
//!
//! Every deferred action (signal pump, reconnect timer) re-checks the entry's
//! `cleaning_up` flag and connection generation under the state lock before
//! acting. Aborting the task alone does not cover a callback that is already
//! waiting on the lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use realtime_transport::{
    Connection, ConnectionId, OpenedConnection, Transport, TransportSignal, TransportStatus,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::dispatch;
use crate::error::{MuxError, MuxResult};
use crate::key::ChannelKey;
use crate::listener::{ConnectionStatus, Listener, SubscriberId};
use crate::metrics;
use crate::reconnect::{ReconnectPolicy, ReconnectSnapshot, ReconnectState, RetryDecision};
use crate::registry::SubscriptionRegistry;

struct EntryState {
    listeners: BTreeMap<SubscriberId, Listener>,
    connection: Option<Arc<dyn Connection>>,
    pump: Option<JoinHandle<()>>,
    /// Bumped on every (re)connect; signals from older connections are dropped.
    generation: u64,
    status: ConnectionStatus,
    reconnect: ReconnectState,
    cleaning_up: bool,
}

/// Resources released once teardown has been claimed.
struct Teardown {
    connection: Option<Arc<dyn Connection>>,
    pump: Option<JoinHandle<()>>,
    listeners: BTreeMap<SubscriberId, Listener>,
}

pub struct ChannelEntry {
    key: ChannelKey,
    table: String,
    filter: Option<String>,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    registry: Weak<SubscriptionRegistry>,
    /// Runtime the pump and reconnect timers are spawned on.
    runtime: Handle,
    state: Mutex<EntryState>,
}

impl ChannelEntry {
    /// Creates the entry with its first listener and opens the transport
    /// connection. A failed open is treated like a channel error and retried.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        key: ChannelKey,
        table: &str,
        filter: Option<&str>,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        registry: Weak<SubscriptionRegistry>,
        runtime: Handle,
        first: (SubscriberId, Listener),
    ) -> Arc<Self> {
        let (subscriber, listener) = first;
        let mut listeners = BTreeMap::new();
        listeners.insert(subscriber, listener);
        let entry = Arc::new(Self {
            key,
            table: table.to_string(),
            filter: filter.map(str::to_string),
            transport,
            policy,
            registry,
            runtime,
            state: Mutex::new(EntryState {
                listeners,
                connection: None,
                pump: None,
                generation: 0,
                status: ConnectionStatus::Connecting,
                reconnect: ReconnectState::default(),
                cleaning_up: false,
            }),
        });
        metrics::ACTIVE_CHANNELS.inc();
        {
            let mut state = entry.state.lock();
            entry.connect(&mut state);
        }
        entry
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Registers or replaces a listener. Never reopens a live connection; the
    /// only reconnect it triggers is the reset of an exhausted retry budget.
    pub fn add_listener(self: &Arc<Self>, subscriber: SubscriberId, listener: Listener) -> MuxResult<()> {
        let mut state = self.state.lock();
        if state.cleaning_up {
            return Err(MuxError::EntryTornDown(self.key.clone()));
        }
        listener.publish_status(state.status);
        let replaced = state.listeners.insert(subscriber, listener).is_some();
        debug!(
            target = "realtime.entry",
            key = %self.key,
            subscriber = %subscriber,
            replaced,
            listeners = state.listeners.len(),
            "listener attached"
        );
        if state.reconnect.is_exhausted() {
            info!(
                target = "realtime.entry",
                key = %self.key,
                subscriber = %subscriber,
                "retry budget reset by joining subscriber"
            );
            state.reconnect.reset();
            self.discard_connection(&mut state);
            self.connect(&mut state);
        }
        Ok(())
    }

    /// Removes a listener. Removing the last one tears the entry down. Unknown
    /// subscribers are ignored; returns whether anything was removed.
    pub fn remove_listener(&self, subscriber: SubscriberId) -> bool {
        let teardown = {
            let mut state = self.state.lock();
            if state.listeners.remove(&subscriber).is_none() {
                return false;
            }
            debug!(
                target = "realtime.entry",
                key = %self.key,
                subscriber = %subscriber,
                listeners = state.listeners.len(),
                "listener detached"
            );
            if !state.listeners.is_empty() {
                return true;
            }
            Self::begin_teardown(&mut state)
        };
        if let Some(teardown) = teardown {
            self.finish_teardown(teardown);
        }
        true
    }

    /// Closes the connection, cancels any pending reconnect and leaves the
    /// registry. Only the first call has an effect.
    pub fn teardown(&self) -> bool {
        let teardown = Self::begin_teardown(&mut self.state.lock());
        match teardown {
            Some(teardown) => {
                self.finish_teardown(teardown);
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.lock().cleaning_up
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.state
            .lock()
            .connection
            .as_ref()
            .map(|connection| connection.id())
    }

    pub fn reconnect_snapshot(&self) -> ReconnectSnapshot {
        self.state.lock().reconnect.snapshot()
    }

    fn begin_teardown(state: &mut EntryState) -> Option<Teardown> {
        if state.cleaning_up {
            return None;
        }
        state.cleaning_up = true;
        state.reconnect.cancel();
        Some(Teardown {
            connection: state.connection.take(),
            pump: state.pump.take(),
            listeners: std::mem::take(&mut state.listeners),
        })
    }

    fn finish_teardown(&self, teardown: Teardown) {
        if let Some(pump) = teardown.pump {
            pump.abort();
        }
        if let Some(connection) = teardown.connection {
            connection.close();
        }
        for listener in teardown.listeners.values() {
            listener.publish_status(ConnectionStatus::Disconnected);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_entry(&self.key, self);
        }
        metrics::CHANNELS_CLOSED.inc();
        metrics::ACTIVE_CHANNELS.dec();
        info!(target = "realtime.entry", key = %self.key, "channel torn down");
    }

    fn connect(self: &Arc<Self>, state: &mut EntryState) {
        state.generation += 1;
        let generation = state.generation;
        match self.transport.open(&self.table, self.filter.as_deref()) {
            Ok(OpenedConnection {
                connection,
                signals,
            }) => {
                metrics::CHANNELS_OPENED.inc();
                debug!(
                    target = "realtime.entry",
                    key = %self.key,
                    connection_id = %connection.id(),
                    generation,
                    "transport connection opened"
                );
                state.connection = Some(connection);
                state.pump = Some(self.runtime.spawn(Arc::clone(self).pump(generation, signals)));
                Self::set_status(state, ConnectionStatus::Connecting);
            }
            Err(err) => {
                warn!(
                    target = "realtime.entry",
                    key = %self.key,
                    error = %err,
                    "failed to open transport connection"
                );
                Self::set_status(state, ConnectionStatus::Error);
                self.schedule_retry(state, "open_failed");
            }
        }
    }

    fn discard_connection(&self, state: &mut EntryState) {
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        if let Some(connection) = state.connection.take() {
            connection.close();
        }
    }

    async fn pump(self: Arc<Self>, generation: u64, mut signals: mpsc::UnboundedReceiver<TransportSignal>) {
        loop {
            let Some(signal) = signals.recv().await else {
                self.handle_stream_end(generation);
                break;
            };
            let keep_going = match signal {
                TransportSignal::Change(event) => match self.live_listeners(generation) {
                    Some(listeners) => {
                        dispatch::dispatch(&self.key, &listeners, &event, |subscriber| {
                            self.is_attached(generation, subscriber)
                        });
                        true
                    }
                    None => false,
                },
                TransportSignal::Status(status) => self.handle_status(generation, status),
            };
            if !keep_going {
                break;
            }
        }
        trace!(target = "realtime.entry", key = %self.key, generation, "signal pump finished");
    }

    /// Listener snapshot for dispatch, taken under the lock and invoked outside
    /// it so callbacks may unsubscribe. `None` once the generation is stale.
    fn live_listeners(&self, generation: u64) -> Option<Vec<(SubscriberId, Listener)>> {
        let state = self.state.lock();
        if state.cleaning_up || state.generation != generation {
            return None;
        }
        Some(
            state
                .listeners
                .iter()
                .map(|(subscriber, listener)| (*subscriber, listener.clone()))
                .collect(),
        )
    }

    fn is_attached(&self, generation: u64, subscriber: SubscriberId) -> bool {
        let state = self.state.lock();
        !state.cleaning_up && state.generation == generation && state.listeners.contains_key(&subscriber)
    }

    /// The transport dropped the signal stream of a current connection without
    /// reporting `Closed`. Handled as a transport-initiated close unless a
    /// failure status already moved the entry into backoff.
    fn handle_stream_end(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if state.cleaning_up || state.generation != generation {
            return;
        }
        if state.reconnect.is_pending() || state.reconnect.is_exhausted() {
            trace!(target = "realtime.entry", key = %self.key, generation, "signal stream ended during backoff");
            return;
        }
        warn!(target = "realtime.entry", key = %self.key, generation, "signal stream ended without close status");
        self.transport_closed(&mut state);
    }

    fn transport_closed(self: &Arc<Self>, state: &mut EntryState) {
        Self::set_status(state, ConnectionStatus::Disconnected);
        self.schedule_retry(state, "closed");
    }

    fn handle_status(self: &Arc<Self>, generation: u64, status: TransportStatus) -> bool {
        let mut state = self.state.lock();
        if state.cleaning_up || state.generation != generation {
            trace!(
                target = "realtime.entry",
                key = %self.key,
                generation,
                ?status,
                "ignoring status from retired connection"
            );
            return false;
        }
        match status {
            TransportStatus::Subscribed => {
                state.reconnect.on_connected();
                Self::set_status(&mut state, ConnectionStatus::Connected);
                info!(target = "realtime.entry", key = %self.key, generation, "channel subscribed");
            }
            TransportStatus::ChannelError | TransportStatus::TimedOut => {
                let reason = if status == TransportStatus::TimedOut {
                    "timed_out"
                } else {
                    "channel_error"
                };
                warn!(target = "realtime.entry", key = %self.key, generation, reason, "channel failed");
                Self::set_status(&mut state, ConnectionStatus::Error);
                self.schedule_retry(&mut state, reason);
            }
            TransportStatus::Closed => {
                warn!(target = "realtime.entry", key = %self.key, generation, "channel closed by transport");
                self.transport_closed(&mut state);
            }
        }
        true
    }

    fn schedule_retry(self: &Arc<Self>, state: &mut EntryState, reason: &'static str) {
        if state.cleaning_up || state.listeners.is_empty() {
            return;
        }
        match state.reconnect.next_retry(&self.policy) {
            RetryDecision::AlreadyPending => {
                debug!(target = "realtime.entry", key = %self.key, reason, "reconnect already pending");
            }
            RetryDecision::Exhausted { newly } => {
                Self::set_status(state, ConnectionStatus::Error);
                if newly {
                    metrics::RETRY_EXHAUSTED.inc();
                    error!(
                        target = "realtime.entry",
                        key = %self.key,
                        max_attempts = self.policy.max_attempts,
                        "exhausted reconnect attempts"
                    );
                }
            }
            RetryDecision::Schedule { delay, attempt } => {
                metrics::RECONNECTS_SCHEDULED.with_label_values(&[reason]).inc();
                info!(
                    target = "realtime.entry",
                    key = %self.key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason,
                    "scheduling reconnect"
                );
                let generation = state.generation;
                let deadline = Instant::now() + delay;
                let entry = Arc::clone(self);
                let timer = self.runtime.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    entry.fire_reconnect(generation);
                });
                state.reconnect.arm(delay, generation, timer);
            }
        }
    }

    fn fire_reconnect(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if state.cleaning_up || state.generation != generation {
            return;
        }
        if !state.reconnect.take_fired(generation) {
            return;
        }
        info!(
            target = "realtime.entry",
            key = %self.key,
            attempt = state.reconnect.snapshot().attempts,
            listeners = state.listeners.len(),
            "reconnecting channel"
        );
        self.discard_connection(&mut state);
        self.connect(&mut state);
    }

    fn set_status(state: &mut EntryState, status: ConnectionStatus) {
        state.status = status;
        for listener in state.listeners.values() {
            listener.publish_status(status);
        }
    }
}
