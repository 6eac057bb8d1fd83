//! Fan-out of one change event to every listener of a channel.
//!
//! Each callback runs in isolation: an `Err` or a panic from one listener is
//! logged and counted, and the pass continues with the next listener. A
//! listener detached by an earlier callback of the same pass is not invoked.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use realtime_transport::ChangeEvent;
use tracing::{error, trace, warn};

use crate::key::ChannelKey;
use crate::listener::{Listener, SubscriberId};
use crate::metrics;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Listeners without a callback for the event's kind.
    pub skipped: usize,
    /// Listeners that left the channel before their turn in the pass.
    pub detached: usize,
}

/// Delivers `event` to `listeners` in order. `still_attached` is asked right
/// before each invocation, so unsubscribes made by earlier callbacks apply to
/// the rest of the pass.
pub fn dispatch(
    key: &ChannelKey,
    listeners: &[(SubscriberId, Listener)],
    event: &ChangeEvent,
    still_attached: impl Fn(SubscriberId) -> bool,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    for (subscriber, listener) in listeners {
        if !still_attached(*subscriber) {
            report.detached += 1;
            continue;
        }
        let Some(callback) = listener.callback_for(event.kind) else {
            report.skipped += 1;
            continue;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
            Ok(Ok(())) => report.delivered += 1,
            Ok(Err(err)) => {
                report.failed += 1;
                metrics::LISTENER_FAILURES.with_label_values(&["error"]).inc();
                warn!(
                    target = "realtime.dispatch",
                    key = %key,
                    subscriber = %subscriber,
                    kind = %event.kind,
                    error = %err,
                    "listener callback failed"
                );
            }
            Err(payload) => {
                report.failed += 1;
                metrics::LISTENER_FAILURES.with_label_values(&["panic"]).inc();
                error!(
                    target = "realtime.dispatch",
                    key = %key,
                    subscriber = %subscriber,
                    kind = %event.kind,
                    panic = %panic_message(payload.as_ref()),
                    "listener callback panicked"
                );
            }
        }
    }
    let kind = event.kind.to_string();
    metrics::EVENTS_DISPATCHED
        .with_label_values(&[kind.as_str()])
        .inc();
    trace!(
        target = "realtime.dispatch",
        key = %key,
        delivered = report.delivered,
        failed = report.failed,
        skipped = report.skipped,
        detached = report.detached,
        "dispatched change event"
    );
    report
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
