//! Client-side multiplexer for realtime table-change feeds.
//!
//! Many independent consumers subscribe to `(table, filter)` change streams
//! through [`RealtimeMux::subscribe`]. Subscribers with the same pair share one
//! transport connection held by a [`ChannelEntry`]; the entry fans events out
//! to every listener, retries failed connections with bounded backoff, and
//! closes the connection when its last listener leaves.

pub mod config;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod handle;
pub mod key;
pub mod listener;
pub mod metrics;
pub mod mux;
pub mod reconnect;
pub mod registry;
pub mod telemetry;

pub use config::MuxConfig;
pub use dispatch::{DispatchReport, dispatch};
pub use entry::ChannelEntry;
pub use error::{MuxError, MuxResult};
pub use handle::SubscriptionHandle;
pub use key::ChannelKey;
pub use listener::{ChangeCallback, ConnectionStatus, Listener, ListenerCallbacks, SubscriberId};
pub use mux::{RealtimeMux, SubscribeOptions};
pub use reconnect::{ReconnectPolicy, ReconnectSnapshot};
pub use registry::SubscriptionRegistry;
