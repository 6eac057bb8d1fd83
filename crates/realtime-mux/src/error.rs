use thiserror::Error;

use crate::key::ChannelKey;

/// Transport failures never show up here; they surface as
/// [`crate::ConnectionStatus`] on the subscription handles.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("channel {0} is already torn down")]
    EntryTornDown(ChannelKey),
}

pub type MuxResult<T> = Result<T, MuxError>;
