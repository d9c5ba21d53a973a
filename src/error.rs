//! Call-related error types.

use thiserror::Error;

use crate::media::MediaError;
use crate::signaling::{CallId, ChannelId, SignalParseError};
use crate::state::CallState;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(CallId),

    #[error("channel {0} already has a call in progress")]
    ChannelBusy(ChannelId),

    #[error("call cannot be answered in state {0:?}")]
    NotAnswerable(CallState),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Parse(#[from] SignalParseError),
}

/// Failure reported by the external signaling transport for a single
/// send attempt. Delivery is recovered locally via bounded retry;
/// exhaustion is tolerated, never escalated to call failure.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Send(String),

    #[error("transport closed")]
    Closed,
}
