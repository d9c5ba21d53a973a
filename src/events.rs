//! Owner notifications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::signaling::{CallId, ChannelId};
use crate::state::{CallDirection, CallState, HangupParty, HangupReason};

/// Point-in-time view of a call, handed to observers.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub id: CallId,
    pub channel: ChannelId,
    pub direction: CallDirection,
    pub state: CallState,
    pub hangup_party: Option<HangupParty>,
    pub hangup_reason: Option<HangupReason>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Callback trait for call lifecycle notifications.
///
/// All methods default to no-ops; implement the ones the application
/// cares about. Capture failures and hangups surface exclusively through
/// [`on_call_ended`](Self::on_call_ended) with a machine-readable reason.
#[async_trait]
pub trait CallObserver: Send + Sync {
    /// A remote invite created a new ringing call.
    async fn on_incoming_call(&self, call: CallSnapshot) {
        let _ = call;
    }

    /// A call reached its terminal state. Fired exactly once per call;
    /// suppressed when the call was absorbed by a colliding one (see
    /// [`on_call_replaced`](Self::on_call_replaced)).
    async fn on_call_ended(&self, call: CallSnapshot) {
        let _ = call;
    }

    /// A colliding invite superseded an in-flight call; the session
    /// continues on the replacement.
    async fn on_call_replaced(&self, replaced: CallSnapshot, replacement: CallSnapshot) {
        let _ = (replaced, replacement);
    }
}
