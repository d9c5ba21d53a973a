//! Call state model.

use serde::Serialize;

/// Lifecycle state of a call.
///
/// Outbound calls walk `Fledgling → WaitLocalMedia → CreateOffer →
/// InviteSent → Connecting → Connected`; inbound calls are born in
/// `Ringing` and walk `WaitLocalMedia → CreateAnswer → Connecting →
/// Connected` once answered. `Ended` is terminal and reachable from every
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Fledgling,
    /// Waiting for local media capture to complete.
    WaitLocalMedia,
    /// Outbound: local media acquired, offer being produced.
    CreateOffer,
    /// Inbound: answered locally, answer being produced.
    CreateAnswer,
    /// Outbound: invite dispatched, waiting for the remote answer.
    InviteSent,
    /// Inbound: invite received, ringing locally.
    Ringing,
    /// Descriptions exchanged, waiting for connectivity.
    Connecting,
    /// Media flowing.
    Connected,
    /// Terminal.
    Ended,
}

impl CallState {
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended)
    }

    /// Whether a local answer action is valid right now.
    pub fn can_answer(&self) -> bool {
        matches!(self, Self::Ringing)
    }

    /// States in which an outbound call has produced (or is producing) a
    /// local offer but has not completed negotiation.
    pub fn mid_offer(&self) -> bool {
        matches!(self, Self::CreateOffer | Self::InviteSent)
    }

    /// Non-terminal, pre-connected: the window in which a colliding call
    /// may supersede this one.
    pub fn mid_negotiation(&self) -> bool {
        matches!(
            self,
            Self::Fledgling
                | Self::WaitLocalMedia
                | Self::CreateOffer
                | Self::CreateAnswer
                | Self::InviteSent
                | Self::Ringing
                | Self::Connecting
        )
    }
}

/// Which side initiated the call. Set once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Which side terminated the call. Set exactly once, at the transition
/// into `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupParty {
    Local,
    Remote,
}

/// Machine-readable reason a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    /// Explicit local hang up.
    UserHangup,
    /// The invite's validity window elapsed with no answer.
    InviteTimeout,
    /// Local media could not be captured.
    CaptureFailure,
    /// Offer/answer negotiation failed.
    NegotiationFailed,
    /// The remote party hung up.
    RemoteHangup,
    /// The remote stream closed unexpectedly.
    RemoteMediaLost,
    /// Superseded by a colliding call for the same channel.
    Replaced,
}

impl HangupReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UserHangup => "user_hangup",
            Self::InviteTimeout => "invite_timeout",
            Self::CaptureFailure => "capture_failure",
            Self::NegotiationFailed => "negotiation_failed",
            Self::RemoteHangup => "remote_hangup",
            Self::RemoteMediaLost => "remote_media_lost",
            Self::Replaced => "replaced",
        }
    }
}

impl std::fmt::Display for HangupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
