//! 1:1 audio/video call signaling over room-based message transports.
//!
//! This crate implements the signaling side of a two-party call: the
//! state machine from call creation through media negotiation to
//! termination, reliable delivery of signaling messages over a lossy
//! transport, amalgamation of connectivity candidates into batched
//! messages, and resolution of colliding simultaneous call attempts.
//! Media capture and the actual peer connection are external
//! collaborators behind traits.
//!
//! # Architecture
//!
//! - [`CallManager`]: owns calls, places outbound ones, dispatches
//!   inbound signals and media notifications
//! - [`Call`] & [`CallState`]: per-call state machine and lifecycle
//! - [`SignalType`] & [`Signal`]: the wire-level signaling messages
//!   (invite, answer, candidates, hangup)
//! - [`SignalingTransport`], [`MediaSource`], [`MediaSession`],
//!   [`MediaFactory`]: host-provided collaborator contracts
//! - [`CallObserver`]: lifecycle notifications back to the owner
//!
//! Failed sends are retried with exponential backoff and bounded
//! attempts; candidate bursts are debounced into single messages without
//! ever dropping or duplicating a candidate; a call colliding with an
//! in-flight one for the same channel absorbs its resources instead of
//! failing both.

mod call;
mod candidates;
mod error;
mod events;
mod glare;
mod manager;
mod media;
mod retry;
mod signaling;
mod state;
mod transport;

#[doc(hidden)]
pub mod test_utils;

pub use call::Call;
pub use error::{CallError, TransportError};
pub use events::{CallObserver, CallSnapshot};
pub use manager::{CallManager, CallManagerConfig};
pub use media::{
    ConnectivityState, MediaConstraints, MediaError, MediaEvent, MediaFactory, MediaSession,
    MediaSource, MediaStream,
};
pub use signaling::{
    AnswerContent, CallId, Candidate, CandidatesContent, ChannelId, HangupContent, InviteContent,
    PROTOCOL_VERSION, SessionDescription, Signal, SignalParseError, SignalType,
};
pub use state::{CallDirection, CallState, HangupParty, HangupReason};
