//! Media collaborator contracts.
//!
//! The call core never touches capture devices or network traversal.
//! It acquires opaque stream handles from a [`MediaSource`], drives a
//! black-box [`MediaSession`] through offer/answer negotiation, and
//! receives session notifications (connectivity changes, remote media,
//! locally discovered candidates) as [`MediaEvent`]s posted back by the
//! host. The only thing the core knows about a stream handle is that it
//! must be released on teardown.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::signaling::{Candidate, SessionDescription};

#[derive(Debug, Clone, Error)]
pub enum MediaError {
    /// Local media could not be captured. Fatal to the call, no retry.
    #[error("capture failed: {0}")]
    Capture(String),

    /// Offer/answer description exchange failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

/// Capture constraints passed to the media source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::audio()
    }
}

/// Opaque handle to a local or remote media stream.
pub trait MediaStream: Send + Sync {
    fn id(&self) -> &str;

    /// Release the underlying capture/playback resources. Must be safe to
    /// call more than once.
    fn stop(&self);
}

/// Provider of local media streams (microphone/camera acquisition).
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn MediaStream>, MediaError>;
}

/// One peer media session: description exchange, candidate application,
/// teardown. Created per call by a [`MediaFactory`]; connectivity and
/// remote-media notifications flow back through
/// [`CallManager::handle_media_event`](crate::CallManager::handle_media_event).
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(
        &self,
        constraints: MediaConstraints,
    ) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), MediaError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    async fn add_stream(&self, stream: Arc<dyn MediaStream>);

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), MediaError>;

    /// Close the session and release its resources. Must be safe to call
    /// more than once.
    async fn close(&self);
}

pub trait MediaFactory: Send + Sync {
    fn create_session(&self) -> Result<Arc<dyn MediaSession>, MediaError>;
}

/// Connectivity state reported by the media session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl ConnectivityState {
    /// The two connected-equivalent signals are treated identically.
    pub const fn is_established(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

/// Notification posted by the host when the media session reports
/// something the call must react to.
#[derive(Clone)]
pub enum MediaEvent {
    /// The session discovered a local connectivity candidate to signal
    /// to the remote party.
    LocalCandidate(Candidate),
    ConnectivityChanged(ConnectivityState),
    RemoteStreamAdded(Arc<dyn MediaStream>),
    /// The remote stream closed unexpectedly.
    RemoteStreamEnded,
}

impl fmt::Debug for MediaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::ConnectivityChanged(s) => f.debug_tuple("ConnectivityChanged").field(s).finish(),
            Self::RemoteStreamAdded(s) => {
                f.debug_tuple("RemoteStreamAdded").field(&s.id()).finish()
            }
            Self::RemoteStreamEnded => f.write_str("RemoteStreamEnded"),
        }
    }
}
