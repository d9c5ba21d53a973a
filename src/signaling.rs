//! Wire-level signal type definitions and payloads.
//!
//! Every signal travels over the external transport as a typed message
//! whose payload carries `version` and `call_id` alongside the
//! type-specific fields. The payload encoding is JSON; descriptions and
//! candidates are carried opaquely for the media layer.

use std::fmt;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version stamped on every outbound signal.
pub const PROTOCOL_VERSION: u64 = 0;

/// Opaque unique identifier for a call, stable for the call's lifetime.
///
/// Used as the correlation key on every signaling message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random call id (32 uppercase hex chars).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        let mut id = String::with_capacity(32);
        for b in bytes {
            id.push_str(&format!("{b:02X}"));
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the signaling channel (room) a call is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signal types used for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    /// Initial call offer from caller to callee. Carries the offer
    /// description and the invite's validity window.
    Invite,
    /// Answer from callee to caller, carrying the answer description.
    Answer,
    /// Batch of connectivity discovery candidates, either direction.
    Candidates,
    /// Call teardown notice, either direction.
    Hangup,
}

impl SignalType {
    pub const ALL: [SignalType; 4] = [
        Self::Invite,
        Self::Answer,
        Self::Candidates,
        Self::Hangup,
    ];

    /// Message type string used on the transport.
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Invite => "call.invite",
            Self::Answer => "call.answer",
            Self::Candidates => "call.candidates",
            Self::Hangup => "call.hangup",
        }
    }

    /// Parse from a transport message type string.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "call.invite" => Some(Self::Invite),
            "call.answer" => Some(Self::Answer),
            "call.candidates" => Some(Self::Candidates),
            "call.hangup" => Some(Self::Hangup),
            _ => None,
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}

/// Opaque negotiated description of media capabilities, exchanged as
/// offer/answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

/// A unit of network-reachability information discovered incrementally
/// during connectivity establishment. Candidates are independently
/// applicable, so batches may be split or merged freely in transit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteContent {
    pub call_id: CallId,
    pub offer: SessionDescription,
    /// Validity window of this invite in milliseconds.
    pub lifetime: u64,
}

impl InviteContent {
    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerContent {
    pub call_id: CallId,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatesContent {
    pub call_id: CallId,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HangupContent {
    pub call_id: CallId,
}

/// A fully typed signaling message.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Invite(InviteContent),
    Answer(AnswerContent),
    Candidates(CandidatesContent),
    Hangup(HangupContent),
}

#[derive(Debug, Error)]
pub enum SignalParseError {
    #[error("unknown signal type: {0}")]
    UnknownType(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u64),

    #[error("missing version field")]
    MissingVersion,

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Signal {
    pub fn signal_type(&self) -> SignalType {
        match self {
            Self::Invite(_) => SignalType::Invite,
            Self::Answer(_) => SignalType::Answer,
            Self::Candidates(_) => SignalType::Candidates,
            Self::Hangup(_) => SignalType::Hangup,
        }
    }

    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Invite(c) => &c.call_id,
            Self::Answer(c) => &c.call_id,
            Self::Candidates(c) => &c.call_id,
            Self::Hangup(c) => &c.call_id,
        }
    }

    /// Serialize to the wire payload, stamping the protocol version.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut value = match self {
            Self::Invite(c) => serde_json::to_value(c),
            Self::Answer(c) => serde_json::to_value(c),
            Self::Candidates(c) => serde_json::to_value(c),
            Self::Hangup(c) => serde_json::to_value(c),
        }
        .expect("signal contents serialize to objects");
        value["version"] = serde_json::json!(PROTOCOL_VERSION);
        value
    }

    /// Parse a wire payload of the given type.
    pub fn from_wire(
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<Self, SignalParseError> {
        let signal_type = SignalType::from_event_type(event_type)
            .ok_or_else(|| SignalParseError::UnknownType(event_type.to_string()))?;

        let version = payload
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or(SignalParseError::MissingVersion)?;
        if version != PROTOCOL_VERSION {
            return Err(SignalParseError::UnsupportedVersion(version));
        }

        let signal = match signal_type {
            SignalType::Invite => Self::Invite(serde_json::from_value(payload.clone())?),
            SignalType::Answer => Self::Answer(serde_json::from_value(payload.clone())?),
            SignalType::Candidates => Self::Candidates(serde_json::from_value(payload.clone())?),
            SignalType::Hangup => Self::Hangup(serde_json::from_value(payload.clone())?),
        };
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip() {
        for st in SignalType::ALL {
            let parsed = SignalType::from_event_type(st.event_type()).unwrap();
            assert_eq!(st, parsed, "failed roundtrip for {st:?}");
        }
        assert!(SignalType::from_event_type("call.bogus").is_none());
    }

    #[test]
    fn test_call_id_generate_shape() {
        let id = CallId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));

        let other = CallId::generate();
        assert_ne!(id, other);
    }

    #[test]
    fn test_invite_wire_roundtrip() {
        let invite = Signal::Invite(InviteContent {
            call_id: CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            offer: SessionDescription::offer("v=0\r\no=- 0 0 IN IP4 0.0.0.0"),
            lifetime: 60_000,
        });

        let wire = invite.to_wire();
        assert_eq!(wire["version"], 0);
        assert_eq!(wire["call_id"], "AC90CFD09DF712D981142B172706F9F2");
        assert_eq!(wire["lifetime"], 60_000);
        assert_eq!(wire["offer"]["type"], "offer");

        let parsed = Signal::from_wire("call.invite", &wire).unwrap();
        assert_eq!(parsed, invite);
    }

    #[test]
    fn test_candidates_wire_roundtrip() {
        let signal = Signal::Candidates(CandidatesContent {
            call_id: CallId::new("BC5BD1EDE9BBE601F408EF3795479E93"),
            candidates: vec![
                Candidate {
                    candidate: "candidate:1 1 udp 2130706431 10.0.0.1 54321 typ host".into(),
                    sdp_mid: Some("audio".into()),
                    sdp_mline_index: Some(0),
                },
                Candidate {
                    candidate: "candidate:2 1 udp 1694498815 192.0.2.1 3478 typ srflx".into(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                },
            ],
        });

        let wire = signal.to_wire();
        let parsed = Signal::from_wire("call.candidates", &wire).unwrap();
        assert_eq!(parsed, signal);

        // Absent optional fields stay off the wire entirely.
        assert!(wire["candidates"][1].get("sdpMid").is_none());
    }

    #[test]
    fn test_hangup_wire_shape() {
        let signal = Signal::Hangup(HangupContent {
            call_id: CallId::new("C1"),
        });
        let wire = signal.to_wire();
        assert_eq!(wire["version"], 0);
        assert_eq!(wire["call_id"], "C1");
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut wire = Signal::Hangup(HangupContent {
            call_id: CallId::new("C1"),
        })
        .to_wire();
        wire["version"] = serde_json::json!(7);

        let err = Signal::from_wire("call.hangup", &wire).unwrap_err();
        assert!(matches!(err, SignalParseError::UnsupportedVersion(7)));
    }

    #[test]
    fn test_missing_version_rejected() {
        let wire = serde_json::json!({ "call_id": "C1" });
        let err = Signal::from_wire("call.hangup", &wire).unwrap_err();
        assert!(matches!(err, SignalParseError::MissingVersion));
    }
}
