//! Wire types for both signaling legs.
//!
//! The broker leg carries length-delimited protobuf (`SessionDescription`)
//! compatible with the edge's encoder. The viewer leg carries JSON envelopes
//! `{event, id, data}` whose payloads embed SDP and ICE candidates as
//! JSON-encoded strings, mirroring what the browser produces.

use prost::Message;
use serde::{Deserialize, Serialize};

/// Which of the edge device's two video feeds a track belongs to.
///
/// The integer encoding is part of the wire contract: it appears in the
/// protobuf payload, in the viewer-side `meta.track_source` field, and as
/// the last segment of the per-device answer topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum TrackSource {
    Drone = 0,
    Monitor = 1,
}

impl std::fmt::Display for TrackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as i32)
    }
}

/// SDP exchanged with an edge device over the broker.
///
/// Hand-written prost struct; field tags must not change, the edge side
/// encodes the same schema.
#[derive(Clone, PartialEq, Message)]
pub struct SessionDescription {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "TrackSource", tag = "2")]
    pub track_source: i32,
    #[prost(string, tag = "3")]
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(id: impl Into<String>, track_source: TrackSource, sdp: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            track_source: track_source as i32,
            sdp: sdp.into(),
        }
    }

    /// Decode a broker payload. The caller logs and drops on failure.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(payload)
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

/// Correlation metadata carried by every viewer-side event payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub track_source: i32,
}

impl Meta {
    pub fn new(id: impl Into<String>, track_source: TrackSource) -> Self {
        Self {
            id: id.into(),
            track_source: track_source as i32,
        }
    }

    /// The track source, if the integer on the wire names a known variant.
    pub fn source(&self) -> Option<TrackSource> {
        TrackSource::try_from(self.track_source).ok()
    }
}

/// Generic incoming WebSocket frame: `{event, id, data}`.
///
/// `id` is an opaque token chosen by the viewer and echoed back on every
/// reply; `data` stays unparsed until the event kind is known.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Generic outgoing WebSocket frame.
#[derive(Debug, Serialize)]
pub struct OutEnvelope<T: Serialize> {
    pub event: &'static str,
    pub id: String,
    pub data: T,
}

/// `video-offer` / `video-answer` payload. `sdp` is a JSON-encoded
/// `RTCSessionDescription` as produced by the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDescription {
    pub meta: Option<Meta>,
    #[serde(default)]
    pub sdp: String,
}

/// `new-ice-candidate` payload. `candidate` is a JSON-encoded
/// `RTCIceCandidateInit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub meta: Option<Meta>,
    #[serde(default)]
    pub candidate: String,
}

/// `error` payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    pub code: u16,
    pub message: String,
}

/// Stable numeric error codes shared with viewer front-ends.
///
/// The values are part of the wire contract; add at the end, never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    /// Inbound frame unreadable or the connection is broken.
    ReadMessage = 1,
    /// Event payload is not valid JSON for its event kind.
    UnmarshalJson = 2,
    /// Broker payload does not conform to the protobuf schema.
    UnmarshalPayload = 3,
    /// Missing or empty `meta.id`, or unknown `track_source`.
    IncorrectMetadata = 4,
    /// No live session for the requested `(id, track_source)`.
    MetadataNotMatched = 5,
    /// The fan-out peer could not be constructed.
    FailedToCreateSubscriber = 6,
    /// SDP negotiation failed inside the peer engine.
    Negotiation = 7,
    /// A bounded signaling wait expired.
    SignalingTimeout = 8,
    /// A media track could not be attached to a peer connection.
    TrackAttach = 9,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::ReadMessage => "could not read message",
            ErrorCode::UnmarshalJson => "could not unmarshal JSON data",
            ErrorCode::UnmarshalPayload => "could not unmarshal payload",
            ErrorCode::IncorrectMetadata => "incorrect metadata",
            ErrorCode::MetadataNotMatched => "no session matches the given metadata",
            ErrorCode::FailedToCreateSubscriber => "failed to create subscriber",
            ErrorCode::Negotiation => "negotiation failed",
            ErrorCode::SignalingTimeout => "signaling timed out",
            ErrorCode::TrackAttach => "failed to attach media track",
        }
    }

    pub fn to_data(self, meta: Option<Meta>) -> ErrorData {
        ErrorData {
            meta,
            code: self.code(),
            message: self.message().to_owned(),
        }
    }
}

pub const EVENT_VIDEO_OFFER: &str = "video-offer";
pub const EVENT_VIDEO_ANSWER: &str = "video-answer";
pub const EVENT_ICE_CANDIDATE: &str = "new-ice-candidate";
pub const EVENT_ERROR: &str = "error";
