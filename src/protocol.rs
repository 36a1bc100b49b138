//! Wire protocol for the meeting event stream
//!
//! Defines the JSON frame format exchanged over the WebSocket connection
//! and the decoder that classifies inbound frames into a closed set of
//! typed events. Malformed or unrecognized frames are logged and dropped;
//! they never terminate the connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{trace, warn};

/// Identifier used to subscribe to a meeting's event stream.
///
/// The server accepts and emits both string and numeric forms, so the
/// decoder normalizes everything to a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeetingRef(pub String);

impl MeetingRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for MeetingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for MeetingRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MeetingRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => MeetingRef(s),
            Raw::Number(n) => MeetingRef(n.to_string()),
        })
    }
}

/// Meeting entry in subscribe/unsubscribe directives
#[derive(Debug, Serialize)]
pub(crate) struct MeetingEntry {
    pub id: MeetingRef,
}

/// Frames sent to the server, discriminated by `action`
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub(crate) enum ClientFrame {
    /// Subscribe to one or more meetings' events
    Subscribe { meetings: Vec<MeetingEntry> },
    /// Unsubscribe from one or more meetings' events
    Unsubscribe { meetings: Vec<MeetingEntry> },
    /// Keepalive probe
    Ping,
}

impl ClientFrame {
    /// Build a subscribe directive for a single meeting
    pub(crate) fn subscribe(meeting: &MeetingRef) -> Self {
        ClientFrame::Subscribe {
            meetings: vec![MeetingEntry {
                id: meeting.clone(),
            }],
        }
    }

    /// Build an unsubscribe directive for a single meeting
    pub(crate) fn unsubscribe(meeting: &MeetingRef) -> Self {
        ClientFrame::Unsubscribe {
            meetings: vec![MeetingEntry {
                id: meeting.clone(),
            }],
        }
    }
}

/// One segment as it appears on the wire.
///
/// Timestamps stay as raw strings here; parsing happens per segment in the
/// reconciler so one bad field excludes that segment, not the whole batch.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireSegment {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub absolute_start_time: Option<String>,
    #[serde(default)]
    pub absolute_end_time: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Meeting reference attached to server events
#[derive(Debug, Deserialize)]
pub(crate) struct MeetingInfo {
    pub id: MeetingRef,
}

/// Payload carrying transcript segments
#[derive(Debug, Default, Deserialize)]
pub(crate) struct SegmentsPayload {
    #[serde(default)]
    pub segments: Vec<WireSegment>,
}

/// Payload carrying a meeting status string
#[derive(Debug, Deserialize)]
pub(crate) struct StatusPayload {
    pub status: String,
}

/// Payload acknowledging a subscription
#[derive(Debug, Default, Deserialize)]
pub(crate) struct MeetingsPayload {
    #[serde(default)]
    pub meetings: Vec<MeetingRef>,
}

/// Payload carrying a server-side error message
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorPayload {
    pub error: String,
}

/// Frames received from the server, discriminated by `type`
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum ServerEvent {
    /// Provisional segments the server may still revise
    #[serde(rename = "transcript.mutable")]
    TranscriptMutable {
        meeting: Option<MeetingInfo>,
        #[serde(default)]
        payload: SegmentsPayload,
    },
    /// Segments the server will not revise further
    #[serde(rename = "transcript.finalized")]
    TranscriptFinalized {
        meeting: Option<MeetingInfo>,
        #[serde(default)]
        payload: SegmentsPayload,
    },
    /// Meeting lifecycle status change
    #[serde(rename = "meeting.status")]
    MeetingStatus {
        meeting: Option<MeetingInfo>,
        payload: StatusPayload,
    },
    /// Acknowledgement of a subscribe directive
    #[serde(rename = "subscribed")]
    Subscribed {
        #[serde(default)]
        payload: MeetingsPayload,
    },
    /// Keepalive acknowledgement
    #[serde(rename = "pong")]
    Pong,
    /// Server-side error report
    #[serde(rename = "error")]
    Error { payload: ErrorPayload },
    /// Catch-all for unrecognized frame types
    #[serde(other)]
    Unknown,
}

/// Decode a raw inbound text frame into a typed event.
///
/// Parse failures and unrecognized `type` fields return None with a
/// diagnostic. One malformed frame must not break the stream.
pub(crate) fn decode_frame(raw: &str) -> Option<ServerEvent> {
    match serde_json::from_str::<ServerEvent>(raw) {
        Ok(ServerEvent::Unknown) => {
            warn!("Unknown server event type, dropping frame");
            trace!("Dropped frame: {}", truncate_for_log(raw));
            None
        }
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Failed to parse server frame: {}", e);
            trace!("Dropped frame: {}", truncate_for_log(raw));
            None
        }
    }
}

/// Cap frame excerpts in diagnostics
fn truncate_for_log(raw: &str) -> &str {
    let max = 256;
    match raw.char_indices().nth(max) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}
