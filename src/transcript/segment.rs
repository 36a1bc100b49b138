//! Segment normalization and identity

use crate::protocol::WireSegment;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Speaker name used when the wire segment carries none
const UNKNOWN_SPEAKER: &str = "Unknown";

/// Identity key for a segment: its absolute start time.
///
/// The absolute clock is the source of truth; segments lacking it are
/// excluded from reconciliation entirely rather than keyed on a
/// meeting-relative fallback.
pub(crate) type SegmentKey = DateTime<Utc>;

/// One utterance fragment with normalized text
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    /// Trimmed, whitespace-collapsed utterance text
    pub text: String,
    /// Speaker name, "Unknown" when the source omits it
    pub speaker: String,
    /// Absolute start timestamp, doubles as the identity key
    pub start_time: SegmentKey,
    /// Absolute end timestamp, if reported
    pub end_time: Option<DateTime<Utc>>,
    /// Revision timestamp, if reported
    pub updated_at: Option<DateTime<Utc>>,
}

impl Segment {
    /// Normalize a wire segment.
    ///
    /// Returns None when the segment has no text field or no parseable
    /// absolute start time; such segments are excluded from
    /// reconciliation, never treated as fatal.
    pub(crate) fn from_wire(raw: &WireSegment) -> Option<Self> {
        let text = match &raw.text {
            Some(text) => normalize_text(text),
            None => {
                debug!("Dropping segment without text");
                return None;
            }
        };

        let start_time = match raw.absolute_start_time.as_deref().and_then(parse_timestamp) {
            Some(ts) => ts,
            None => {
                debug!("Dropping segment without absolute start time");
                return None;
            }
        };

        let speaker = raw
            .speaker
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_SPEAKER)
            .to_string();

        Some(Self {
            text,
            speaker,
            start_time,
            end_time: raw.absolute_end_time.as_deref().and_then(parse_timestamp),
            updated_at: raw.updated_at.as_deref().and_then(parse_timestamp),
        })
    }

    /// The segment's identity key
    pub(crate) fn key(&self) -> SegmentKey {
        self.start_time
    }
}

/// Trim and collapse internal whitespace runs to single spaces
pub(crate) fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse an RFC 3339 timestamp into UTC
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(
        text: Option<&str>,
        speaker: Option<&str>,
        start: Option<&str>,
    ) -> WireSegment {
        WireSegment {
            text: text.map(String::from),
            speaker: speaker.map(String::from),
            absolute_start_time: start.map(String::from),
            absolute_end_time: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_normalize_text_collapses_whitespace() {
        assert_eq!(normalize_text("  hello   world "), "hello world");
        assert_eq!(normalize_text("a\t b\n\nc"), "a b c");
        assert_eq!(normalize_text("   "), "");
        assert_eq!(normalize_text("plain"), "plain");
    }

    #[test]
    fn test_from_wire_normalizes() {
        let seg = Segment::from_wire(&wire(
            Some("  hello   world "),
            Some("Ana"),
            Some("2025-03-01T10:00:00Z"),
        ))
        .unwrap();
        assert_eq!(seg.text, "hello world");
        assert_eq!(seg.speaker, "Ana");
    }

    #[test]
    fn test_from_wire_missing_text_excluded() {
        assert!(Segment::from_wire(&wire(None, Some("Ana"), Some("2025-03-01T10:00:00Z"))).is_none());
    }

    #[test]
    fn test_from_wire_missing_start_time_excluded() {
        assert!(Segment::from_wire(&wire(Some("hello"), None, None)).is_none());
    }

    #[test]
    fn test_from_wire_unparseable_start_time_excluded() {
        assert!(Segment::from_wire(&wire(Some("hello"), None, Some("12.5"))).is_none());
    }

    #[test]
    fn test_from_wire_default_speaker() {
        let seg =
            Segment::from_wire(&wire(Some("hi"), None, Some("2025-03-01T10:00:00Z"))).unwrap();
        assert_eq!(seg.speaker, "Unknown");

        let seg =
            Segment::from_wire(&wire(Some("hi"), Some("  "), Some("2025-03-01T10:00:00Z")))
                .unwrap();
        assert_eq!(seg.speaker, "Unknown");
    }

    #[test]
    fn test_from_wire_empty_text_kept() {
        // Empty normalized text stays in the sequence; grouping skips it
        let seg =
            Segment::from_wire(&wire(Some("   "), None, Some("2025-03-01T10:00:00Z"))).unwrap();
        assert_eq!(seg.text, "");
    }

    #[test]
    fn test_from_wire_timezone_offset_normalized_to_utc() {
        let seg = Segment::from_wire(&wire(
            Some("hi"),
            None,
            Some("2025-03-01T12:00:00+02:00"),
        ))
        .unwrap();
        assert_eq!(
            seg.start_time,
            "2025-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }
}
