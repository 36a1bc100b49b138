//! Speaker grouping projection
//!
//! Read-only projection of the sequence for display: consecutive segments
//! by the same speaker collapse into one block. Recomputed on every read;
//! holds no state of its own.

use super::state::TranscriptState;
use chrono::{DateTime, Utc};

/// One displayed block of consecutive same-speaker segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SpeakerBlock {
    pub speaker: String,
    /// Member texts joined with single spaces
    pub text: String,
    /// First member's start time
    pub start_time: DateTime<Utc>,
    /// Last member's end time, if reported
    pub end_time: Option<DateTime<Utc>>,
    /// True when any member is still provisional
    pub provisional: bool,
}

/// Group consecutive same-speaker segments into display blocks.
///
/// Segments with empty normalized text are skipped entirely; they are
/// never shown and never split a block.
pub(crate) fn group_by_speaker(state: &TranscriptState) -> Vec<SpeakerBlock> {
    let mut blocks: Vec<SpeakerBlock> = Vec::new();

    for segment in state.segments() {
        if segment.text.is_empty() {
            continue;
        }
        let provisional = state.is_mutable(segment.key());

        match blocks.last_mut() {
            Some(block) if block.speaker == segment.speaker => {
                block.text.push(' ');
                block.text.push_str(&segment.text);
                block.end_time = segment.end_time;
                block.provisional |= provisional;
            }
            _ => blocks.push(SpeakerBlock {
                speaker: segment.speaker.clone(),
                text: segment.text.clone(),
                start_time: segment.start_time,
                end_time: segment.end_time,
                provisional,
            }),
        }
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireSegment;
    use chrono::{DateTime, Utc};

    fn ts(raw: &str) -> DateTime<Utc> {
        raw.parse().unwrap()
    }

    fn wire(text: &str, speaker: &str, start: &str, end: Option<&str>) -> WireSegment {
        WireSegment {
            text: Some(text.to_string()),
            speaker: Some(speaker.to_string()),
            absolute_start_time: Some(start.to_string()),
            absolute_end_time: end.map(String::from),
            updated_at: None,
        }
    }

    #[test]
    fn test_consecutive_same_speaker_combine() {
        let mut state = TranscriptState::new();
        state.merge(&[
            wire(
                "hello",
                "Ana",
                "2025-03-01T10:00:00Z",
                Some("2025-03-01T10:00:02Z"),
            ),
            wire(
                "there",
                "Ana",
                "2025-03-01T10:00:03Z",
                Some("2025-03-01T10:00:05Z"),
            ),
        ]);

        let blocks = group_by_speaker(&state);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "hello there");
        assert_eq!(blocks[0].start_time, ts("2025-03-01T10:00:00Z"));
        assert_eq!(blocks[0].end_time, Some(ts("2025-03-01T10:00:05Z")));
    }

    #[test]
    fn test_speaker_change_splits_blocks() {
        let mut state = TranscriptState::new();
        state.merge(&[
            wire("one", "Ana", "2025-03-01T10:00:00Z", None),
            wire("two", "Ben", "2025-03-01T10:00:01Z", None),
            wire("three", "Ana", "2025-03-01T10:00:02Z", None),
        ]);

        let blocks = group_by_speaker(&state);
        let speakers: Vec<&str> = blocks.iter().map(|b| b.speaker.as_str()).collect();
        assert_eq!(speakers, vec!["Ana", "Ben", "Ana"]);
    }

    #[test]
    fn test_empty_text_segments_skipped() {
        let mut state = TranscriptState::new();
        state.merge(&[
            wire("hello", "Ana", "2025-03-01T10:00:00Z", None),
            wire("   ", "Ana", "2025-03-01T10:00:01Z", None),
            wire("again", "Ana", "2025-03-01T10:00:02Z", None),
        ]);

        let blocks = group_by_speaker(&state);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "hello again");
    }

    #[test]
    fn test_provisional_marks_block() {
        let mut state = TranscriptState::new();
        state.apply_finalized(&[wire("done", "Ana", "2025-03-01T10:00:00Z", None)]);
        state.apply_mutable(&[wire("pending", "Ana", "2025-03-01T10:00:01Z", None)]);

        let blocks = group_by_speaker(&state);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].provisional);

        state.apply_finalized(&[wire("pending", "Ana", "2025-03-01T10:00:01Z", None)]);
        let blocks = group_by_speaker(&state);
        assert!(!blocks[0].provisional);
    }

    #[test]
    fn test_projection_is_pure() {
        let mut state = TranscriptState::new();
        state.merge(&[wire("hello", "Ana", "2025-03-01T10:00:00Z", None)]);

        let first = group_by_speaker(&state);
        let second = group_by_speaker(&state);
        assert_eq!(first, second);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_empty_state_groups_to_nothing() {
        let state = TranscriptState::new();
        assert!(group_by_speaker(&state).is_empty());
    }
}
