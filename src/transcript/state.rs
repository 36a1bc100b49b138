//! The merge algorithm and provisional-segment bookkeeping

use super::segment::{Segment, SegmentKey};
use crate::protocol::WireSegment;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Authoritative per-meeting transcript state.
///
/// The sequence is a `BTreeMap` keyed by absolute start time, so ordering
/// and at-most-one-segment-per-key hold by construction and iteration is
/// deterministic regardless of batch arrival order.
#[derive(Debug, Default)]
pub(crate) struct TranscriptState {
    segments: BTreeMap<SegmentKey, Segment>,
    /// Keys the server may still revise
    mutable_keys: BTreeSet<SegmentKey>,
    /// Keys inserted or changed by the latest batches, for highlight
    /// rendering; drained by the presentation layer
    recent_keys: BTreeSet<SegmentKey>,
}

impl TranscriptState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fold a batch of wire segments into the sequence.
    ///
    /// Segments without text or an absolute start time are excluded. An
    /// incoming segment replaces the current occupant of its key unless
    /// both carry `updated_at` and the incoming one is strictly older.
    /// Returns the accepted segments' keys, whether or not each one
    /// actually replaced anything.
    pub(crate) fn merge(&mut self, batch: &[WireSegment]) -> Vec<SegmentKey> {
        let accepted: Vec<Segment> = batch.iter().filter_map(Segment::from_wire).collect();

        let dropped = batch.len() - accepted.len();
        if dropped > 0 {
            debug!("Excluded {} segment(s) from reconciliation", dropped);
        }

        let mut keys = Vec::with_capacity(accepted.len());
        for incoming in accepted {
            let key = incoming.key();
            keys.push(key);

            match self.segments.get(&key) {
                Some(existing) if is_stale(&incoming, existing) => {
                    debug!("Discarding stale update for segment at {}", key);
                }
                Some(existing) => {
                    if existing.text != incoming.text {
                        self.recent_keys.insert(key);
                    }
                    self.segments.insert(key, incoming);
                }
                None => {
                    self.recent_keys.insert(key);
                    self.segments.insert(key, incoming);
                }
            }
        }
        keys
    }

    /// Apply a `transcript.mutable` batch: merge, then mark every key in
    /// the batch provisional. An empty batch (after exclusion) signals the
    /// server has nothing pending and wholesale-clears the provisional and
    /// highlight sets.
    pub(crate) fn apply_mutable(&mut self, batch: &[WireSegment]) {
        let keys = self.merge(batch);
        if keys.is_empty() {
            self.mutable_keys.clear();
            self.recent_keys.clear();
            return;
        }
        self.mutable_keys.extend(keys);
    }

    /// Apply a `transcript.finalized` batch: merge, then promote every key
    /// in the batch out of the provisional set.
    pub(crate) fn apply_finalized(&mut self, batch: &[WireSegment]) {
        let keys = self.merge(batch);
        for key in keys {
            self.mutable_keys.remove(&key);
        }
    }

    /// Reset everything; used on language change and meeting teardown
    pub(crate) fn clear(&mut self) {
        self.segments.clear();
        self.mutable_keys.clear();
        self.recent_keys.clear();
    }

    /// Segments in ascending absolute-time order
    pub(crate) fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    /// Whether the segment at `key` is still provisional
    pub(crate) fn is_mutable(&self, key: SegmentKey) -> bool {
        self.mutable_keys.contains(&key)
    }

    /// Drain the recently-changed keys for highlight rendering
    pub(crate) fn take_recent(&mut self) -> BTreeSet<SegmentKey> {
        std::mem::take(&mut self.recent_keys)
    }

    pub(crate) fn len(&self) -> usize {
        self.segments.len()
    }
}

/// An incoming segment is stale only when both revisions are stamped and
/// the incoming stamp is strictly older; ties keep the existing occupant.
fn is_stale(incoming: &Segment, existing: &Segment) -> bool {
    match (incoming.updated_at, existing.updated_at) {
        (Some(new), Some(old)) => new < old,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn ts(raw: &str) -> DateTime<Utc> {
        raw.parse().unwrap()
    }

    fn wire(text: &str, start: &str) -> WireSegment {
        WireSegment {
            text: Some(text.to_string()),
            speaker: Some("Ana".to_string()),
            absolute_start_time: Some(start.to_string()),
            absolute_end_time: None,
            updated_at: None,
        }
    }

    fn wire_rev(text: &str, start: &str, updated: &str) -> WireSegment {
        WireSegment {
            updated_at: Some(updated.to_string()),
            ..wire(text, start)
        }
    }

    fn keyless(text: &str) -> WireSegment {
        WireSegment {
            text: Some(text.to_string()),
            speaker: None,
            absolute_start_time: None,
            absolute_end_time: None,
            updated_at: None,
        }
    }

    fn texts(state: &TranscriptState) -> Vec<&str> {
        state.segments().map(|s| s.text.as_str()).collect()
    }

    #[test]
    fn test_merge_normalizes_text() {
        let mut state = TranscriptState::new();
        state.merge(&[wire("  hello   world ", "2025-03-01T10:00:00Z")]);
        assert_eq!(texts(&state), vec!["hello world"]);
    }

    #[test]
    fn test_merge_orders_by_start_time() {
        let mut state = TranscriptState::new();
        state.merge(&[
            wire("third", "2025-03-01T10:00:02Z"),
            wire("first", "2025-03-01T10:00:00Z"),
            wire("second", "2025-03-01T10:00:01Z"),
        ]);
        assert_eq!(texts(&state), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_merge_excludes_keyless_segments() {
        let mut state = TranscriptState::new();
        state.merge(&[keyless("floating"), wire("anchored", "2025-03-01T10:00:00Z")]);
        assert_eq!(texts(&state), vec!["anchored"]);
    }

    #[test]
    fn test_merge_is_deterministic_under_permutation() {
        let batch = vec![
            wire_rev("a", "2025-03-01T10:00:00Z", "2025-03-01T10:00:05Z"),
            wire_rev("b", "2025-03-01T10:00:01Z", "2025-03-01T10:00:06Z"),
            wire("c", "2025-03-01T10:00:02Z"),
        ];
        let mut forward = TranscriptState::new();
        forward.merge(&batch);

        let mut reversed_batch = batch.clone();
        reversed_batch.reverse();
        let mut backward = TranscriptState::new();
        backward.merge(&reversed_batch);

        let fwd: Vec<_> = forward.segments().cloned().collect();
        let bwd: Vec<_> = backward.segments().cloned().collect();
        assert_eq!(fwd, bwd);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let batch = vec![
            wire_rev("a", "2025-03-01T10:00:00Z", "2025-03-01T10:00:05Z"),
            wire("b", "2025-03-01T10:00:01Z"),
        ];
        let mut once = TranscriptState::new();
        once.merge(&batch);
        let snapshot: Vec<_> = once.segments().cloned().collect();

        once.merge(&batch);
        let again: Vec<_> = once.segments().cloned().collect();
        assert_eq!(snapshot, again);
    }

    #[test]
    fn test_stale_update_is_discarded() {
        let mut state = TranscriptState::new();
        state.merge(&[wire_rev(
            "final wording",
            "2025-03-01T10:00:00Z",
            "2025-03-01T10:00:02Z",
        )]);
        state.merge(&[wire_rev(
            "earlier draft",
            "2025-03-01T10:00:00Z",
            "2025-03-01T10:00:01Z",
        )]);
        assert_eq!(texts(&state), vec!["final wording"]);
    }

    #[test]
    fn test_equal_revision_keeps_existing() {
        let mut state = TranscriptState::new();
        state.merge(&[wire_rev(
            "original",
            "2025-03-01T10:00:00Z",
            "2025-03-01T10:00:02Z",
        )]);
        state.merge(&[wire_rev(
            "tied revision",
            "2025-03-01T10:00:00Z",
            "2025-03-01T10:00:02Z",
        )]);
        assert_eq!(texts(&state), vec!["original"]);
    }

    #[test]
    fn test_unstamped_incoming_replaces() {
        let mut state = TranscriptState::new();
        state.merge(&[wire_rev(
            "stamped",
            "2025-03-01T10:00:00Z",
            "2025-03-01T10:00:02Z",
        )]);
        state.merge(&[wire("unstamped", "2025-03-01T10:00:00Z")]);
        assert_eq!(texts(&state), vec!["unstamped"]);
    }

    #[test]
    fn test_mutable_then_finalized_promotes() {
        let mut state = TranscriptState::new();
        state.apply_mutable(&[wire_rev(
            "draft",
            "2025-03-01T10:00:00Z",
            "2025-03-01T10:00:01Z",
        )]);
        let key = ts("2025-03-01T10:00:00Z");
        assert!(state.is_mutable(key));

        state.apply_finalized(&[wire_rev(
            "final text",
            "2025-03-01T10:00:00Z",
            "2025-03-01T10:00:02Z",
        )]);
        assert!(!state.is_mutable(key));
        assert_eq!(texts(&state), vec!["final text"]);
    }

    #[test]
    fn test_stale_mutable_after_finalized_leaves_text() {
        let mut state = TranscriptState::new();
        state.apply_finalized(&[wire_rev(
            "final text",
            "2025-03-01T10:00:00Z",
            "2025-03-01T10:00:02Z",
        )]);
        state.apply_mutable(&[wire_rev(
            "late draft",
            "2025-03-01T10:00:00Z",
            "2025-03-01T10:00:01Z",
        )]);
        // Text unchanged, but the key was re-marked provisional by the batch
        assert_eq!(texts(&state), vec!["final text"]);
    }

    #[test]
    fn test_finalized_removes_key_regardless_of_prior_state() {
        let mut state = TranscriptState::new();
        // Never seen as mutable; finalized still leaves the set clean
        state.apply_finalized(&[wire("direct", "2025-03-01T10:00:00Z")]);
        assert!(!state.is_mutable(ts("2025-03-01T10:00:00Z")));
    }

    #[test]
    fn test_empty_mutable_batch_clears_bookkeeping() {
        let mut state = TranscriptState::new();
        state.apply_mutable(&[wire("draft", "2025-03-01T10:00:00Z")]);
        assert!(state.is_mutable(ts("2025-03-01T10:00:00Z")));

        state.apply_mutable(&[]);
        assert!(!state.is_mutable(ts("2025-03-01T10:00:00Z")));
        assert!(state.take_recent().is_empty());
        // The sequence itself is untouched
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_all_keyless_mutable_batch_clears_bookkeeping() {
        let mut state = TranscriptState::new();
        state.apply_mutable(&[wire("draft", "2025-03-01T10:00:00Z")]);
        state.apply_mutable(&[keyless("floating")]);
        assert!(!state.is_mutable(ts("2025-03-01T10:00:00Z")));
    }

    #[test]
    fn test_recent_tracks_new_and_changed_only() {
        let mut state = TranscriptState::new();
        state.merge(&[wire("hello", "2025-03-01T10:00:00Z")]);
        assert_eq!(state.take_recent().len(), 1);

        // Same text again: not recent
        state.merge(&[wire("hello", "2025-03-01T10:00:00Z")]);
        assert!(state.take_recent().is_empty());

        // Changed text: recent again
        state.merge(&[wire("hello there", "2025-03-01T10:00:00Z")]);
        assert_eq!(state.take_recent().len(), 1);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut state = TranscriptState::new();
        state.apply_mutable(&[wire("draft", "2025-03-01T10:00:00Z")]);
        state.clear();
        assert_eq!(state.len(), 0);
        assert!(!state.is_mutable(ts("2025-03-01T10:00:00Z")));
        assert!(state.take_recent().is_empty());
    }
}
