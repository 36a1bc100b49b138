//! Transcript reconciliation
//!
//! Maintains one consistent, time-ordered view of meeting segments while
//! receiving out-of-order, overlapping, and revisable updates from the
//! REST batch load and the event stream. Both sources are normalized to
//! the same segment shape and folded through the same merge, so the
//! reconciler never special-cases where a batch came from.

mod group;
mod segment;
mod state;

pub(crate) use group::{group_by_speaker, SpeakerBlock};
pub(crate) use state::TranscriptState;
