//! Replicated timeline document.
//!
//! Every mutation is an [`Op`] carrying a Lamport [`Stamp`]. Scalars are
//! last-writer-wins registers, sections are ordered by fractional keys, and
//! deletion leaves a tombstone so late edits still have somewhere to land.
//! Applying the same set of ops in any order yields byte-identical state.

mod clock;
mod document;
mod lww;
mod ops;
mod order;
mod types;

pub use clock::{LamportClock, Stamp};
pub use document::{MAX_BAR_COUNT, MAX_CLOCK_SKEW, ModelError, TimelineDocument};
pub use lww::Lww;
pub use ops::{KeyframeField, LocalOp, Op, OpKind, RejectedOp};
pub use order::OrderKey;
pub use types::{
    Animation, AnimationId, BarBeat, Chord, Comment, CommentId, Cursor, DocumentSummary, Easing,
    Presence, Section, SectionId, TempoCurve, TempoShape, Thread,
};
