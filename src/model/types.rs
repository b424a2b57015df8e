use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::clock::Stamp;
use super::lww::Lww;
use super::order::OrderKey;
use crate::ids::UserId;

macro_rules! stamp_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Stamp);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

stamp_id!(
    /// Stamp of the op that inserted the section.
    SectionId
);
stamp_id!(
    /// Stamp of the op that added the animation.
    AnimationId
);
stamp_id!(
    /// Stamp of the op that posted the comment.
    CommentId
);

/// Chord grid position inside a section. Both fields are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BarBeat {
    pub bar: u32,
    pub beat: u32,
}

impl BarBeat {
    pub fn new(bar: u32, beat: u32) -> Self {
        Self { bar, beat }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chord {
    pub symbol: String,
}

impl Chord {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TempoShape {
    #[default]
    Constant,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoCurve {
    pub start_bpm: f64,
    pub end_bpm: f64,
    pub shape: TempoShape,
}

impl TempoCurve {
    pub fn constant(bpm: f64) -> Self {
        Self {
            start_bpm: bpm,
            end_bpm: bpm,
            shape: TempoShape::Constant,
        }
    }
}

impl Default for TempoCurve {
    fn default() -> Self {
        Self::constant(120.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Easing {
    #[default]
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
    Step,
}

/// One keyframe on a section. Every scalar is its own register so edits to
/// different fields of the same keyframe never overwrite each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Animation {
    pub id: AnimationId,
    pub property: Lww<String>,
    pub time: Lww<f64>,
    pub value: Lww<f64>,
    pub easing: Lww<Easing>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: SectionId,
    pub name: Lww<String>,
    pub position: Lww<OrderKey>,
    pub bar_count: Lww<u32>,
    pub tempo: Lww<TempoCurve>,
    pub chords: BTreeMap<BarBeat, Lww<Option<Chord>>>,
    pub animations: BTreeMap<AnimationId, Animation>,
    pub deleted: bool,
}

impl Section {
    pub fn chord(&self, at: BarBeat) -> Option<&Chord> {
        self.chords.get(&at).and_then(|reg| reg.get().as_ref())
    }

    /// Visible chords in grid order.
    pub fn chord_grid(&self) -> Vec<(BarBeat, &Chord)> {
        self.chords
            .iter()
            .filter_map(|(at, reg)| reg.get().as_ref().map(|c| (*at, c)))
            .collect()
    }

    /// Visible keyframes ordered by time, creation order breaking ties.
    pub fn keyframes(&self) -> Vec<&Animation> {
        let mut out: Vec<_> = self.animations.values().filter(|a| !a.deleted).collect();
        out.sort_by(|a, b| {
            a.time
                .get()
                .total_cmp(b.time.get())
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub parent: Option<CommentId>,
    pub author: UserId,
    pub created_at: i64,
    pub bar_start: Lww<u32>,
    pub text: Lww<String>,
    pub resolved: Lww<bool>,
    /// Latest on/off toggle per (emoji, user).
    pub reactions: BTreeMap<(String, UserId), Lww<bool>>,
    pub deleted: bool,
}

impl Comment {
    pub fn is_reply(&self) -> bool {
        self.parent.is_some()
    }

    /// Materialised reaction sets: users whose latest toggle for an emoji is on.
    pub fn reaction_sets(&self) -> BTreeMap<String, BTreeSet<UserId>> {
        let mut out: BTreeMap<String, BTreeSet<UserId>> = BTreeMap::new();
        for ((emoji, user), toggle) in &self.reactions {
            if *toggle.get() {
                out.entry(emoji.clone()).or_default().insert(user.clone());
            }
        }
        out
    }
}

/// A top-level comment with its replies, in creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct Thread<'a> {
    pub root: &'a Comment,
    pub replies: Vec<&'a Comment>,
}

/// Counts surfaced with snapshots and the document summary endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub section_count: u32,
    pub total_bars: u64,
    pub comment_count: u32,
}

/// Per-connection collaborator metadata. Never persisted, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: UserId,
    pub display_name: String,
    pub color: String,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    /// Unix millis, set by the server on every update.
    #[serde(default)]
    pub last_seen_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(default)]
    pub section: Option<SectionId>,
    pub bar: u32,
    #[serde(default)]
    pub beat: u32,
}
