use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::clock::Stamp;
use super::order::OrderKey;
use super::types::{
    AnimationId, BarBeat, Chord, CommentId, Easing, SectionId, TempoCurve,
};
use crate::ids::{ClientId, UserId};

/// A stamped, replicated change: the unit of incremental sync.
///
/// Entities created by an op take the op's stamp as their id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub stamp: Stamp,
    pub kind: OpKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    InsertSection {
        position: OrderKey,
        name: String,
        bar_count: u32,
        tempo: TempoCurve,
    },
    MoveSection {
        section: SectionId,
        position: OrderKey,
    },
    SetSectionName {
        section: SectionId,
        name: String,
    },
    SetBarCount {
        section: SectionId,
        bar_count: u32,
    },
    SetTempo {
        section: SectionId,
        tempo: TempoCurve,
    },
    DeleteSection {
        section: SectionId,
    },
    SetChord {
        section: SectionId,
        at: BarBeat,
        chord: Option<Chord>,
    },
    AddAnimation {
        section: SectionId,
        property: String,
        time: f64,
        value: f64,
        easing: Easing,
    },
    SetKeyframe {
        section: SectionId,
        animation: AnimationId,
        field: KeyframeField,
    },
    DeleteAnimation {
        section: SectionId,
        animation: AnimationId,
    },
    AddComment {
        parent: Option<CommentId>,
        bar_start: u32,
        text: String,
        author: UserId,
        created_at: i64,
    },
    EditComment {
        comment: CommentId,
        text: String,
    },
    MoveComment {
        comment: CommentId,
        bar_start: u32,
    },
    ResolveComment {
        comment: CommentId,
        resolved: bool,
    },
    DeleteComment {
        comment: CommentId,
    },
    ToggleReaction {
        comment: CommentId,
        emoji: String,
        user: UserId,
        on: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeyframeField {
    Property(String),
    Time(f64),
    Value(f64),
    Easing(Easing),
}

impl Op {
    pub fn client(&self) -> ClientId {
        self.stamp.client
    }

    /// Comment this op creates or touches, if any.
    pub fn comment(&self) -> Option<CommentId> {
        match &self.kind {
            OpKind::AddComment { .. } => Some(CommentId(self.stamp)),
            OpKind::EditComment { comment, .. }
            | OpKind::MoveComment { comment, .. }
            | OpKind::ResolveComment { comment, .. }
            | OpKind::DeleteComment { comment }
            | OpKind::ToggleReaction { comment, .. } => Some(*comment),
            _ => None,
        }
    }

    /// User the op claims to act for: a comment's author or a reaction's user.
    pub fn acting_user(&self) -> Option<&UserId> {
        match &self.kind {
            OpKind::AddComment { author, .. } => Some(author),
            OpKind::ToggleReaction { user, .. } => Some(user),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// An edit intent expressed against the local replica's current view.
///
/// `TimelineDocument::apply` turns it into a stamped [`Op`]: indexes become
/// order keys, toggles become explicit on/off.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalOp {
    InsertSection {
        index: usize,
        name: String,
        bar_count: u32,
        tempo: TempoCurve,
    },
    MoveSection {
        section: SectionId,
        index: usize,
    },
    SetSectionName {
        section: SectionId,
        name: String,
    },
    SetBarCount {
        section: SectionId,
        bar_count: u32,
    },
    SetTempo {
        section: SectionId,
        tempo: TempoCurve,
    },
    DeleteSection {
        section: SectionId,
    },
    SetChord {
        section: SectionId,
        at: BarBeat,
        chord: Chord,
    },
    ClearChord {
        section: SectionId,
        at: BarBeat,
    },
    AddAnimation {
        section: SectionId,
        property: String,
        time: f64,
        value: f64,
        easing: Easing,
    },
    SetKeyframe {
        section: SectionId,
        animation: AnimationId,
        field: KeyframeField,
    },
    DeleteAnimation {
        section: SectionId,
        animation: AnimationId,
    },
    AddComment {
        bar_start: u32,
        text: String,
        author: UserId,
        created_at: i64,
    },
    ReplyComment {
        parent: CommentId,
        text: String,
        author: UserId,
        created_at: i64,
    },
    EditComment {
        comment: CommentId,
        text: String,
    },
    MoveComment {
        comment: CommentId,
        bar_start: u32,
    },
    ResolveComment {
        comment: CommentId,
        resolved: bool,
    },
    DeleteComment {
        comment: CommentId,
    },
    ToggleReaction {
        comment: CommentId,
        emoji: String,
        user: UserId,
    },
}

/// A well-formed op that cannot be applied to this replica. State is untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RejectedOp {
    #[error("unknown section {0}")]
    UnknownSection(SectionId),

    #[error("unknown animation {0}")]
    UnknownAnimation(AnimationId),

    #[error("unknown comment {0}")]
    UnknownComment(CommentId),

    #[error("comment {parent} is a reply; replies cannot be replied to")]
    ReplyDepth { parent: CommentId },

    #[error("invalid position key")]
    InvalidPosition,

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("op stamped by client {found}, connection is client {expected}")]
    ClientMismatch { expected: ClientId, found: ClientId },

    #[error("op acts for user {found}, connection is user {expected}")]
    IdentityMismatch { expected: UserId, found: UserId },
}
