use serde::Serialize;

use crate::ids::{BranchId, ClientId, RoomKey, SnapshotId, UserId};
use crate::model::{CommentId, Op, OpKind, Stamp};

/// Change notifications for downstream consumers (activity feeds and the
/// like). Emitted on a broadcast channel; nobody listening is fine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEvent {
    pub room: RoomKey,
    pub at: i64,
    #[serde(flatten)]
    pub kind: ActivityKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum ActivityKind {
    #[serde(rename = "op.applied")]
    OpApplied {
        stamp: Stamp,
        client: ClientId,
        user: UserId,
    },
    #[serde(rename = "comment.added")]
    CommentAdded { comment: CommentId, author: UserId },
    #[serde(rename = "comment.replied")]
    CommentReplied {
        comment: CommentId,
        parent: CommentId,
        author: UserId,
    },
    #[serde(rename = "comment.reaction")]
    CommentReaction {
        comment: CommentId,
        emoji: String,
        user: UserId,
        on: bool,
    },
    #[serde(rename = "snapshot.restored")]
    SnapshotRestored { snapshot: SnapshotId },
    #[serde(rename = "branch.merged")]
    BranchMerged { branch: BranchId },
}

/// Events describing one applied op: always `op.applied`, plus a comment
/// event when the op touched the comment collection.
pub(crate) fn events_for_op(user: &UserId, op: &Op) -> Vec<ActivityKind> {
    let mut out = vec![ActivityKind::OpApplied {
        stamp: op.stamp,
        client: op.client(),
        user: user.clone(),
    }];

    match &op.kind {
        OpKind::AddComment {
            parent: None,
            author,
            ..
        } => out.push(ActivityKind::CommentAdded {
            comment: CommentId(op.stamp),
            author: author.clone(),
        }),
        OpKind::AddComment {
            parent: Some(parent),
            author,
            ..
        } => out.push(ActivityKind::CommentReplied {
            comment: CommentId(op.stamp),
            parent: *parent,
            author: author.clone(),
        }),
        OpKind::ToggleReaction {
            comment,
            emoji,
            user,
            on,
        } => out.push(ActivityKind::CommentReaction {
            comment: *comment,
            emoji: emoji.clone(),
            user: user.clone(),
            on: *on,
        }),
        _ => {}
    }
    out
}
