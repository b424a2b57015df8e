use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use super::clock::{LamportClock, Stamp};
use super::lww::Lww;
use super::ops::{KeyframeField, LocalOp, Op, OpKind, RejectedOp};
use super::order::OrderKey;
use super::types::{
    Animation, AnimationId, Comment, CommentId, DocumentSummary, Section, SectionId, TempoCurve,
    Thread,
};
use crate::ids::{ClientId, UserId};

/// Upper bound on a single section's length.
pub const MAX_BAR_COUNT: u32 = 10_000;

/// How far a remote stamp may run ahead of this replica's clock.
pub const MAX_CLOCK_SKEW: u64 = 1 << 20;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to decode document state: {0}")]
    Decode(#[from] postcard::Error),

    #[error("document state is inconsistent: {0}")]
    Integrity(String),
}

/// Everything that is replicated and persisted. Ordered maps keep the encoding
/// canonical: replicas holding the same state encode to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct DocumentState {
    clock: LamportClock,
    sections: BTreeMap<SectionId, Section>,
    comments: BTreeMap<CommentId, Comment>,
}

/// One replica of a timeline document.
///
/// Not internally synchronised; the owning room actor (or client) serialises
/// access.
#[derive(Debug, Clone)]
pub struct TimelineDocument {
    replica: ClientId,
    state: DocumentState,
}

impl TimelineDocument {
    pub fn new(replica: ClientId) -> Self {
        Self {
            replica,
            state: DocumentState::default(),
        }
    }

    pub fn from_full(replica: ClientId, bytes: &[u8]) -> Result<Self, ModelError> {
        let mut doc = Self::new(replica);
        doc.load_full(bytes)?;
        Ok(doc)
    }

    pub fn replica(&self) -> ClientId {
        self.replica
    }

    /// Adopt a new replica id, e.g. after the server reassigns one on resync.
    pub fn set_replica(&mut self, replica: ClientId) {
        self.replica = replica;
    }

    /// Apply a local edit and return the op to broadcast.
    pub fn apply(&mut self, local: LocalOp) -> Result<Op, RejectedOp> {
        let mut next = self.state.clock;
        let stamp = next
            .tick(self.replica)
            .ok_or_else(|| RejectedOp::InvalidValue("lamport clock exhausted".into()))?;
        let kind = self.resolve(local)?;
        let op = Op { stamp, kind };
        self.integrate(&op)?;
        Ok(op)
    }

    /// Merge an op produced by any replica. Re-delivery is a no-op.
    pub fn apply_remote(&mut self, op: &Op) -> Result<(), RejectedOp> {
        self.integrate(op)
    }

    pub fn encode_full(&self) -> Result<Vec<u8>, ModelError> {
        Ok(postcard::to_allocvec(&self.state)?)
    }

    /// Replace the whole state. On failure the current state is kept.
    pub fn load_full(&mut self, bytes: &[u8]) -> Result<(), ModelError> {
        let state: DocumentState = postcard::from_bytes(bytes)?;
        check_state(&state)?;
        self.state = state;
        Ok(())
    }

    pub fn check_integrity(&self) -> Result<(), ModelError> {
        check_state(&self.state)
    }

    pub fn clock(&self) -> u64 {
        self.state.clock.now()
    }

    /// Visible sections in replicated order.
    pub fn sections(&self) -> Vec<&Section> {
        let mut out: Vec<_> = self.state.sections.values().filter(|s| !s.deleted).collect();
        out.sort_by(|a, b| {
            a.position
                .get()
                .cmp(b.position.get())
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.state.sections.get(&id).filter(|s| !s.deleted)
    }

    pub fn section_names(&self) -> Vec<String> {
        self.sections().iter().map(|s| s.name.get().clone()).collect()
    }

    pub fn comment(&self, id: CommentId) -> Option<&Comment> {
        self.state.comments.get(&id).filter(|c| !c.deleted)
    }

    pub fn comments(&self) -> impl Iterator<Item = &Comment> {
        self.state.comments.values().filter(|c| !c.deleted)
    }

    pub fn reactions(&self, id: CommentId) -> BTreeMap<String, BTreeSet<UserId>> {
        self.comment(id)
            .map(Comment::reaction_sets)
            .unwrap_or_default()
    }

    /// Visible top-level comments ordered by bar, each with its visible replies.
    pub fn threads(&self) -> Vec<Thread<'_>> {
        let mut roots: Vec<_> = self.comments().filter(|c| !c.is_reply()).collect();
        roots.sort_by(|a, b| {
            a.bar_start
                .get()
                .cmp(b.bar_start.get())
                .then_with(|| a.id.cmp(&b.id))
        });
        roots
            .into_iter()
            .map(|root| Thread {
                root,
                replies: self
                    .comments()
                    .filter(|c| c.parent == Some(root.id))
                    .collect(),
            })
            .collect()
    }

    pub fn total_bars(&self) -> u64 {
        self.sections()
            .iter()
            .map(|s| u64::from(*s.bar_count.get()))
            .sum()
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            section_count: self.sections().len() as u32,
            total_bars: self.total_bars(),
            comment_count: self.comments().count() as u32,
        }
    }

    /// Turn an intent into a replicated op kind against the current view.
    fn resolve(&self, local: LocalOp) -> Result<OpKind, RejectedOp> {
        let kind = match local {
            LocalOp::InsertSection {
                index,
                name,
                bar_count,
                tempo,
            } => {
                let ordered = self.sections();
                OpKind::InsertSection {
                    position: self.key_at(&ordered, index),
                    name,
                    bar_count,
                    tempo,
                }
            }
            LocalOp::MoveSection { section, index } => {
                self.known_section(section)?;
                let ordered: Vec<_> = self
                    .sections()
                    .into_iter()
                    .filter(|s| s.id != section)
                    .collect();
                OpKind::MoveSection {
                    section,
                    position: self.key_at(&ordered, index),
                }
            }
            LocalOp::SetSectionName { section, name } => OpKind::SetSectionName { section, name },
            LocalOp::SetBarCount { section, bar_count } => {
                OpKind::SetBarCount { section, bar_count }
            }
            LocalOp::SetTempo { section, tempo } => OpKind::SetTempo { section, tempo },
            LocalOp::DeleteSection { section } => OpKind::DeleteSection { section },
            LocalOp::SetChord { section, at, chord } => OpKind::SetChord {
                section,
                at,
                chord: Some(chord),
            },
            LocalOp::ClearChord { section, at } => OpKind::SetChord {
                section,
                at,
                chord: None,
            },
            LocalOp::AddAnimation {
                section,
                property,
                time,
                value,
                easing,
            } => OpKind::AddAnimation {
                section,
                property,
                time,
                value,
                easing,
            },
            LocalOp::SetKeyframe {
                section,
                animation,
                field,
            } => OpKind::SetKeyframe {
                section,
                animation,
                field,
            },
            LocalOp::DeleteAnimation { section, animation } => {
                OpKind::DeleteAnimation { section, animation }
            }
            LocalOp::AddComment {
                bar_start,
                text,
                author,
                created_at,
            } => OpKind::AddComment {
                parent: None,
                bar_start,
                text,
                author,
                created_at,
            },
            LocalOp::ReplyComment {
                parent,
                text,
                author,
                created_at,
            } => {
                let bar_start = *self.known_comment(parent)?.bar_start.get();
                OpKind::AddComment {
                    parent: Some(parent),
                    bar_start,
                    text,
                    author,
                    created_at,
                }
            }
            LocalOp::EditComment { comment, text } => OpKind::EditComment { comment, text },
            LocalOp::MoveComment { comment, bar_start } => {
                OpKind::MoveComment { comment, bar_start }
            }
            LocalOp::ResolveComment { comment, resolved } => {
                OpKind::ResolveComment { comment, resolved }
            }
            LocalOp::DeleteComment { comment } => OpKind::DeleteComment { comment },
            LocalOp::ToggleReaction {
                comment,
                emoji,
                user,
            } => {
                let current = self
                    .known_comment(comment)?
                    .reactions
                    .get(&(emoji.clone(), user.clone()))
                    .map(|t| *t.get())
                    .unwrap_or(false);
                OpKind::ToggleReaction {
                    comment,
                    emoji,
                    user,
                    on: !current,
                }
            }
        };
        Ok(kind)
    }

    /// Order key for inserting at `index` of `ordered`.
    fn key_at(&self, ordered: &[&Section], index: usize) -> OrderKey {
        let index = index.min(ordered.len());
        let prev = index
            .checked_sub(1)
            .and_then(|i| ordered.get(i))
            .map(|s| s.position.get());
        let next = ordered.get(index).map(|s| s.position.get());
        OrderKey::between(prev, next, self.replica)
    }

    fn known_section(&self, id: SectionId) -> Result<&Section, RejectedOp> {
        self.state
            .sections
            .get(&id)
            .ok_or(RejectedOp::UnknownSection(id))
    }

    fn known_comment(&self, id: CommentId) -> Result<&Comment, RejectedOp> {
        self.state
            .comments
            .get(&id)
            .ok_or(RejectedOp::UnknownComment(id))
    }

    fn section_mut(&mut self, id: SectionId) -> Result<&mut Section, RejectedOp> {
        self.state
            .sections
            .get_mut(&id)
            .ok_or(RejectedOp::UnknownSection(id))
    }

    fn comment_mut(&mut self, id: CommentId) -> Result<&mut Comment, RejectedOp> {
        self.state
            .comments
            .get_mut(&id)
            .ok_or(RejectedOp::UnknownComment(id))
    }

    /// Validate, then mutate. Nothing is written unless every check passes.
    fn integrate(&mut self, op: &Op) -> Result<(), RejectedOp> {
        self.validate(op)?;
        let stamp = op.stamp;

        match &op.kind {
            OpKind::InsertSection {
                position,
                name,
                bar_count,
                tempo,
            } => {
                self.state
                    .sections
                    .entry(SectionId(stamp))
                    .or_insert_with(|| Section {
                        id: SectionId(stamp),
                        name: Lww::new(name.clone(), stamp),
                        position: Lww::new(position.clone(), stamp),
                        bar_count: Lww::new(*bar_count, stamp),
                        tempo: Lww::new(*tempo, stamp),
                        chords: BTreeMap::new(),
                        animations: BTreeMap::new(),
                        deleted: false,
                    });
            }
            OpKind::MoveSection { section, position } => {
                self.section_mut(*section)?
                    .position
                    .set(position.clone(), stamp);
            }
            OpKind::SetSectionName { section, name } => {
                self.section_mut(*section)?.name.set(name.clone(), stamp);
            }
            OpKind::SetBarCount { section, bar_count } => {
                self.section_mut(*section)?.bar_count.set(*bar_count, stamp);
            }
            OpKind::SetTempo { section, tempo } => {
                self.section_mut(*section)?.tempo.set(*tempo, stamp);
            }
            OpKind::DeleteSection { section } => {
                self.section_mut(*section)?.deleted = true;
            }
            OpKind::SetChord { section, at, chord } => {
                let section = self.section_mut(*section)?;
                match section.chords.get_mut(at) {
                    Some(reg) => {
                        reg.set(chord.clone(), stamp);
                    }
                    None => {
                        section.chords.insert(*at, Lww::new(chord.clone(), stamp));
                    }
                }
            }
            OpKind::AddAnimation {
                section,
                property,
                time,
                value,
                easing,
            } => {
                let id = AnimationId(stamp);
                self.section_mut(*section)?
                    .animations
                    .entry(id)
                    .or_insert_with(|| Animation {
                        id,
                        property: Lww::new(property.clone(), stamp),
                        time: Lww::new(*time, stamp),
                        value: Lww::new(*value, stamp),
                        easing: Lww::new(*easing, stamp),
                        deleted: false,
                    });
            }
            OpKind::SetKeyframe {
                section,
                animation,
                field,
            } => {
                let anim = self
                    .section_mut(*section)?
                    .animations
                    .get_mut(animation)
                    .ok_or(RejectedOp::UnknownAnimation(*animation))?;
                match field {
                    KeyframeField::Property(p) => {
                        anim.property.set(p.clone(), stamp);
                    }
                    KeyframeField::Time(t) => {
                        anim.time.set(*t, stamp);
                    }
                    KeyframeField::Value(v) => {
                        anim.value.set(*v, stamp);
                    }
                    KeyframeField::Easing(e) => {
                        anim.easing.set(*e, stamp);
                    }
                }
            }
            OpKind::DeleteAnimation { section, animation } => {
                self.section_mut(*section)?
                    .animations
                    .get_mut(animation)
                    .ok_or(RejectedOp::UnknownAnimation(*animation))?
                    .deleted = true;
            }
            OpKind::AddComment {
                parent,
                bar_start,
                text,
                author,
                created_at,
            } => {
                let id = CommentId(stamp);
                self.state.comments.entry(id).or_insert_with(|| Comment {
                    id,
                    parent: *parent,
                    author: author.clone(),
                    created_at: *created_at,
                    bar_start: Lww::new(*bar_start, stamp),
                    text: Lww::new(text.clone(), stamp),
                    resolved: Lww::new(false, stamp),
                    reactions: BTreeMap::new(),
                    deleted: false,
                });
            }
            OpKind::EditComment { comment, text } => {
                self.comment_mut(*comment)?.text.set(text.clone(), stamp);
            }
            OpKind::MoveComment { comment, bar_start } => {
                self.comment_mut(*comment)?.bar_start.set(*bar_start, stamp);
            }
            OpKind::ResolveComment { comment, resolved } => {
                self.comment_mut(*comment)?.resolved.set(*resolved, stamp);
            }
            OpKind::DeleteComment { comment } => {
                self.comment_mut(*comment)?.deleted = true;
            }
            OpKind::ToggleReaction {
                comment,
                emoji,
                user,
                on,
            } => {
                let key = (emoji.clone(), user.clone());
                let reactions = &mut self.comment_mut(*comment)?.reactions;
                match reactions.get_mut(&key) {
                    Some(reg) => {
                        reg.set(*on, stamp);
                    }
                    None => {
                        reactions.insert(key, Lww::new(*on, stamp));
                    }
                }
            }
        }

        self.state.clock.observe(stamp);
        trace!(stamp = %stamp, "op integrated");
        Ok(())
    }

    fn validate(&self, op: &Op) -> Result<(), RejectedOp> {
        if op.stamp.lamport == 0 {
            return Err(RejectedOp::InvalidValue("lamport time must be positive".into()));
        }
        if op.stamp.lamport > self.clock().saturating_add(MAX_CLOCK_SKEW) {
            return Err(RejectedOp::InvalidValue(format!(
                "lamport time {} is too far ahead of clock {}",
                op.stamp.lamport,
                self.clock()
            )));
        }

        match &op.kind {
            OpKind::InsertSection {
                position,
                bar_count,
                tempo,
                ..
            } => {
                check_position(position)?;
                check_bar_count(*bar_count)?;
                check_tempo(tempo)?;
            }
            OpKind::MoveSection { section, position } => {
                self.known_section(*section)?;
                check_position(position)?;
            }
            OpKind::SetBarCount { section, bar_count } => {
                self.known_section(*section)?;
                check_bar_count(*bar_count)?;
            }
            OpKind::SetTempo { section, tempo } => {
                self.known_section(*section)?;
                check_tempo(tempo)?;
            }
            OpKind::SetSectionName { section, .. }
            | OpKind::DeleteSection { section }
            | OpKind::SetChord { section, .. } => {
                self.known_section(*section)?;
            }
            OpKind::AddAnimation {
                section,
                time,
                value,
                ..
            } => {
                self.known_section(*section)?;
                check_finite(*time, "keyframe time")?;
                check_finite(*value, "keyframe value")?;
            }
            OpKind::SetKeyframe {
                section,
                animation,
                field,
            } => {
                self.known_animation(*section, *animation)?;
                match field {
                    KeyframeField::Time(t) => check_finite(*t, "keyframe time")?,
                    KeyframeField::Value(v) => check_finite(*v, "keyframe value")?,
                    KeyframeField::Property(_) | KeyframeField::Easing(_) => {}
                }
            }
            OpKind::DeleteAnimation { section, animation } => {
                self.known_animation(*section, *animation)?;
            }
            OpKind::AddComment { parent, .. } => {
                if let Some(parent) = parent {
                    let parent_comment = self.known_comment(*parent)?;
                    if parent_comment.is_reply() {
                        return Err(RejectedOp::ReplyDepth { parent: *parent });
                    }
                }
            }
            OpKind::ToggleReaction { comment, emoji, .. } => {
                self.known_comment(*comment)?;
                if emoji.trim().is_empty() {
                    return Err(RejectedOp::InvalidValue("emoji cannot be empty".into()));
                }
            }
            OpKind::EditComment { comment, .. }
            | OpKind::MoveComment { comment, .. }
            | OpKind::ResolveComment { comment, .. }
            | OpKind::DeleteComment { comment } => {
                self.known_comment(*comment)?;
            }
        }
        Ok(())
    }

    fn known_animation(
        &self,
        section: SectionId,
        animation: AnimationId,
    ) -> Result<&Animation, RejectedOp> {
        self.known_section(section)?
            .animations
            .get(&animation)
            .ok_or(RejectedOp::UnknownAnimation(animation))
    }
}

fn check_position(position: &OrderKey) -> Result<(), RejectedOp> {
    OrderKey::parse(position.as_str())
        .map(|_| ())
        .ok_or(RejectedOp::InvalidPosition)
}

fn check_bar_count(bar_count: u32) -> Result<(), RejectedOp> {
    if bar_count == 0 || bar_count > MAX_BAR_COUNT {
        return Err(RejectedOp::InvalidValue(format!(
            "bar count must be between 1 and {MAX_BAR_COUNT}"
        )));
    }
    Ok(())
}

fn check_tempo(tempo: &TempoCurve) -> Result<(), RejectedOp> {
    let valid = |bpm: f64| bpm.is_finite() && bpm > 0.0;
    if !valid(tempo.start_bpm) || !valid(tempo.end_bpm) {
        return Err(RejectedOp::InvalidValue("tempo must be a positive bpm".into()));
    }
    Ok(())
}

fn check_finite(value: f64, what: &str) -> Result<(), RejectedOp> {
    if !value.is_finite() {
        return Err(RejectedOp::InvalidValue(format!("{what} must be finite")));
    }
    Ok(())
}

fn check_state(state: &DocumentState) -> Result<(), ModelError> {
    let mut max_seen = Stamp::default();
    let mut note = |stamp: Stamp| max_seen = max_seen.max(stamp);

    for (id, section) in &state.sections {
        if *id != section.id {
            return Err(ModelError::Integrity(format!(
                "section keyed {id} carries id {}",
                section.id
            )));
        }
        if OrderKey::parse(section.position.get().as_str()).is_none() {
            return Err(ModelError::Integrity(format!(
                "section {id} has an invalid position key"
            )));
        }
        note(id.0);
        note(section.name.stamp());
        note(section.position.stamp());
        note(section.bar_count.stamp());
        note(section.tempo.stamp());
        section.chords.values().for_each(|c| note(c.stamp()));
        for (anim_id, anim) in &section.animations {
            if *anim_id != anim.id {
                return Err(ModelError::Integrity(format!(
                    "animation keyed {anim_id} carries id {}",
                    anim.id
                )));
            }
            note(anim.id.0);
            note(anim.property.stamp());
            note(anim.time.stamp());
            note(anim.value.stamp());
            note(anim.easing.stamp());
        }
    }

    for (id, comment) in &state.comments {
        if *id != comment.id {
            return Err(ModelError::Integrity(format!(
                "comment keyed {id} carries id {}",
                comment.id
            )));
        }
        if let Some(parent) = comment.parent {
            match state.comments.get(&parent) {
                None => {
                    return Err(ModelError::Integrity(format!(
                        "comment {id} replies to missing comment {parent}"
                    )));
                }
                Some(p) if p.is_reply() => {
                    return Err(ModelError::Integrity(format!(
                        "comment {id} replies to reply {parent}"
                    )));
                }
                Some(_) => {}
            }
        }
        note(id.0);
        note(comment.bar_start.stamp());
        note(comment.text.stamp());
        note(comment.resolved.stamp());
        comment.reactions.values().for_each(|r| note(r.stamp()));
    }

    if max_seen.lamport > state.clock.now() {
        return Err(ModelError::Integrity(format!(
            "clock {} is behind stamp {max_seen}",
            state.clock.now()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::model::types::{BarBeat, Chord, Easing};

    type TestResult<T> = Result<T, AppError>;

    fn insert(doc: &mut TimelineDocument, index: usize, name: &str) -> TestResult<Op> {
        Ok(doc.apply(LocalOp::InsertSection {
            index,
            name: name.to_string(),
            bar_count: 8,
            tempo: TempoCurve::constant(96.0),
        })?)
    }

    fn sync(from: &TimelineDocument, to: &mut TimelineDocument) -> TestResult<()> {
        let bytes = from.encode_full()?;
        to.load_full(&bytes)?;
        Ok(())
    }

    #[test]
    fn concurrent_inserts_at_same_index_both_survive() -> TestResult<()> {
        let mut base = TimelineDocument::new(ClientId(1));
        insert(&mut base, 0, "Intro")?;
        insert(&mut base, 1, "Verse")?;
        insert(&mut base, 2, "Outro")?;

        let mut one = TimelineDocument::new(ClientId(10));
        let mut two = TimelineDocument::new(ClientId(20));
        sync(&base, &mut one)?;
        sync(&base, &mut two)?;

        let chorus = insert(&mut one, 2, "Chorus")?;
        let bridge = insert(&mut two, 2, "Bridge")?;

        one.apply_remote(&bridge)?;
        two.apply_remote(&chorus)?;

        assert_eq!(one.section_names(), two.section_names());
        assert_eq!(one.encode_full()?, two.encode_full()?);
        let names = one.section_names();
        assert_eq!(names.len(), 5);
        assert_eq!(&names[..2], ["Intro", "Verse"]);
        assert_eq!(names[4], "Outro");
        Ok(())
    }

    #[test]
    fn reply_to_reply_is_rejected_not_flattened() -> TestResult<()> {
        let mut doc = TimelineDocument::new(ClientId(1));
        let root = doc.apply(LocalOp::AddComment {
            bar_start: 4,
            text: "tighten this".into(),
            author: UserId::new("ana"),
            created_at: 1,
        })?;
        let reply = doc.apply(LocalOp::ReplyComment {
            parent: CommentId(root.stamp),
            text: "agreed".into(),
            author: UserId::new("ben"),
            created_at: 2,
        })?;

        let before = doc.encode_full()?;
        let nested = doc.apply(LocalOp::ReplyComment {
            parent: CommentId(reply.stamp),
            text: "nested".into(),
            author: UserId::new("cy"),
            created_at: 3,
        });
        assert_eq!(
            nested,
            Err(RejectedOp::ReplyDepth {
                parent: CommentId(reply.stamp)
            })
        );
        assert_eq!(doc.encode_full()?, before);
        assert_eq!(doc.threads().len(), 1);
        assert_eq!(doc.threads()[0].replies.len(), 1);
        Ok(())
    }

    #[test]
    fn unknown_reference_is_rejected_without_side_effects() -> TestResult<()> {
        let mut doc = TimelineDocument::new(ClientId(1));
        insert(&mut doc, 0, "Intro")?;
        let before = doc.encode_full()?;

        let ghost = SectionId(Stamp::new(99, ClientId(42)));
        let op = Op {
            stamp: Stamp::new(100, ClientId(42)),
            kind: OpKind::SetChord {
                section: ghost,
                at: BarBeat::new(1, 1),
                chord: Some(Chord::new("Am")),
            },
        };
        assert_eq!(doc.apply_remote(&op), Err(RejectedOp::UnknownSection(ghost)));
        assert_eq!(doc.encode_full()?, before);
        assert_eq!(doc.clock(), 1);
        Ok(())
    }

    #[test]
    fn concurrent_reaction_toggles_keep_both_users() -> TestResult<()> {
        let mut base = TimelineDocument::new(ClientId(1));
        let root = base.apply(LocalOp::AddComment {
            bar_start: 1,
            text: "nice groove".into(),
            author: UserId::new("ana"),
            created_at: 1,
        })?;
        let comment = CommentId(root.stamp);

        let mut one = TimelineDocument::new(ClientId(2));
        let mut two = TimelineDocument::new(ClientId(3));
        sync(&base, &mut one)?;
        sync(&base, &mut two)?;

        let a = one.apply(LocalOp::ToggleReaction {
            comment,
            emoji: "👍".into(),
            user: UserId::new("ben"),
        })?;
        let b = two.apply(LocalOp::ToggleReaction {
            comment,
            emoji: "👍".into(),
            user: UserId::new("cy"),
        })?;
        one.apply_remote(&b)?;
        two.apply_remote(&a)?;

        for doc in [&one, &two] {
            let sets = doc.reactions(comment);
            let thumbs = sets.get("👍").cloned().unwrap_or_default();
            assert!(thumbs.contains(&UserId::new("ben")));
            assert!(thumbs.contains(&UserId::new("cy")));
        }

        let off = one.apply(LocalOp::ToggleReaction {
            comment,
            emoji: "👍".into(),
            user: UserId::new("ben"),
        })?;
        assert_eq!(
            off.kind,
            OpKind::ToggleReaction {
                comment,
                emoji: "👍".into(),
                user: UserId::new("ben"),
                on: false
            }
        );
        Ok(())
    }

    #[test]
    fn keyframes_order_by_time_and_merge_per_field() -> TestResult<()> {
        let mut doc = TimelineDocument::new(ClientId(1));
        let section = SectionId(insert(&mut doc, 0, "Intro")?.stamp);
        let late = doc.apply(LocalOp::AddAnimation {
            section,
            property: "opacity".into(),
            time: 4.0,
            value: 1.0,
            easing: Easing::EaseIn,
        })?;
        doc.apply(LocalOp::AddAnimation {
            section,
            property: "scale".into(),
            time: 1.0,
            value: 0.5,
            easing: Easing::Linear,
        })?;

        let mut other = TimelineDocument::new(ClientId(2));
        sync(&doc, &mut other)?;

        let animation = AnimationId(late.stamp);
        let time_edit = doc.apply(LocalOp::SetKeyframe {
            section,
            animation,
            field: KeyframeField::Time(0.5),
        })?;
        let value_edit = other.apply(LocalOp::SetKeyframe {
            section,
            animation,
            field: KeyframeField::Value(0.25),
        })?;
        doc.apply_remote(&value_edit)?;
        other.apply_remote(&time_edit)?;

        assert_eq!(doc.encode_full()?, other.encode_full()?);
        let frames = doc
            .section(section)
            .map(Section::keyframes)
            .unwrap_or_default();
        assert_eq!(frames[0].id, animation);
        assert_eq!(*frames[0].time.get(), 0.5);
        assert_eq!(*frames[0].value.get(), 0.25);
        Ok(())
    }

    #[test]
    fn move_section_reorders_and_delete_hides() -> TestResult<()> {
        let mut doc = TimelineDocument::new(ClientId(1));
        let intro = SectionId(insert(&mut doc, 0, "Intro")?.stamp);
        insert(&mut doc, 1, "Verse")?;
        let outro = SectionId(insert(&mut doc, 2, "Outro")?.stamp);

        doc.apply(LocalOp::MoveSection {
            section: outro,
            index: 0,
        })?;
        assert_eq!(doc.section_names(), ["Outro", "Intro", "Verse"]);

        doc.apply(LocalOp::DeleteSection { section: intro })?;
        assert_eq!(doc.section_names(), ["Outro", "Verse"]);
        assert_eq!(doc.total_bars(), 16);

        // Edits to a tombstoned section are accepted but stay invisible.
        doc.apply(LocalOp::SetChord {
            section: intro,
            at: BarBeat::new(1, 1),
            chord: Chord::new("C"),
        })?;
        assert!(doc.section(intro).is_none());
        Ok(())
    }

    #[test]
    fn load_full_rejects_garbage_and_keeps_state() -> TestResult<()> {
        let mut doc = TimelineDocument::new(ClientId(1));
        insert(&mut doc, 0, "Intro")?;
        let before = doc.encode_full()?;

        assert!(doc.load_full(&[0xff, 0xff, 0xff]).is_err());
        assert_eq!(doc.encode_full()?, before);
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() -> TestResult<()> {
        let mut doc = TimelineDocument::new(ClientId(1));
        let zero_bars = doc.apply(LocalOp::InsertSection {
            index: 0,
            name: "Empty".into(),
            bar_count: 0,
            tempo: TempoCurve::default(),
        });
        assert!(matches!(zero_bars, Err(RejectedOp::InvalidValue(_))));

        let bad_key = Op {
            stamp: Stamp::new(1, ClientId(2)),
            kind: OpKind::InsertSection {
                position: serde_json::from_str("\"not/a key\"")
                    .map_err(|e| AppError::Internal(e.to_string()))?,
                name: "x".into(),
                bar_count: 4,
                tempo: TempoCurve::default(),
            },
        };
        assert_eq!(doc.apply_remote(&bad_key), Err(RejectedOp::InvalidPosition));
        Ok(())
    }

    #[test]
    fn bar_counts_are_bounded_and_totals_do_not_overflow() -> TestResult<()> {
        let mut doc = TimelineDocument::new(ClientId(1));
        for index in 0..2 {
            doc.apply(LocalOp::InsertSection {
                index,
                name: format!("Drone {index}"),
                bar_count: MAX_BAR_COUNT,
                tempo: TempoCurve::constant(60.0),
            })?;
        }
        assert_eq!(doc.total_bars(), 2 * u64::from(MAX_BAR_COUNT));
        assert_eq!(doc.summary().section_count, 2);

        let too_long = Op {
            stamp: Stamp::new(doc.clock() + 1, ClientId(2)),
            kind: OpKind::InsertSection {
                position: OrderKey::between(None, None, ClientId(2)),
                name: "Endless".into(),
                bar_count: u32::MAX,
                tempo: TempoCurve::constant(60.0),
            },
        };
        assert!(matches!(
            doc.apply_remote(&too_long),
            Err(RejectedOp::InvalidValue(_))
        ));

        let section = doc.sections()[0].id;
        let resize = doc.apply(LocalOp::SetBarCount {
            section,
            bar_count: MAX_BAR_COUNT + 1,
        });
        assert!(matches!(resize, Err(RejectedOp::InvalidValue(_))));
        assert_eq!(doc.total_bars(), 2 * u64::from(MAX_BAR_COUNT));
        Ok(())
    }

    #[test]
    fn stamps_far_ahead_of_the_clock_are_rejected() -> TestResult<()> {
        let mut doc = TimelineDocument::new(ClientId(1));
        insert(&mut doc, 0, "Intro")?;
        let before = doc.encode_full()?;

        let runaway = Op {
            stamp: Stamp::new(u64::MAX, ClientId(2)),
            kind: OpKind::InsertSection {
                position: OrderKey::between(None, None, ClientId(2)),
                name: "Runaway".into(),
                bar_count: 4,
                tempo: TempoCurve::default(),
            },
        };
        assert!(matches!(
            doc.apply_remote(&runaway),
            Err(RejectedOp::InvalidValue(_))
        ));
        assert_eq!(doc.encode_full()?, before);
        assert_eq!(doc.clock(), 1);

        // Local edits keep working after the refusal.
        insert(&mut doc, 1, "Verse")?;
        assert_eq!(doc.clock(), 2);

        let within = Op {
            stamp: Stamp::new(doc.clock() + MAX_CLOCK_SKEW, ClientId(2)),
            kind: OpKind::SetSectionName {
                section: doc.sections()[0].id,
                name: "Far but fine".into(),
            },
        };
        doc.apply_remote(&within)?;
        assert_eq!(doc.clock(), 2 + MAX_CLOCK_SKEW);
        Ok(())
    }

    #[test]
    fn exhausted_clock_refuses_local_edits() -> TestResult<()> {
        let mut doc = TimelineDocument::new(ClientId(1));
        let mut state = doc.state.clone();
        state.clock = LamportClock::at(u64::MAX);
        doc.load_full(&postcard::to_allocvec(&state)?)?;

        let refused = doc.apply(LocalOp::InsertSection {
            index: 0,
            name: "Late".into(),
            bar_count: 4,
            tempo: TempoCurve::default(),
        });
        assert!(matches!(refused, Err(RejectedOp::InvalidValue(_))));
        assert!(doc.sections().is_empty());
        assert_eq!(doc.clock(), u64::MAX);
        Ok(())
    }
}
