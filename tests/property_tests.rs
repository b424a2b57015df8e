use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use tandem::ids::{ClientId, UserId};
use tandem::model::{BarBeat, Chord, LocalOp, Op, TempoCurve, TimelineDocument};

#[derive(Debug, Clone)]
enum Edit {
    Insert(usize, String),
    Rename(usize, String),
    Resize(usize, u32),
    Move(usize, usize),
    Delete(usize),
    Chord(usize, u32, String),
    Comment(u32, String),
}

impl Edit {
    /// Resolve against the replica's current view. `None` when the edit has
    /// nothing to act on.
    fn local(&self, doc: &TimelineDocument) -> Option<LocalOp> {
        let ids: Vec<_> = doc.sections().iter().map(|s| s.id).collect();
        let pick = |i: usize| (!ids.is_empty()).then(|| ids[i % ids.len()]);

        Some(match self {
            Edit::Insert(index, name) => LocalOp::InsertSection {
                index: index % (ids.len() + 1),
                name: name.clone(),
                bar_count: 4,
                tempo: TempoCurve::constant(120.0),
            },
            Edit::Rename(i, name) => LocalOp::SetSectionName {
                section: pick(*i)?,
                name: name.clone(),
            },
            Edit::Resize(i, bars) => LocalOp::SetBarCount {
                section: pick(*i)?,
                bar_count: *bars,
            },
            Edit::Move(i, to) => LocalOp::MoveSection {
                section: pick(*i)?,
                index: to % ids.len().max(1),
            },
            Edit::Delete(i) => LocalOp::DeleteSection {
                section: pick(*i)?,
            },
            Edit::Chord(i, bar, symbol) => LocalOp::SetChord {
                section: pick(*i)?,
                at: BarBeat::new(*bar, 1),
                chord: Chord::new(symbol.clone()),
            },
            Edit::Comment(bar, text) => LocalOp::AddComment {
                bar_start: *bar,
                text: text.clone(),
                author: UserId::new("prop"),
                created_at: 0,
            },
        })
    }
}

fn edit() -> impl Strategy<Value = Edit> {
    let name = "[A-Z][a-z]{0,6}";
    prop_oneof![
        (0..8usize, name).prop_map(|(i, s)| Edit::Insert(i, s)),
        (0..8usize, name).prop_map(|(i, s)| Edit::Rename(i, s)),
        (0..8usize, 1..32u32).prop_map(|(i, n)| Edit::Resize(i, n)),
        (0..8usize, 0..8usize).prop_map(|(i, to)| Edit::Move(i, to)),
        (0..8usize).prop_map(Edit::Delete),
        (0..8usize, 1..5u32, "[A-G]m?7?").prop_map(|(i, bar, s)| Edit::Chord(i, bar, s)),
        (1..16u32, "[a-z ]{1,12}").prop_map(|(bar, s)| Edit::Comment(bar, s)),
    ]
}

fn edits(min: usize, max: usize) -> impl Strategy<Value = Vec<Edit>> {
    prop::collection::vec(edit(), min..max)
}

/// Run `edits` on a replica forked from `base` and return the ops produced.
fn fork_and_edit(
    base: &[u8],
    client: u64,
    edits: &[Edit],
) -> Result<Vec<Op>, TestCaseError> {
    let mut doc = TimelineDocument::from_full(ClientId(client), base)
        .map_err(|e| TestCaseError::fail(format!("load base: {e}")))?;
    let mut ops = Vec::new();
    for edit in edits {
        if let Some(local) = edit.local(&doc) {
            let op = doc
                .apply(local)
                .map_err(|e| TestCaseError::fail(format!("local edit refused: {e}")))?;
            ops.push(op);
        }
    }
    Ok(ops)
}

fn merge(base: &[u8], batches: &[&[Op]]) -> Result<Vec<u8>, TestCaseError> {
    let mut doc = TimelineDocument::from_full(ClientId(0), base)
        .map_err(|e| TestCaseError::fail(format!("load base: {e}")))?;
    for batch in batches {
        for op in *batch {
            doc.apply_remote(op)
                .map_err(|e| TestCaseError::fail(format!("remote op refused: {e}")))?;
        }
    }
    doc.encode_full()
        .map_err(|e| TestCaseError::fail(format!("encode: {e}")))
}

fn base_with(seed: &[Edit]) -> Result<Vec<u8>, TestCaseError> {
    let ops = fork_and_edit(
        &TimelineDocument::new(ClientId(0))
            .encode_full()
            .map_err(|e| TestCaseError::fail(e.to_string()))?,
        9,
        seed,
    )?;
    merge(
        &TimelineDocument::new(ClientId(0))
            .encode_full()
            .map_err(|e| TestCaseError::fail(e.to_string()))?,
        &[&ops],
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_replicas_converge_in_any_merge_order(
        seed in edits(0, 6),
        a in edits(1, 12),
        b in edits(1, 12),
        c in edits(1, 12),
    ) {
        let base = base_with(&seed)?;
        let ops_a = fork_and_edit(&base, 1, &a)?;
        let ops_b = fork_and_edit(&base, 2, &b)?;
        let ops_c = fork_and_edit(&base, 3, &c)?;

        let abc = merge(&base, &[&ops_a, &ops_b, &ops_c])?;
        let bca = merge(&base, &[&ops_b, &ops_c, &ops_a])?;
        let cba = merge(&base, &[&ops_c, &ops_b, &ops_a])?;

        prop_assert_eq!(&abc, &bca, "merge order a,b,c vs b,c,a diverged");
        prop_assert_eq!(&abc, &cba, "merge order a,b,c vs c,b,a diverged");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn prop_redelivery_is_a_no_op(
        seed in edits(0, 6),
        a in edits(1, 16),
    ) {
        let base = base_with(&seed)?;
        let ops = fork_and_edit(&base, 4, &a)?;

        let once = merge(&base, &[&ops])?;
        let twice = merge(&base, &[&ops, &ops])?;

        prop_assert_eq!(once, twice, "re-applying ops changed the state");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_concurrent_renames_pick_the_same_winner(
        first in 1..1_000u64,
        second in 1..1_000u64,
        left in "[A-Z][a-z]{0,6}",
        right in "[A-Z][a-z]{0,6}",
    ) {
        prop_assume!(first != second);
        let base = base_with(&[Edit::Insert(0, "Intro".to_string())])?;

        let from_first = fork_and_edit(&base, first, &[Edit::Rename(0, left.clone())])?;
        let from_second = fork_and_edit(&base, second, &[Edit::Rename(0, right.clone())])?;

        let one = merge(&base, &[&from_first, &from_second])?;
        let two = merge(&base, &[&from_second, &from_first])?;
        prop_assert_eq!(&one, &two);

        // Same lamport time: the higher client id wins.
        let merged = TimelineDocument::from_full(ClientId(0), &one)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        let expected = if first > second { left } else { right };
        prop_assert_eq!(merged.section_names(), vec![expected]);
    }
}
