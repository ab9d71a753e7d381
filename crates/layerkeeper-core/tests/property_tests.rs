//! # Property-Based Tests
//!
//! Invariants of the record store, the merge engine, the selection algebra
//! and trait flattening, checked with proptest.

use layerkeeper_core::schema::TraitFlattener;
use layerkeeper_core::{
    AttributeModel, AttributeSelection, AttributeValue, AttributeValueType, ChangeState, CiId,
    CiSelection, LayerId, LayerSet, MergeEngine, RecursiveTrait, Selection, Session,
    TimeThreshold, TraitAttribute, TraitAttributeTemplate, TraitId, TraitOrigin, UserId,
};
use proptest::collection::{btree_set, vec};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

fn layer(i: usize) -> LayerId {
    LayerId::new(format!("l{i}")).expect("layer id")
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u8),
    Remove,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0u8..3).prop_map(Op::Insert), Just(Op::Remove)]
}

/// What one layer holds for the merged key.
#[derive(Debug, Clone)]
enum LayerState {
    Empty,
    Live(u8),
    Removed,
    Masked,
}

fn layer_state() -> impl Strategy<Value = LayerState> {
    prop_oneof![
        Just(LayerState::Empty),
        (0u8..5).prop_map(LayerState::Live),
        Just(LayerState::Removed),
        Just(LayerState::Masked),
    ]
}

fn selection() -> impl Strategy<Value = Selection<u8>> {
    prop_oneof![
        Just(Selection::All),
        Just(Selection::None),
        btree_set(0u8..8, 0..5).prop_map(|s| Selection::specific(s)),
        btree_set(0u8..8, 0..5).prop_map(|s| Selection::all_except(s)),
    ]
}

proptest! {
    /// Any insert/remove sequence walks the state machine:
    /// New, then Changed*, Removed, Renewed, Changed*, Removed, ...
    #[test]
    fn state_machine_closure(ops in vec(op(), 1..30)) {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let l = layer(0);
        let mut uow = session.begin(UserId::new("prop")).expect("begin");

        let mut live: Option<u8> = None;
        let mut ever_written = false;
        for op in &ops {
            match op {
                Op::Insert(v) => {
                    let value = AttributeValue::Integer(i64::from(*v));
                    let (record, changed) =
                        AttributeModel::insert_attribute(&mut uow, ci, "k", value, &l)
                            .expect("insert");
                    prop_assert_eq!(changed, live != Some(*v));
                    if changed {
                        let expected = match (ever_written, live) {
                            (false, _) => ChangeState::New,
                            (true, None) => ChangeState::Renewed,
                            (true, Some(_)) => ChangeState::Changed,
                        };
                        prop_assert_eq!(record.state, expected);
                    }
                    live = Some(*v);
                    ever_written = true;
                }
                Op::Remove => {
                    let result = AttributeModel::remove_attribute(&mut uow, ci, "k", &l);
                    if !ever_written {
                        prop_assert!(result.is_err());
                    } else {
                        let (record, changed) = result.expect("remove");
                        prop_assert_eq!(changed, live.is_some());
                        prop_assert_eq!(record.state, ChangeState::Removed);
                        live = None;
                    }
                }
            }
        }

        let history = AttributeModel::attribute_history(uow.reader(), ci, "k", &l)
            .expect("history");
        for pair in history.windows(2) {
            prop_assert!(pair[0].timestamp <= pair[1].timestamp);
            prop_assert!(!(pair[0].state.is_removed() && pair[1].state.is_removed()));
        }
    }

    /// The merged value comes from the first layer holding a non-removed
    /// record; a mask there hides the key. Every layer with a record is in
    /// the provenance stack.
    #[test]
    fn merge_precedence(states in vec(layer_state(), 1..6)) {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let layers: Vec<LayerId> = (0..states.len()).map(layer).collect();
        let set = LayerSet::new(layers.clone()).expect("layer set");
        let mut uow = session.begin(UserId::new("prop")).expect("begin");

        for (l, state) in layers.iter().zip(&states) {
            match state {
                LayerState::Empty => {}
                LayerState::Live(v) => {
                    AttributeModel::insert_attribute(
                        &mut uow, ci, "k", AttributeValue::Integer(i64::from(*v)), l,
                    ).expect("insert");
                }
                LayerState::Removed => {
                    AttributeModel::insert_attribute(
                        &mut uow, ci, "k", AttributeValue::Integer(-1), l,
                    ).expect("insert");
                    AttributeModel::remove_attribute(&mut uow, ci, "k", l).expect("remove");
                }
                LayerState::Masked => {
                    AttributeModel::insert_mask(&mut uow, ci, "k", l).expect("mask");
                }
            }
        }

        let expected = states.iter().find_map(|s| match s {
            LayerState::Live(v) => Some(Some(i64::from(*v))),
            LayerState::Masked => Some(None),
            LayerState::Empty | LayerState::Removed => None,
        }).flatten();
        let stack: Vec<LayerId> = layers
            .iter()
            .zip(&states)
            .filter(|(_, s)| !matches!(s, LayerState::Empty))
            .map(|(l, _)| l.clone())
            .collect();

        let merged = MergeEngine::get_merged_attribute(
            uow.reader(), ci, "k", &set, TimeThreshold::Latest,
        ).expect("merge");
        prop_assert_eq!(merged.as_ref().and_then(|m| m.value().as_integer()), expected);
        if let Some(merged) = merged {
            prop_assert_eq!(merged.layer_stack, stack);
        }

        let batch = MergeEngine::get_merged_attributes(
            uow.reader(),
            &CiSelection::All,
            &AttributeSelection::All,
            &set,
            TimeThreshold::Latest,
        ).expect("batch");
        let batched = batch.get(&ci).and_then(|m| m.get("k")).and_then(|m| m.value().as_integer());
        prop_assert_eq!(batched, expected);
    }

    /// Selection algebra agrees with set algebra over a finite universe.
    #[test]
    fn selection_algebra_laws(a in selection(), b in selection(), c in selection()) {
        let universe: BTreeSet<u8> = (0u8..8).collect();
        let resolve = |s: &Selection<u8>| s.resolve(&universe);

        let union: BTreeSet<u8> = resolve(&a).union(&resolve(&b)).copied().collect();
        prop_assert_eq!(resolve(&a.union(&b)), union);
        let inter: BTreeSet<u8> = resolve(&a).intersection(&resolve(&b)).copied().collect();
        prop_assert_eq!(resolve(&a.intersect(&b)), inter);
        let diff: BTreeSet<u8> = resolve(&a).difference(&resolve(&b)).copied().collect();
        prop_assert_eq!(resolve(&a.except(&b)), diff);

        prop_assert_eq!(
            resolve(&a.union(&b).union(&c)),
            resolve(&a.union(&b.union(&c)))
        );
        prop_assert_eq!(
            resolve(&a.intersect(&b).intersect(&c)),
            resolve(&a.intersect(&b.intersect(&c)))
        );
        prop_assert_eq!(resolve(&Selection::all_except(Vec::<u8>::new())), universe);
    }

    /// Flattening the same definitions twice yields equal results.
    #[test]
    fn flattening_is_deterministic(
        edges in vec((0usize..6, 0usize..6), 0..10),
        attributes in vec(0usize..4, 6),
    ) {
        let ids: Vec<TraitId> = (0..6)
            .map(|i| TraitId::new(format!("t{i}")).expect("trait id"))
            .collect();
        let mut sources: BTreeMap<TraitId, RecursiveTrait> = BTreeMap::new();
        for (i, id) in ids.iter().enumerate() {
            let mut t = RecursiveTrait::new(id.clone(), TraitOrigin::Data);
            t.required_attributes = vec![TraitAttribute::new(
                format!("a{}", attributes[i]),
                TraitAttributeTemplate::scalar(format!("n{i}"), AttributeValueType::Text),
            )];
            sources.insert(id.clone(), t);
        }
        for (from, to) in edges {
            if let Some(t) = sources.get_mut(&ids[from])
                && !t.required_traits.contains(&ids[to])
            {
                t.required_traits.push(ids[to].clone());
            }
        }

        let first = TraitFlattener::new(&sources).flatten_all();
        let second = TraitFlattener::new(&sources).flatten_all();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.traits.len() + first.errors.len(), sources.len());
    }
}
