//! # Validation Tier Tests (T0-T5)
//!
//! End-to-end behaviour through the public API. A failing tier means the
//! store can no longer be trusted as a system of record.
//!
//! ## Tiers
//! - T0: Record state machine
//! - T1: Layer merge and masking
//! - T2: Trait evaluation
//! - T3: Config records
//! - T4: Changeset ledger
//! - T5: Persistence and point-in-time reads

use layerkeeper_core::{
    AttributeConstraint, AttributeModel, AttributeValue, AttributeValueType, ChangeState,
    ChangesetModel, CiId, CiSelection, EffectiveTraitEngine, LayerId, LayerModel, LayerSet,
    LayeredWriter, MaskHandlingForRemoval, MergeEngine, MetaConfiguration,
    OtherLayersValueHandling, PolicyOutcome, PredicateId, PredicateModel, RecursiveTrait,
    RelationDirection, RelationKey, RelationModel, Session, StoreError, TimeThreshold,
    TraitAttribute, TraitAttributeTemplate, TraitDefinitionModel, TraitId, TraitOrigin,
    TraitRelation, UserId,
};

fn layer(id: &str) -> LayerId {
    LayerId::new(id).expect("layer id")
}

fn user() -> UserId {
    UserId::new("tier")
}

// =============================================================================
// TIER T0: RECORD STATE MACHINE
// =============================================================================

mod t0_state_machine {
    use super::*;

    /// T0.1: New, unchanged, Changed, Removed, Renewed.
    #[test]
    fn insert_remove_renew_walk() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let base = layer("base");
        let mut uow = session.begin(user()).expect("begin");

        let (r, changed) =
            AttributeModel::insert_attribute(&mut uow, ci, "k", AttributeValue::text("v1"), &base)
                .expect("insert v1");
        assert!(changed);
        assert_eq!(r.state, ChangeState::New);

        let (r, changed) =
            AttributeModel::insert_attribute(&mut uow, ci, "k", AttributeValue::text("v1"), &base)
                .expect("insert v1 again");
        assert!(!changed);
        assert_eq!(r.state, ChangeState::New);

        let (r, changed) =
            AttributeModel::insert_attribute(&mut uow, ci, "k", AttributeValue::text("v2"), &base)
                .expect("insert v2");
        assert!(changed);
        assert_eq!(r.state, ChangeState::Changed);

        let (r, changed) =
            AttributeModel::remove_attribute(&mut uow, ci, "k", &base).expect("remove");
        assert!(changed);
        assert_eq!(r.state, ChangeState::Removed);
        assert_eq!(r.value, AttributeValue::text("v2"));

        let (r, changed) =
            AttributeModel::insert_attribute(&mut uow, ci, "k", AttributeValue::text("v1"), &base)
                .expect("renew");
        assert!(changed);
        assert_eq!(r.state, ChangeState::Renewed);

        let history = AttributeModel::attribute_history(uow.reader(), ci, "k", &base)
            .expect("history");
        let states: Vec<ChangeState> = history.iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![
                ChangeState::New,
                ChangeState::Changed,
                ChangeState::Removed,
                ChangeState::Renewed
            ]
        );
    }

    /// T0.2: Removing what was never written is NotFound.
    #[test]
    fn remove_of_unknown_key_fails() {
        let mut session = Session::new();
        let mut uow = session.begin(user()).expect("begin");
        let result =
            AttributeModel::remove_attribute(&mut uow, CiId::new_random(), "k", &layer("base"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    /// T0.3: Relations follow the same state machine and refuse self loops.
    #[test]
    fn relation_state_machine() {
        let mut session = Session::new();
        let base = layer("base");
        let (a, b) = (CiId::new_random(), CiId::new_random());
        let key = RelationKey::new(a, b, PredicateId::new("runs_on").expect("predicate"));
        let mut uow = session.begin(user()).expect("begin");

        let (r, _) = RelationModel::insert_relation(&mut uow, &key, &base).expect("insert");
        assert_eq!(r.state, ChangeState::New);
        let (_, changed) = RelationModel::insert_relation(&mut uow, &key, &base).expect("again");
        assert!(!changed);
        let (r, _) = RelationModel::remove_relation(&mut uow, &key, &base).expect("remove");
        assert_eq!(r.state, ChangeState::Removed);
        let (r, _) = RelationModel::insert_relation(&mut uow, &key, &base).expect("renew");
        assert_eq!(r.state, ChangeState::Renewed);

        let self_loop = RelationKey::new(a, a, key.predicate.clone());
        assert!(matches!(
            RelationModel::insert_relation(&mut uow, &self_loop, &base),
            Err(StoreError::InvalidState(_))
        ));
    }
}

// =============================================================================
// TIER T1: LAYER MERGE AND MASKING
// =============================================================================

mod t1_merge {
    use super::*;

    fn layers() -> (LayerId, LayerId, LayerSet) {
        let (top, base) = (layer("override"), layer("base"));
        let set = LayerSet::new([top.clone(), base.clone()]).expect("set");
        (top, base, set)
    }

    /// T1.1: The first layer with a live record wins; the stack lists all.
    #[test]
    fn precedence_and_provenance() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let (top, base, set) = layers();
        let mut uow = session.begin(user()).expect("begin");
        AttributeModel::insert_attribute(&mut uow, ci, "os", AttributeValue::text("linux"), &base)
            .expect("base");
        AttributeModel::insert_attribute(&mut uow, ci, "os", AttributeValue::text("bsd"), &top)
            .expect("top");

        let merged = MergeEngine::get_merged_attribute(
            uow.reader(),
            ci,
            "os",
            &set,
            TimeThreshold::Latest,
        )
        .expect("merge")
        .expect("present");
        assert_eq!(merged.value(), &AttributeValue::text("bsd"));
        assert_eq!(merged.layer_stack, vec![top.clone(), base.clone()]);

        AttributeModel::remove_attribute(&mut uow, ci, "os", &top).expect("remove");
        let merged = MergeEngine::get_merged_attribute(
            uow.reader(),
            ci,
            "os",
            &set,
            TimeThreshold::Latest,
        )
        .expect("merge")
        .expect("present");
        assert_eq!(merged.value(), &AttributeValue::text("linux"));
    }

    /// T1.2: A masking removal hides the lower layer in this set only.
    #[test]
    fn mask_hides_lower_layer() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let (top, base, set) = layers();
        let mut uow = session.begin(user()).expect("begin");
        AttributeModel::insert_attribute(&mut uow, ci, "os", AttributeValue::text("linux"), &base)
            .expect("base");

        let outcome = LayeredWriter::remove_attribute(
            &mut uow,
            ci,
            "os",
            &top,
            &set,
            MaskHandlingForRemoval::ApplyMaskIfNecessary,
        )
        .expect("mask");
        assert!(outcome.changed());
        assert!(outcome.record().expect("record").is_mask());

        let masked = MergeEngine::get_merged_attribute(
            uow.reader(),
            ci,
            "os",
            &set,
            TimeThreshold::Latest,
        )
        .expect("merge");
        assert!(masked.is_none());

        let base_only = MergeEngine::get_merged_attribute(
            uow.reader(),
            ci,
            "os",
            &LayerSet::single(base),
            TimeThreshold::Latest,
        )
        .expect("merge");
        assert!(base_only.is_some());
    }

    /// T1.3: A write already provided by lower layers is skipped on request.
    #[test]
    fn take_into_account_skips_redundant_write() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let (top, base, set) = layers();
        let mut uow = session.begin(user()).expect("begin");
        AttributeModel::insert_attribute(&mut uow, ci, "os", AttributeValue::text("linux"), &base)
            .expect("base");

        let skipped = LayeredWriter::insert_attribute(
            &mut uow,
            ci,
            "os",
            AttributeValue::text("linux"),
            &top,
            &set,
            OtherLayersValueHandling::TakeIntoAccount,
        )
        .expect("skip");
        assert_eq!(skipped, PolicyOutcome::Skipped);

        let forced = LayeredWriter::insert_attribute(
            &mut uow,
            ci,
            "os",
            AttributeValue::text("linux"),
            &top,
            &set,
            OtherLayersValueHandling::ForceWrite,
        )
        .expect("force");
        assert!(forced.changed());
    }

    /// T1.4: Relation masks behave like attribute masks.
    #[test]
    fn relation_mask() {
        let mut session = Session::new();
        let (top, base, set) = layers();
        let key = RelationKey::new(
            CiId::new_random(),
            CiId::new_random(),
            PredicateId::new("runs_on").expect("predicate"),
        );
        let mut uow = session.begin(user()).expect("begin");
        RelationModel::insert_relation(&mut uow, &key, &base).expect("insert");
        LayeredWriter::remove_relation(
            &mut uow,
            &key,
            &top,
            &set,
            MaskHandlingForRemoval::ApplyMaskIfNecessary,
        )
        .expect("mask");

        let merged =
            MergeEngine::get_merged_relation(uow.reader(), &key, &set, TimeThreshold::Latest)
                .expect("merge");
        assert!(merged.is_none());
    }

    /// T1.5: Only empty layers can be deleted.
    #[test]
    fn layer_deletion_requires_empty_layer() {
        let mut session = Session::new();
        let (top, base, _) = layers();
        let mut uow = session.begin(user()).expect("begin");
        LayerModel::create_layer_if_not_exists(&mut uow, &top, "overrides").expect("top");
        LayerModel::create_layer_if_not_exists(&mut uow, &base, "inventory").expect("base");
        AttributeModel::insert_attribute(
            &mut uow,
            CiId::new_random(),
            "os",
            AttributeValue::text("linux"),
            &base,
        )
        .expect("insert");

        assert!(!LayerModel::try_delete_layer(&mut uow, &base).expect("refused"));
        assert!(LayerModel::try_delete_layer(&mut uow, &top).expect("deleted"));
        assert!(matches!(
            LayerModel::build_layer_set(uow.reader(), &[top, base]),
            Err(StoreError::NotFound(_))
        ));
    }
}

// =============================================================================
// TIER T2: TRAIT EVALUATION
// =============================================================================

mod t2_traits {
    use super::*;

    fn group_trait() -> RecursiveTrait {
        let mut t = RecursiveTrait::new(TraitId::new("group").expect("trait id"), TraitOrigin::Data);
        t.required_attributes = vec![TraitAttribute::new(
            "id",
            TraitAttributeTemplate::scalar("id", AttributeValueType::Text)
                .with(AttributeConstraint::text_min_length(1)),
        )];
        t.required_relations = vec![
            TraitRelation::new(
                "members",
                PredicateId::new("has_member").expect("predicate"),
                RelationDirection::Forward,
            )
            .cardinality(1, None),
        ];
        t
    }

    /// T2.1: A stored trait definition is evaluated against merged data.
    #[test]
    fn stored_trait_matches_only_valid_cis() {
        let mut session = Session::new();
        let meta = MetaConfiguration::single(layer("meta"));
        let data = LayerSet::single(layer("data"));
        let (x, y, member) = (CiId::new_random(), CiId::new_random(), CiId::new_random());
        let has_member = PredicateId::new("has_member").expect("predicate");

        let mut uow = session.begin(user()).expect("begin");
        TraitDefinitionModel::insert_or_update(&mut uow, &meta, group_trait()).expect("trait");
        AttributeModel::insert_attribute(&mut uow, x, "id", AttributeValue::text("x1"), &layer("data"))
            .expect("x");
        AttributeModel::insert_attribute(&mut uow, y, "id", AttributeValue::text(""), &layer("data"))
            .expect("y");
        for ci in [x, y] {
            RelationModel::insert_relation(
                &mut uow,
                &RelationKey::new(ci, member, has_member.clone()),
                &layer("data"),
            )
            .expect("relation");
        }

        let traits = uow.active_traits(&meta.layers).expect("traits");
        let group = traits
            .require(&TraitId::new("group").expect("trait id"))
            .expect("group active");

        let found = EffectiveTraitEngine::get_effective_traits_for_trait(
            uow.reader(),
            group,
            &CiSelection::All,
            &data,
            TimeThreshold::Latest,
        )
        .expect("evaluate");
        assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![x]);
        assert_eq!(found[&x].text("id"), Some("x1"));
        assert_eq!(found[&x].related_cis("members"), vec![member]);

        let lacking = EffectiveTraitEngine::cis_lacking_trait(
            uow.reader(),
            group,
            &CiSelection::All,
            &data,
            TimeThreshold::Latest,
        )
        .expect("lacking");
        assert!(lacking.contains(&y));
    }

    /// T2.2: Mutually requiring traits are excluded with a cycle error.
    #[test]
    fn trait_cycle_is_reported() {
        let mut session = Session::new();
        let meta = MetaConfiguration::single(layer("meta"));
        let (a_id, b_id) = (
            TraitId::new("a").expect("trait id"),
            TraitId::new("b").expect("trait id"),
        );
        let mut a = group_trait();
        a.id = a_id.clone();
        a.required_traits = vec![b_id.clone()];
        let mut b = group_trait();
        b.id = b_id.clone();
        b.required_traits = vec![a_id.clone()];

        let mut uow = session.begin(user()).expect("begin");
        TraitDefinitionModel::insert_or_update(&mut uow, &meta, a).expect("a");
        TraitDefinitionModel::insert_or_update(&mut uow, &meta, b).expect("b");
        let traits = uow.active_traits(&meta.layers).expect("traits");

        assert!(matches!(traits.require(&a_id), Err(StoreError::TraitCycle(_))));
        assert!(matches!(traits.require(&b_id), Err(StoreError::TraitCycle(_))));
        assert!(traits.require(&TraitId::new("named").expect("trait id")).is_ok());
    }
}

// =============================================================================
// TIER T3: CONFIG RECORDS
// =============================================================================

mod t3_config_records {
    use super::*;

    /// T3.1: Predicates are records; checked relations need a known one.
    #[test]
    fn predicate_lifecycle() {
        let mut session = Session::new();
        let meta = MetaConfiguration::single(layer("meta"));
        let owns = PredicateId::new("owns").expect("predicate");
        let key = RelationKey::new(CiId::new_random(), CiId::new_random(), owns.clone());

        let mut uow = session.begin(user()).expect("begin");
        let write = PredicateModel::insert_or_update(&mut uow, &meta, owns.clone(), "owns", "owned by")
            .expect("predicate");
        assert!(write.changed);
        let again = PredicateModel::insert_or_update(&mut uow, &meta, owns.clone(), "owns", "owned by")
            .expect("predicate again");
        assert!(!again.changed);
        assert_eq!(again.stored.ci, write.stored.ci);

        RelationModel::insert_relation_checked(&mut uow, &key, &layer("data"), &meta.layers)
            .expect("known predicate");

        assert!(PredicateModel::try_delete(&mut uow, &meta, &owns).expect("delete"));
        let other = RelationKey::new(key.to, key.from, owns);
        assert!(matches!(
            RelationModel::insert_relation_checked(&mut uow, &other, &layer("data"), &meta.layers),
            Err(StoreError::InvalidState(_))
        ));
    }

    /// T3.2: Trait definitions round-trip through the meta layer.
    #[test]
    fn trait_definition_round_trip() {
        let mut session = Session::new();
        let meta = MetaConfiguration::single(layer("meta"));
        let mut definition =
            RecursiveTrait::new(TraitId::new("host").expect("trait id"), TraitOrigin::Data);
        definition.required_attributes = vec![TraitAttribute::new(
            "hostname",
            TraitAttributeTemplate::scalar("hostname", AttributeValueType::Text),
        )];
        definition.required_traits = vec![TraitId::new("named").expect("trait id")];

        let mut uow = session.begin(user()).expect("begin");
        TraitDefinitionModel::insert_or_update(&mut uow, &meta, definition.clone())
            .expect("insert");
        let stored = TraitDefinitionModel::get_by_id(
            uow.reader(),
            &definition.id,
            &meta.layers,
            TimeThreshold::Latest,
        )
        .expect("get")
        .expect("present");
        assert_eq!(stored, definition);
    }
}

// =============================================================================
// TIER T4: CHANGESET LEDGER
// =============================================================================

mod t4_changesets {
    use super::*;

    /// T4.1: One changeset per (unit of work, layer), created lazily.
    #[test]
    fn one_changeset_per_layer_and_unit_of_work() {
        let mut session = Session::new();
        let (a, b) = (layer("a"), layer("b"));
        let ci = CiId::new_random();

        let mut uow = session.begin(user()).expect("begin");
        assert!(uow.created_changesets().is_empty());
        let (r1, _) =
            AttributeModel::insert_attribute(&mut uow, ci, "x", AttributeValue::text("1"), &a)
                .expect("a");
        let (r2, _) =
            AttributeModel::insert_attribute(&mut uow, ci, "y", AttributeValue::text("2"), &a)
                .expect("a again");
        let (r3, _) =
            AttributeModel::insert_attribute(&mut uow, ci, "x", AttributeValue::text("3"), &b)
                .expect("b");
        assert_eq!(r1.changeset, r2.changeset);
        assert_ne!(r1.changeset, r3.changeset);
        assert_eq!(uow.created_changesets().len(), 2);
        uow.commit().expect("commit");

        let read = session.read().expect("read");
        let data = ChangesetModel::changeset_data(read.reader(), r1.changeset).expect("data");
        assert_eq!(data.changeset.user, user());
        assert_eq!(data.attributes.len(), 2);
    }

    /// T4.2: Timespan queries are newest first and filter by CI.
    #[test]
    fn timespan_query() {
        let mut session = Session::new();
        let base = layer("base");
        let (x, y) = (CiId::new_random(), CiId::new_random());

        let mut first = session.begin(user()).expect("begin");
        let start = first.timestamp();
        AttributeModel::insert_attribute(&mut first, x, "k", AttributeValue::text("1"), &base)
            .expect("x");
        first.commit().expect("commit");

        let mut second = session.begin(user()).expect("begin");
        let end = second.timestamp();
        AttributeModel::insert_attribute(&mut second, y, "k", AttributeValue::text("1"), &base)
            .expect("y");
        second.commit().expect("commit");

        let read = session.read().expect("read");
        let set = LayerSet::single(base);
        let all = ChangesetModel::changesets_in_timespan(
            read.reader(),
            start,
            end,
            &set,
            &CiSelection::All,
            None,
        )
        .expect("all");
        assert_eq!(all.len(), 2);
        assert!(all[0].timestamp > all[1].timestamp);

        let only_x = ChangesetModel::changesets_in_timespan(
            read.reader(),
            start,
            end,
            &set,
            &CiSelection::specific([x]),
            None,
        )
        .expect("x only");
        assert_eq!(only_x.len(), 1);
        assert_eq!(only_x[0].timestamp, start);
    }

    /// T4.3: A rolled back unit of work leaves no trace.
    #[test]
    fn rollback_discards_writes() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let mut uow = session.begin(user()).expect("begin");
        AttributeModel::insert_attribute(&mut uow, ci, "k", AttributeValue::text("v"), &layer("base"))
            .expect("insert");
        uow.rollback().expect("rollback");

        let read = session.read().expect("read");
        let merged = MergeEngine::get_merged_ci(
            read.reader(),
            ci,
            &LayerSet::single(layer("base")),
            TimeThreshold::Latest,
        )
        .expect("merge");
        assert!(merged.attributes.is_empty());
    }
}

// =============================================================================
// TIER T5: PERSISTENCE AND POINT-IN-TIME READS
// =============================================================================

mod t5_persistence {
    use super::*;

    /// T5.1: Committed data survives reopening; AsOf sees the old value.
    #[test]
    fn redb_reopen_and_as_of() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.redb");
        let ci = CiId::new_random();
        let base = layer("base");
        let set = LayerSet::single(base.clone());

        let first_time = {
            let mut session = Session::with_redb(&path).expect("open");
            assert!(session.is_persistent());
            let mut uow = session.begin(user()).expect("begin");
            let t = uow.timestamp();
            LayerModel::create_layer_if_not_exists(&mut uow, &base, "inventory").expect("layer");
            AttributeModel::insert_attribute(&mut uow, ci, "os", AttributeValue::text("linux"), &base)
                .expect("v1");
            uow.commit().expect("commit");

            let mut uow = session.begin(user()).expect("begin");
            AttributeModel::insert_attribute(&mut uow, ci, "os", AttributeValue::text("bsd"), &base)
                .expect("v2");
            uow.commit().expect("commit");
            t
        };

        let session = Session::with_redb(&path).expect("reopen");
        let read = session.read().expect("read");
        let latest = MergeEngine::get_merged_ci(read.reader(), ci, &set, TimeThreshold::Latest)
            .expect("latest");
        assert_eq!(latest.attributes["os"].value(), &AttributeValue::text("bsd"));

        let past = MergeEngine::get_merged_ci(read.reader(), ci, &set, TimeThreshold::at(first_time))
            .expect("past");
        assert_eq!(past.attributes["os"].value(), &AttributeValue::text("linux"));

        assert_eq!(
            LayerModel::get_layer(read.reader(), &base).expect("layer").description,
            "inventory"
        );
    }

    /// T5.2: Timestamps stay strictly increasing across sessions.
    #[test]
    fn timestamps_increase_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.redb");
        let ci = CiId::new_random();

        let first = {
            let mut session = Session::with_redb(&path).expect("open");
            let mut uow = session.begin(user()).expect("begin");
            AttributeModel::insert_attribute(&mut uow, ci, "k", AttributeValue::text("1"), &layer("base"))
                .expect("insert");
            let t = uow.timestamp();
            uow.commit().expect("commit");
            t
        };

        let mut session = Session::with_redb(&path).expect("reopen");
        let uow = session.begin(user()).expect("begin");
        assert!(uow.timestamp() > first);
    }
}
