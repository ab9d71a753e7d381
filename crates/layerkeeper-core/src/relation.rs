//! # Versioned Relation Store
//!
//! Append-only relation history per (from, to, predicate, layer), following
//! the same state machine as attributes. A relation has no value: two live
//! rows of one key are always equal, so re-inserting a live relation is a
//! no-op. Mask rows (`mask = true`) hide the relation of lower layers.

use crate::attribute::BulkOutcome;
use crate::layer::LayerSet;
use crate::policy::{BulkWritePolicy, LayeredWriter};
use crate::predicate::PredicateModel;
use crate::primitives::MAX_BULK_FRAGMENTS;
use crate::selection::RelationSelection;
use crate::session::UnitOfWork;
use crate::storage::RecordReader;
use crate::types::{
    ChangeState, CiId, LayerId, PredicateId, RelationKey, RelationRecord, StoreError,
    TimeThreshold,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// The region of a layer a relation bulk replace takes ownership of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationBulkScope {
    /// Every relation of the layer with this predicate.
    LayerPredicate(PredicateId),
    /// Outgoing relations of one CI with one of the predicates.
    FromCiPredicates {
        from: CiId,
        predicates: BTreeSet<PredicateId>,
    },
    /// The whole layer.
    Layer,
}

impl RelationBulkScope {
    #[must_use]
    pub fn contains(&self, key: &RelationKey) -> bool {
        match self {
            Self::LayerPredicate(predicate) => &key.predicate == predicate,
            Self::FromCiPredicates { from, predicates } => {
                key.from == *from && predicates.contains(&key.predicate)
            }
            Self::Layer => true,
        }
    }

    fn selection(&self) -> RelationSelection {
        match self {
            Self::LayerPredicate(predicate) => {
                RelationSelection::with_predicates([predicate.clone()])
            }
            Self::FromCiPredicates { from, predicates } => RelationSelection::from_cis([*from])
                .intersect(RelationSelection::with_predicates(predicates.iter().cloned())),
            Self::Layer => RelationSelection::All,
        }
    }
}

/// Reads and writes of the relation history.
pub struct RelationModel;

impl RelationModel {
    /// The current non-removed record of `key` in `layer` (live or mask).
    pub fn get_relation(
        reader: &dyn RecordReader,
        key: &RelationKey,
        layer: &LayerId,
        at: TimeThreshold,
    ) -> Result<Option<RelationRecord>, StoreError> {
        Ok(reader
            .current_relation(key, layer, at)?
            .filter(|r| !r.state.is_removed()))
    }

    /// Current non-removed records of one layer matching `selection`.
    pub fn relations_of_layer(
        reader: &dyn RecordReader,
        layer: &LayerId,
        selection: &RelationSelection,
        at: TimeThreshold,
    ) -> Result<Vec<RelationRecord>, StoreError> {
        let mut records = reader.current_relations(layer, selection, at)?;
        records.retain(|r| !r.state.is_removed());
        Ok(records)
    }

    pub fn relation_history(
        reader: &dyn RecordReader,
        key: &RelationKey,
        layer: &LayerId,
    ) -> Result<Vec<RelationRecord>, StoreError> {
        reader.relation_history(key, layer)
    }

    /// Write a live relation unless one already exists.
    pub fn insert_relation(
        uow: &mut UnitOfWork<'_>,
        key: &RelationKey,
        layer: &LayerId,
    ) -> Result<(RelationRecord, bool), StoreError> {
        Self::insert_row(uow, key, layer, false)
    }

    /// Like [`Self::insert_relation`], but the predicate must be a known
    /// predicate of the meta layers.
    pub fn insert_relation_checked(
        uow: &mut UnitOfWork<'_>,
        key: &RelationKey,
        layer: &LayerId,
        meta: &LayerSet,
    ) -> Result<(RelationRecord, bool), StoreError> {
        PredicateModel::ensure_predicate_known(uow.reader(), &key.predicate, meta)?;
        Self::insert_relation(uow, key, layer)
    }

    /// Write a mask hiding the relation of lower layers.
    pub fn insert_relation_mask(
        uow: &mut UnitOfWork<'_>,
        key: &RelationKey,
        layer: &LayerId,
    ) -> Result<(RelationRecord, bool), StoreError> {
        Self::insert_row(uow, key, layer, true)
    }

    fn insert_row(
        uow: &mut UnitOfWork<'_>,
        key: &RelationKey,
        layer: &LayerId,
        mask: bool,
    ) -> Result<(RelationRecord, bool), StoreError> {
        if key.from == key.to {
            tracing::warn!(ci = %key.from, predicate = %key.predicate, "rejected self relation");
            return Err(StoreError::InvalidState(format!(
                "Relation from CI {} to itself",
                key.from
            )));
        }
        let current = uow
            .reader()
            .current_relation(key, layer, TimeThreshold::Latest)?;
        if let Some(current) = &current
            && !current.state.is_removed()
            && current.mask == mask
        {
            return Ok((current.clone(), false));
        }
        let state = ChangeState::after_insert(current.map(|r| r.state));
        let record = Self::append(uow, key, layer, state, mask)?;
        Ok((record, true))
    }

    /// Tombstone the current relation of `key` in `layer`.
    pub fn remove_relation(
        uow: &mut UnitOfWork<'_>,
        key: &RelationKey,
        layer: &LayerId,
    ) -> Result<(RelationRecord, bool), StoreError> {
        let current = uow
            .reader()
            .current_relation(key, layer, TimeThreshold::Latest)?
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "Relation {} -[{}]-> {} in layer {}",
                    key.from, key.predicate, key.to, layer
                ))
            })?;
        if current.state.is_removed() {
            return Ok((current, false));
        }
        let record = Self::append(uow, key, layer, ChangeState::Removed, current.mask)?;
        Ok((record, true))
    }

    fn append(
        uow: &mut UnitOfWork<'_>,
        key: &RelationKey,
        layer: &LayerId,
        state: ChangeState,
        mask: bool,
    ) -> Result<RelationRecord, StoreError> {
        let changeset = uow.changeset(layer)?;
        let record = RelationRecord {
            id: Uuid::new_v4(),
            from: key.from,
            to: key.to,
            predicate: key.predicate.clone(),
            layer: layer.clone(),
            state,
            mask,
            changeset: changeset.id,
            timestamp: changeset.timestamp,
            origin: changeset.origin,
        };
        uow.writer().append_relation(&record)?;
        uow.note_write(layer);
        tracing::debug!(
            from = %key.from,
            to = %key.to,
            predicate = %key.predicate,
            layer = %layer,
            state = state.name(),
            mask,
            "wrote relation record"
        );
        Ok(record)
    }

    /// Make `fragments` the complete relation content of `scope` in `layer`,
    /// writing and removing under `policy`.
    pub fn bulk_replace_relations(
        uow: &mut UnitOfWork<'_>,
        layer: &LayerId,
        scope: &RelationBulkScope,
        fragments: Vec<RelationKey>,
        policy: &BulkWritePolicy,
    ) -> Result<BulkOutcome, StoreError> {
        policy.check_write_layer(layer)?;
        if fragments.len() > MAX_BULK_FRAGMENTS {
            return Err(StoreError::InvalidState(format!(
                "Bulk replace exceeds {} fragments",
                MAX_BULK_FRAGMENTS
            )));
        }
        let mut desired = BTreeSet::new();
        for key in &fragments {
            if !scope.contains(key) {
                return Err(StoreError::InvalidState(format!(
                    "Relation {} -[{}]-> {} lies outside the bulk scope",
                    key.from, key.predicate, key.to
                )));
            }
            if !desired.insert(key.clone()) {
                return Err(StoreError::InvalidState(format!(
                    "Duplicate relation {} -[{}]-> {}",
                    key.from, key.predicate, key.to
                )));
            }
        }

        let existing = Self::relations_of_layer(
            uow.reader(),
            layer,
            &scope.selection(),
            TimeThreshold::Latest,
        )?;

        let mut outcome = BulkOutcome::default();
        for key in &fragments {
            let written = LayeredWriter::insert_relation(
                uow,
                key,
                layer,
                &policy.read_layers,
                policy.other_layers,
            )?;
            outcome.count_write(&written);
        }
        for record in existing {
            if !desired.contains(&record.key()) {
                let removed = LayeredWriter::remove_relation(
                    uow,
                    &record.key(),
                    layer,
                    &policy.read_layers,
                    policy.masks,
                )?;
                outcome.count_removal(&removed);
            }
        }
        tracing::info!(
            layer = %layer,
            written = outcome.written,
            removed = outcome.removed,
            unchanged = outcome.unchanged,
            skipped = outcome.skipped,
            "bulk replaced relations"
        );
        Ok(outcome)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::merge::MergeEngine;
    use crate::policy::{MaskHandlingForRemoval, OtherLayersValueHandling};
    use crate::session::Session;
    use crate::types::UserId;

    fn layer() -> LayerId {
        LayerId::new("base").unwrap()
    }

    fn key(from: CiId, to: CiId, p: &str) -> RelationKey {
        RelationKey::new(from, to, PredicateId::new(p).unwrap())
    }

    #[test]
    fn self_relation_is_rejected() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        assert!(matches!(
            RelationModel::insert_relation(&mut uow, &key(ci, ci, "p"), &layer()),
            Err(StoreError::InvalidState(_))
        ));
    }

    #[test]
    fn relation_state_machine() {
        let mut session = Session::new();
        let (a, b) = (CiId::new_random(), CiId::new_random());
        let k = key(a, b, "runs_on");
        let mut uow = session.begin(UserId::new("u")).unwrap();

        let (r, changed) = RelationModel::insert_relation(&mut uow, &k, &layer()).unwrap();
        assert!(changed);
        assert_eq!(r.state, ChangeState::New);
        let (_, changed) = RelationModel::insert_relation(&mut uow, &k, &layer()).unwrap();
        assert!(!changed);

        let (r, _) = RelationModel::remove_relation(&mut uow, &k, &layer()).unwrap();
        assert_eq!(r.state, ChangeState::Removed);
        let (r, _) = RelationModel::insert_relation(&mut uow, &k, &layer()).unwrap();
        assert_eq!(r.state, ChangeState::Renewed);

        assert_eq!(
            RelationModel::relation_history(uow.reader(), &k, &layer())
                .unwrap()
                .len(),
            3
        );
        assert!(uow.reader().ci_exists(a).unwrap());
        assert!(uow.reader().ci_exists(b).unwrap());
        uow.commit().unwrap();
    }

    #[test]
    fn bulk_replace_relations_from_ci() {
        let mut session = Session::new();
        let (a, b, c) = (CiId::new_random(), CiId::new_random(), CiId::new_random());
        let member = PredicateId::new("has_member").unwrap();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        RelationModel::insert_relation(&mut uow, &key(a, b, "has_member"), &layer()).unwrap();
        RelationModel::insert_relation(&mut uow, &key(a, c, "owns"), &layer()).unwrap();

        let scope = RelationBulkScope::FromCiPredicates {
            from: a,
            predicates: [member].into_iter().collect(),
        };
        let outcome = RelationModel::bulk_replace_relations(
            &mut uow,
            &layer(),
            &scope,
            vec![key(a, c, "has_member")],
            &BulkWritePolicy::plain(&layer()),
        )
        .unwrap();
        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.removed, 1);

        let live = RelationModel::relations_of_layer(
            uow.reader(),
            &layer(),
            &RelationSelection::All,
            TimeThreshold::Latest,
        )
        .unwrap();
        let keys: BTreeSet<RelationKey> = live.iter().map(RelationRecord::key).collect();
        assert!(keys.contains(&key(a, c, "has_member")));
        assert!(keys.contains(&key(a, c, "owns")));
        assert!(!keys.contains(&key(a, b, "has_member")));
    }

    #[test]
    fn bulk_replace_keeps_relation_mask_over_live_lower_layer() {
        let mut session = Session::new();
        let (a, b) = (CiId::new_random(), CiId::new_random());
        let k = key(a, b, "runs_on");
        let w = LayerId::new("w").unwrap();
        let both = LayerSet::new([w.clone(), layer()]).unwrap();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        RelationModel::insert_relation(&mut uow, &k, &layer()).unwrap();
        RelationModel::insert_relation_mask(&mut uow, &k, &w).unwrap();

        let policy = BulkWritePolicy {
            read_layers: both.clone(),
            other_layers: OtherLayersValueHandling::ForceWrite,
            masks: MaskHandlingForRemoval::ApplyMaskIfNecessary,
        };
        let outcome = RelationModel::bulk_replace_relations(
            &mut uow,
            &w,
            &RelationBulkScope::Layer,
            vec![],
            &policy,
        )
        .unwrap();
        assert_eq!(outcome.removed, 0);
        assert!(
            MergeEngine::get_merged_relation(uow.reader(), &k, &both, TimeThreshold::Latest)
                .unwrap()
                .is_none()
        );
    }
}
