//! # Predicates
//!
//! Relation predicates are config records of the core trait
//! `__meta.config.predicate`. The checked relation write path only accepts
//! predicates defined in the meta layers.

use crate::effective::EffectiveTrait;
use crate::layer::LayerSet;
use crate::record::{MetaConfiguration, RecordModel, RecordWrite, StoredRecord, TraitRecord};
use crate::schema::{CoreTraits, GenericTrait, flatten_standalone};
use crate::session::UnitOfWork;
use crate::storage::RecordReader;
use crate::types::{AttributeValue, PredicateId, StoreError, TimeThreshold};
use serde::{Deserialize, Serialize};

/// A relation predicate with its wording in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub id: PredicateId,
    /// Wording read from the source, e.g. "has member".
    pub wording_from: String,
    /// Wording read from the target, e.g. "is member of".
    pub wording_to: String,
}

fn required_text<'e>(
    effective: &'e EffectiveTrait,
    identifier: &str,
) -> Result<&'e str, StoreError> {
    effective.text(identifier).ok_or_else(|| {
        StoreError::Serialization(format!(
            "Predicate record {} lacks {}",
            effective.ci, identifier
        ))
    })
}

impl TraitRecord for Predicate {
    fn generic_trait() -> Result<GenericTrait, StoreError> {
        flatten_standalone(CoreTraits::predicate_config())
    }

    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn to_attributes(&self) -> Result<Vec<(String, AttributeValue)>, StoreError> {
        Ok(vec![
            ("id".to_string(), AttributeValue::text(self.id.as_str())),
            ("wording_from".to_string(), AttributeValue::text(&self.wording_from)),
            ("wording_to".to_string(), AttributeValue::text(&self.wording_to)),
            (
                "name".to_string(),
                AttributeValue::text(format!("Predicate - {}", self.id)),
            ),
        ])
    }

    fn from_effective(effective: &EffectiveTrait) -> Result<Self, StoreError> {
        Ok(Self {
            id: PredicateId::new(required_text(effective, "id")?)?,
            wording_from: required_text(effective, "wording_from")?.to_string(),
            wording_to: required_text(effective, "wording_to")?.to_string(),
        })
    }
}

/// Predicate lookups and writes.
pub struct PredicateModel;

impl PredicateModel {
    pub fn get_by_id(
        reader: &dyn RecordReader,
        id: &PredicateId,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<Option<Predicate>, StoreError> {
        Ok(RecordModel::<Predicate>::get_by_id(reader, id.as_str(), layers, at)?
            .map(|stored| stored.record))
    }

    /// Every predicate, ordered by id.
    pub fn get_all(
        reader: &dyn RecordReader,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<Vec<Predicate>, StoreError> {
        Ok(RecordModel::<Predicate>::get_all(reader, layers, at)?
            .into_iter()
            .map(|stored: StoredRecord<Predicate>| stored.record)
            .collect())
    }

    pub fn insert_or_update(
        uow: &mut UnitOfWork<'_>,
        meta: &MetaConfiguration,
        id: PredicateId,
        wording_from: impl Into<String>,
        wording_to: impl Into<String>,
    ) -> Result<RecordWrite<Predicate>, StoreError> {
        let predicate = Predicate {
            id,
            wording_from: wording_from.into(),
            wording_to: wording_to.into(),
        };
        RecordModel::<Predicate>::insert_or_update(uow, meta, &predicate)
    }

    pub fn try_delete(
        uow: &mut UnitOfWork<'_>,
        meta: &MetaConfiguration,
        id: &PredicateId,
    ) -> Result<bool, StoreError> {
        RecordModel::<Predicate>::try_delete(uow, meta, id.as_str())
    }

    /// Fails with [`StoreError::InvalidState`] unless `id` is defined in `meta`.
    pub fn ensure_predicate_known(
        reader: &dyn RecordReader,
        id: &PredicateId,
        meta: &LayerSet,
    ) -> Result<(), StoreError> {
        match Self::get_by_id(reader, id, meta, TimeThreshold::Latest)? {
            Some(_) => Ok(()),
            None => {
                tracing::warn!(predicate = %id, "unknown predicate");
                Err(StoreError::InvalidState(format!(
                    "Predicate {} is not defined in {}",
                    id, meta
                )))
            }
        }
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
    use crate::relation::RelationModel;
    use crate::session::Session;
    use crate::types::{CiId, LayerId, RelationKey, UserId};

    fn meta() -> MetaConfiguration {
        MetaConfiguration::single(LayerId::new("meta").unwrap())
    }

    fn p(id: &str) -> PredicateId {
        PredicateId::new(id).unwrap()
    }

    #[test]
    fn predicate_round_trip_and_name() {
        let mut session = Session::new();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        let write = PredicateModel::insert_or_update(
            &mut uow,
            &meta(),
            p("has_member"),
            "has member",
            "is member of",
        )
        .unwrap();
        assert!(write.changed);

        let merged = MergeEngine::get_merged_ci(
            uow.reader(),
            write.stored.ci,
            &meta().layers,
            TimeThreshold::Latest,
        )
        .unwrap();
        assert_eq!(merged.name(), Some("Predicate - has_member"));

        let all = PredicateModel::get_all(uow.reader(), &meta().layers, TimeThreshold::Latest)
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].wording_to, "is member of");
    }

    #[test]
    fn checked_relation_requires_known_predicate() {
        let mut session = Session::new();
        let data = LayerId::new("data").unwrap();
        let (a, b) = (CiId::new_random(), CiId::new_random());
        let mut uow = session.begin(UserId::new("u")).unwrap();

        let unknown = RelationKey::new(a, b, p("runs_on"));
        assert!(matches!(
            RelationModel::insert_relation_checked(&mut uow, &unknown, &data, &meta().layers),
            Err(StoreError::InvalidState(_))
        ));

        PredicateModel::insert_or_update(&mut uow, &meta(), p("runs_on"), "runs on", "runs")
            .unwrap();
        let (_, changed) =
            RelationModel::insert_relation_checked(&mut uow, &unknown, &data, &meta().layers)
                .unwrap();
        assert!(changed);
    }

    #[test]
    fn deleted_predicate_is_gone() {
        let mut session = Session::new();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        PredicateModel::insert_or_update(&mut uow, &meta(), p("owns"), "owns", "owned by")
            .unwrap();
        assert!(PredicateModel::try_delete(&mut uow, &meta(), &p("owns")).unwrap());
        assert!(
            PredicateModel::get_by_id(uow.reader(), &p("owns"), &meta().layers, TimeThreshold::Latest)
                .unwrap()
                .is_none()
        );
    }
}
