//! # Trait-backed Config Records
//!
//! Typed configuration records stored as ordinary CI data. A record type
//! binds itself to a trait through [`TraitRecord`]; [`RecordModel`] reads
//! records through the effective trait engine and writes them as attributes
//! and relations of one write layer.
//!
//! The store does not enforce uniqueness of the id attribute. When several
//! CIs carry the same id, the one with the lowest CI id is the record.

use crate::attribute::AttributeModel;
use crate::ci::CiModel;
use crate::effective::{EffectiveTrait, EffectiveTraitEngine};
use crate::layer::LayerSet;
use crate::merge::MergeEngine;
use crate::relation::RelationModel;
use crate::schema::{GenericTrait, RelationDirection, TraitRelation};
use crate::selection::{AttributeSelection, CiSelection, RelationSelection};
use crate::session::UnitOfWork;
use crate::storage::RecordReader;
use crate::types::{
    AttributeKey, AttributeValue, CiId, LayerId, RelationKey, StoreError, TimeThreshold,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;

/// Where config records are read from and written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaConfiguration {
    pub layers: LayerSet,
    pub write_layer: LayerId,
}

impl MetaConfiguration {
    /// The write layer must be part of the read layers.
    pub fn new(layers: LayerSet, write_layer: LayerId) -> Result<Self, StoreError> {
        if !layers.contains(&write_layer) {
            return Err(StoreError::InvalidState(format!(
                "Write layer {} is not part of {}",
                write_layer, layers
            )));
        }
        Ok(Self {
            layers,
            write_layer,
        })
    }

    /// Read and write one layer.
    #[must_use]
    pub fn single(layer: LayerId) -> Self {
        Self {
            layers: LayerSet::single(layer.clone()),
            write_layer: layer,
        }
    }
}

/// A record type stored under a trait.
pub trait TraitRecord: Sized {
    /// Trait-local identifier of the id attribute.
    const ID_ATTRIBUTE: &'static str = "id";

    /// The flattened trait records of this type satisfy.
    fn generic_trait() -> Result<GenericTrait, StoreError>;

    /// Business id, stored as text under [`Self::ID_ATTRIBUTE`].
    fn id(&self) -> &str;

    /// Attribute values by trait-local identifier.
    fn to_attributes(&self) -> Result<Vec<(String, AttributeValue)>, StoreError>;

    /// Related CIs by trait-local relation identifier.
    fn relations(&self) -> Vec<(String, Vec<CiId>)> {
        Vec::new()
    }

    fn from_effective(effective: &EffectiveTrait) -> Result<Self, StoreError>;
}

/// A record together with the CI carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord<R> {
    pub ci: CiId,
    pub record: R,
}

/// Outcome of [`RecordModel::insert_or_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWrite<R> {
    pub stored: StoredRecord<R>,
    /// Whether any record was written.
    pub changed: bool,
}

fn id_attribute_name<R: TraitRecord>(generic: &GenericTrait) -> Result<String, StoreError> {
    generic
        .attribute(R::ID_ATTRIBUTE)
        .map(|a| a.template.name.clone())
        .ok_or_else(|| {
            StoreError::InvalidState(format!(
                "Trait {} has no attribute {}",
                generic.id,
                R::ID_ATTRIBUTE
            ))
        })
}

fn relation_key(template: &TraitRelation, ci: CiId, other: CiId) -> RelationKey {
    match template.direction {
        RelationDirection::Forward => RelationKey::new(ci, other, template.predicate.clone()),
        RelationDirection::Back => RelationKey::new(other, ci, template.predicate.clone()),
    }
}

/// Typed access to the records of one [`TraitRecord`] type.
pub struct RecordModel<R>(PhantomData<R>);

impl<R: TraitRecord> RecordModel<R> {
    /// The record with business id `id`.
    pub fn get_by_id(
        reader: &dyn RecordReader,
        id: &str,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<Option<StoredRecord<R>>, StoreError> {
        let generic = R::generic_trait()?;
        let id_name = id_attribute_name::<R>(&generic)?;
        let wanted = AttributeValue::text(id);

        let candidates: BTreeSet<CiId> = MergeEngine::get_merged_attributes(
            reader,
            &CiSelection::All,
            &AttributeSelection::specific([id_name.clone()]),
            layers,
            at,
        )?
        .into_iter()
        .filter(|(_, attributes)| attributes.get(&id_name).is_some_and(|a| a.value() == &wanted))
        .map(|(ci, _)| ci)
        .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let effective = EffectiveTraitEngine::get_effective_traits_for_trait(
            reader,
            &generic,
            &CiSelection::specific(candidates),
            layers,
            at,
        )?;
        match effective.into_iter().next() {
            Some((ci, effective)) => Ok(Some(StoredRecord {
                ci,
                record: R::from_effective(&effective)?,
            })),
            None => Ok(None),
        }
    }

    /// Every record, one per business id, ordered by id.
    pub fn get_all(
        reader: &dyn RecordReader,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<Vec<StoredRecord<R>>, StoreError> {
        let generic = R::generic_trait()?;
        let effective = EffectiveTraitEngine::get_effective_traits_for_trait(
            reader,
            &generic,
            &CiSelection::All,
            layers,
            at,
        )?;
        let mut by_id: BTreeMap<String, StoredRecord<R>> = BTreeMap::new();
        for (ci, effective) in effective {
            let record = R::from_effective(&effective)?;
            // Ascending CI order: the first CI seen for an id wins.
            by_id
                .entry(record.id().to_string())
                .or_insert(StoredRecord { ci, record });
        }
        Ok(by_id.into_values().collect())
    }

    /// Write `record` into the write layer and check it reads back.
    ///
    /// Updates the CI already carrying the id, or creates one. Trait
    /// attributes the record leaves unset are removed from the write layer.
    /// Fails with [`StoreError::ConstraintViolation`] if the merged result
    /// no longer satisfies the trait.
    pub fn insert_or_update(
        uow: &mut UnitOfWork<'_>,
        meta: &MetaConfiguration,
        record: &R,
    ) -> Result<RecordWrite<R>, StoreError> {
        let generic = R::generic_trait()?;
        let existing = Self::get_by_id(uow.reader(), record.id(), &meta.layers, TimeThreshold::Latest)?;
        let ci = match existing {
            Some(stored) => stored.ci,
            None => CiModel::create_ci(uow, None)?,
        };

        let mut changed = false;
        let mut written = BTreeSet::new();
        for (identifier, value) in record.to_attributes()? {
            let template = generic.attribute(&identifier).ok_or_else(|| {
                StoreError::InvalidState(format!(
                    "Trait {} has no attribute {}",
                    generic.id, identifier
                ))
            })?;
            let (_, c) = AttributeModel::insert_attribute(
                uow,
                ci,
                &template.template.name,
                value,
                &meta.write_layer,
            )?;
            changed |= c;
            written.insert(template.template.name.clone());
        }
        for name in generic.attribute_names() {
            if written.contains(name) {
                continue;
            }
            let key = AttributeKey::new(ci, name, meta.write_layer.clone());
            if AttributeModel::get_attribute(uow.reader(), &key, TimeThreshold::Latest)?.is_some() {
                let (_, c) = AttributeModel::remove_attribute(uow, ci, name, &meta.write_layer)?;
                changed |= c;
            }
        }

        let desired: BTreeMap<String, Vec<CiId>> = record.relations().into_iter().collect();
        for template in generic.relations() {
            let targets = desired.get(&template.identifier).cloned().unwrap_or_default();
            changed |= Self::replace_relations(uow, ci, template, &targets, &meta.write_layer)?;
        }

        let verified = EffectiveTraitEngine::get_effective_trait_for_ci(
            uow.reader(),
            ci,
            &generic,
            &meta.layers,
            TimeThreshold::Latest,
        )?
        .ok_or_else(|| {
            tracing::warn!(trait_id = %generic.id, id = record.id(), ci = %ci, "record failed verification");
            StoreError::ConstraintViolation(format!(
                "{} {} does not satisfy its trait after writing",
                generic.id,
                record.id()
            ))
        })?;
        tracing::info!(trait_id = %generic.id, id = record.id(), ci = %ci, changed, "wrote config record");
        Ok(RecordWrite {
            stored: StoredRecord {
                ci,
                record: R::from_effective(&verified)?,
            },
            changed,
        })
    }

    /// Make `targets` the relations of `template` held by `ci` in `layer`.
    fn replace_relations(
        uow: &mut UnitOfWork<'_>,
        ci: CiId,
        template: &TraitRelation,
        targets: &[CiId],
        layer: &LayerId,
    ) -> Result<bool, StoreError> {
        let desired: BTreeSet<RelationKey> = targets
            .iter()
            .map(|other| relation_key(template, ci, *other))
            .collect();
        let endpoint = match template.direction {
            RelationDirection::Forward => RelationSelection::from_cis([ci]),
            RelationDirection::Back => RelationSelection::to_cis([ci]),
        };
        let existing = RelationModel::relations_of_layer(
            uow.reader(),
            layer,
            &endpoint.intersect(RelationSelection::with_predicates([template.predicate.clone()])),
            TimeThreshold::Latest,
        )?;

        let mut changed = false;
        for key in &desired {
            changed |= RelationModel::insert_relation(uow, key, layer)?.1;
        }
        for record in existing {
            let key = record.key();
            if !desired.contains(&key) {
                changed |= RelationModel::remove_relation(uow, &key, layer)?.1;
            }
        }
        Ok(changed)
    }

    /// Remove the record's data from the write layer.
    ///
    /// Returns `false` if no record has this id. Fails with
    /// [`StoreError::InvalidState`] if other layers still provide the
    /// record after the removal.
    pub fn try_delete(
        uow: &mut UnitOfWork<'_>,
        meta: &MetaConfiguration,
        id: &str,
    ) -> Result<bool, StoreError> {
        let generic = R::generic_trait()?;
        let Some(existing) = Self::get_by_id(uow.reader(), id, &meta.layers, TimeThreshold::Latest)?
        else {
            return Ok(false);
        };
        let ci = existing.ci;

        let names: Vec<String> = generic.attribute_names().map(str::to_string).collect();
        for name in &names {
            let key = AttributeKey::new(ci, name.as_str(), meta.write_layer.clone());
            if AttributeModel::get_attribute(uow.reader(), &key, TimeThreshold::Latest)?.is_some() {
                AttributeModel::remove_attribute(uow, ci, name, &meta.write_layer)?;
            }
        }
        let templates: Vec<TraitRelation> = generic.relations().cloned().collect();
        for template in &templates {
            Self::replace_relations(uow, ci, template, &[], &meta.write_layer)?;
        }

        let remaining = EffectiveTraitEngine::get_effective_trait_for_ci(
            uow.reader(),
            ci,
            &generic,
            &meta.layers,
            TimeThreshold::Latest,
        )?;
        if remaining.is_some() {
            return Err(StoreError::InvalidState(format!(
                "{} {} is still provided by layers other than {}",
                generic.id, id, meta.write_layer
            )));
        }
        tracing::info!(trait_id = %generic.id, id, ci = %ci, "deleted config record");
        Ok(true)
    }
}

// =============================================================================
// TESTS
// =============================================================================
