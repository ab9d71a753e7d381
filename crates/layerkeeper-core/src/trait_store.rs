//! # Trait Store
//!
//! Data traits are stored as config records of the core trait
//! `__meta.config.trait` in a set of meta layers. [`TraitsProvider`] joins
//! them with the core traits and flattens the lot.
//!
//! - Core traits shadow data traits of the same id.
//! - A data trait that cannot be parsed or flattened (cycle, missing
//!   requirement) is reported in [`ActiveTraits::errors`] and left out;
//!   the remaining traits stay usable.
//! - [`TraitCache`] keeps flattened sets per meta layer set for the
//!   lifetime of one unit of work.

use crate::effective::{EffectiveTrait, EffectiveTraitEngine};
use crate::layer::LayerSet;
use crate::record::{MetaConfiguration, RecordModel, RecordWrite, StoredRecord, TraitRecord};
use crate::schema::{
    CoreTraits, FlattenConflict, GenericTrait, RecursiveTrait, TraitAttribute, TraitFlattener,
    TraitOrigin, TraitRelation, flatten_standalone,
};
use crate::selection::CiSelection;
use crate::session::UnitOfWork;
use crate::storage::RecordReader;
use crate::types::{AttributeValue, LayerId, StoreError, TimeThreshold, TraitId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// TRAIT DEFINITION RECORD
// =============================================================================

/// A recursive trait stored as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitDefinition(pub RecursiveTrait);

fn json_items<T: Serialize>(items: &[T]) -> Result<AttributeValue, StoreError> {
    let values = items
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    AttributeValue::json_array(&values)
}

fn parse_items<T: DeserializeOwned>(
    effective: &EffectiveTrait,
    identifier: &str,
) -> Result<Vec<T>, StoreError> {
    let Some(value) = effective.value(identifier) else {
        return Ok(Vec::new());
    };
    value
        .json_items()?
        .into_iter()
        .map(|v| {
            serde_json::from_value(v).map_err(|e| {
                StoreError::Serialization(format!("Trait field {}: {}", identifier, e))
            })
        })
        .collect()
}

impl TraitRecord for TraitDefinition {
    fn generic_trait() -> Result<GenericTrait, StoreError> {
        flatten_standalone(CoreTraits::trait_config()?)
    }

    fn id(&self) -> &str {
        self.0.id.as_str()
    }

    fn to_attributes(&self) -> Result<Vec<(String, AttributeValue)>, StoreError> {
        let t = &self.0;
        let mut attributes = vec![
            ("id".to_string(), AttributeValue::text(t.id.as_str())),
            (
                "required_attributes".to_string(),
                json_items(&t.required_attributes)?,
            ),
            (
                "name".to_string(),
                AttributeValue::text(format!("Trait - {}", t.id)),
            ),
        ];
        if !t.optional_attributes.is_empty() {
            attributes.push((
                "optional_attributes".to_string(),
                json_items(&t.optional_attributes)?,
            ));
        }
        if !t.required_relations.is_empty() {
            attributes.push((
                "required_relations".to_string(),
                json_items(&t.required_relations)?,
            ));
        }
        if !t.optional_relations.is_empty() {
            attributes.push((
                "optional_relations".to_string(),
                json_items(&t.optional_relations)?,
            ));
        }
        if !t.required_traits.is_empty() {
            attributes.push((
                "required_traits".to_string(),
                AttributeValue::text_array(t.required_traits.iter().map(TraitId::as_str)),
            ));
        }
        Ok(attributes)
    }

    fn from_effective(effective: &EffectiveTrait) -> Result<Self, StoreError> {
        let id = effective.text("id").ok_or_else(|| {
            StoreError::Serialization(format!("Trait record {} lacks an id", effective.ci))
        })?;
        let mut t = RecursiveTrait::new(TraitId::new(id)?, TraitOrigin::Data);
        t.required_attributes = parse_items::<TraitAttribute>(effective, "required_attributes")?;
        t.optional_attributes = parse_items::<TraitAttribute>(effective, "optional_attributes")?;
        t.required_relations = parse_items::<TraitRelation>(effective, "required_relations")?;
        t.optional_relations = parse_items::<TraitRelation>(effective, "optional_relations")?;
        t.required_traits = effective
            .value("required_traits")
            .and_then(AttributeValue::text_items)
            .unwrap_or_default()
            .into_iter()
            .map(TraitId::new)
            .collect::<Result<_, _>>()?;
        Ok(Self(t))
    }
}

/// Stored trait definitions.
pub struct TraitDefinitionModel;

impl TraitDefinitionModel {
    pub fn get_by_id(
        reader: &dyn RecordReader,
        id: &TraitId,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<Option<RecursiveTrait>, StoreError> {
        Ok(
            RecordModel::<TraitDefinition>::get_by_id(reader, id.as_str(), layers, at)?
                .map(|stored| stored.record.0),
        )
    }

    pub fn get_all(
        reader: &dyn RecordReader,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<Vec<RecursiveTrait>, StoreError> {
        Ok(RecordModel::<TraitDefinition>::get_all(reader, layers, at)?
            .into_iter()
            .map(|stored: StoredRecord<TraitDefinition>| stored.record.0)
            .collect())
    }

    pub fn insert_or_update(
        uow: &mut UnitOfWork<'_>,
        meta: &MetaConfiguration,
        definition: RecursiveTrait,
    ) -> Result<RecordWrite<TraitDefinition>, StoreError> {
        RecordModel::<TraitDefinition>::insert_or_update(uow, meta, &TraitDefinition(definition))
    }

    pub fn try_delete(
        uow: &mut UnitOfWork<'_>,
        meta: &MetaConfiguration,
        id: &TraitId,
    ) -> Result<bool, StoreError> {
        RecordModel::<TraitDefinition>::try_delete(uow, meta, id.as_str())
    }
}

// =============================================================================
// ACTIVE TRAITS
// =============================================================================

/// Every usable trait of one meta layer set, flattened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveTraits {
    pub traits: BTreeMap<TraitId, GenericTrait>,
    pub conflicts: Vec<FlattenConflict>,
    /// Traits left out, with the reason.
    pub errors: BTreeMap<TraitId, StoreError>,
}

impl ActiveTraits {
    #[must_use]
    pub fn get(&self, id: &TraitId) -> Option<&GenericTrait> {
        self.traits.get(id)
    }

    /// Like [`Self::get`], but an unknown or broken trait is an error.
    pub fn require(&self, id: &TraitId) -> Result<&GenericTrait, StoreError> {
        if let Some(error) = self.errors.get(id) {
            return Err(error.clone());
        }
        self.get(id)
            .ok_or_else(|| StoreError::NotFound(format!("Trait {}", id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &GenericTrait> {
        self.traits.values()
    }
}

/// Loads and flattens core and data traits.
pub struct TraitsProvider;

impl TraitsProvider {
    pub fn active_traits(
        reader: &dyn RecordReader,
        meta: &LayerSet,
        at: TimeThreshold,
    ) -> Result<ActiveTraits, StoreError> {
        let mut sources: BTreeMap<TraitId, RecursiveTrait> = BTreeMap::new();
        let mut errors = BTreeMap::new();

        if !meta.is_empty() {
            let records = EffectiveTraitEngine::get_effective_traits_for_trait(
                reader,
                &TraitDefinition::generic_trait()?,
                &CiSelection::All,
                meta,
                at,
            )?;
            for (ci, effective) in records {
                match TraitDefinition::from_effective(&effective) {
                    // Ascending CI order: the lowest CI of an id wins.
                    Ok(TraitDefinition(t)) => {
                        sources.entry(t.id.clone()).or_insert(t);
                    }
                    Err(e) => match effective.text("id").map(TraitId::new) {
                        Some(Ok(id)) => {
                            tracing::warn!(trait_id = %id, error = %e, "unreadable trait definition");
                            errors.entry(id).or_insert(e);
                        }
                        _ => tracing::warn!(ci = %ci, error = %e, "skipped trait definition"),
                    },
                }
            }
        }

        for core in CoreTraits::all()? {
            if sources.contains_key(&core.id) {
                tracing::warn!(trait_id = %core.id, "core trait shadows data trait");
            }
            errors.remove(&core.id);
            sources.insert(core.id.clone(), core);
        }

        let report = TraitFlattener::new(&sources).flatten_all();
        let mut traits = report.traits;
        let empty = GenericTrait::empty();
        traits.insert(empty.id.clone(), empty);
        errors.extend(report.errors);
        tracing::debug!(
            layers = %meta,
            traits = traits.len(),
            errors = errors.len(),
            "loaded active traits"
        );
        Ok(ActiveTraits {
            traits,
            conflicts: report.conflicts,
            errors,
        })
    }

    /// One flattened trait of the meta layers.
    pub fn active_trait(
        reader: &dyn RecordReader,
        meta: &LayerSet,
        at: TimeThreshold,
        id: &TraitId,
    ) -> Result<GenericTrait, StoreError> {
        Self::active_traits(reader, meta, at)?.require(id).cloned()
    }
}

// =============================================================================
// TRAIT CACHE
// =============================================================================

/// Flattened trait sets of one unit of work, by meta layer set.
#[derive(Debug, Default)]
pub struct TraitCache {
    entries: BTreeMap<LayerSet, Arc<ActiveTraits>>,
}

impl TraitCache {
    #[must_use]
    pub fn get(&self, meta: &LayerSet) -> Option<Arc<ActiveTraits>> {
        self.entries.get(meta).cloned()
    }

    pub fn insert(&mut self, meta: LayerSet, traits: Arc<ActiveTraits>) {
        self.entries.insert(meta, traits);
    }

    /// Forget every set read from `layer`.
    pub fn invalidate_layer(&mut self, layer: &LayerId) {
        self.entries.retain(|meta, _| !meta.contains(layer));
    }
}

// =============================================================================
// TESTS
// =============================================================================
