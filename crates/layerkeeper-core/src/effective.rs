//! # Effective Trait Engine
//!
//! Evaluates flattened traits against merged CI data.
//!
//! A CI has a trait when every required attribute template matches the
//! merged attribute of the same underlying name and every required relation
//! template admits the number of merged relations in its direction.
//! Optional templates never fail a trait; unmatched ones are omitted.
//!
//! Trait mismatches are not errors: they surface as `None` or as absence
//! from a result map.
//!
//! ## Batching
//!
//! [`EffectiveTraitEngine::get_effective_traits_for_trait`] first narrows
//! the candidates to CIs holding every required attribute name, then runs
//! full evaluation on the survivors only.

use crate::ci::CiModel;
use crate::layer::LayerSet;
use crate::merge::{MergeEngine, MergedAttribute, MergedRelation};
use crate::schema::{GenericTrait, RelationDirection, TraitRelation};
use crate::selection::{AttributeSelection, CiSelection, RelationSelection};
use crate::storage::RecordReader;
use crate::types::{AttributeValue, CiId, StoreError, TimeThreshold, TraitId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A CI seen through one trait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveTrait {
    pub trait_id: TraitId,
    pub ci: CiId,
    /// Matched attributes by trait-local identifier.
    pub attributes: BTreeMap<String, MergedAttribute>,
    /// Matched relations by trait-local identifier.
    pub relations: BTreeMap<String, Vec<MergedRelation>>,
}

impl EffectiveTrait {
    /// Value of the attribute bound to `identifier`.
    #[must_use]
    pub fn value(&self, identifier: &str) -> Option<&AttributeValue> {
        self.attributes.get(identifier).map(MergedAttribute::value)
    }

    /// Text of the attribute bound to `identifier`.
    #[must_use]
    pub fn text(&self, identifier: &str) -> Option<&str> {
        self.value(identifier).and_then(AttributeValue::as_text)
    }

    /// CIs at the other end of the relations bound to `identifier`.
    #[must_use]
    pub fn related_cis(&self, identifier: &str) -> Vec<CiId> {
        self.relations
            .get(identifier)
            .map(|rels| {
                rels.iter()
                    .map(|r| {
                        if r.record.from == self.ci {
                            r.record.to
                        } else {
                            r.record.from
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn touches(template: &TraitRelation, ci: CiId, relation: &MergedRelation) -> bool {
    relation.record.predicate == template.predicate
        && match template.direction {
            RelationDirection::Forward => relation.record.from == ci,
            RelationDirection::Back => relation.record.to == ci,
        }
}

/// Predicate filter covering every relation template of `generic`.
fn relation_selection(generic: &GenericTrait, cis: &BTreeSet<CiId>) -> RelationSelection {
    let predicates: BTreeSet<_> = generic.relations().map(|r| r.predicate.clone()).collect();
    if predicates.is_empty() || cis.is_empty() {
        return RelationSelection::None;
    }
    RelationSelection::either(cis.iter().copied())
        .intersect(RelationSelection::with_predicates(predicates))
}

fn attribute_selection(generic: &GenericTrait) -> AttributeSelection {
    AttributeSelection::specific(generic.attribute_names().map(str::to_string))
}

/// Trait evaluation over the merge engine.
pub struct EffectiveTraitEngine;

impl EffectiveTraitEngine {
    /// Evaluate `generic` against already merged data of `ci`.
    ///
    /// `relations` may hold relations of other CIs; only those touching
    /// `ci` in a template's direction are counted.
    #[must_use]
    pub fn evaluate(
        generic: &GenericTrait,
        ci: CiId,
        attributes: &BTreeMap<String, MergedAttribute>,
        relations: &[MergedRelation],
    ) -> Option<EffectiveTrait> {
        let mut effective = EffectiveTrait {
            trait_id: generic.id.clone(),
            ci,
            attributes: BTreeMap::new(),
            relations: BTreeMap::new(),
        };

        for required in &generic.required_attributes {
            let merged = attributes
                .get(&required.template.name)
                .filter(|m| required.template.matches(m.value()))?;
            effective
                .attributes
                .insert(required.identifier.clone(), merged.clone());
        }
        for required in &generic.required_relations {
            let matched: Vec<MergedRelation> = relations
                .iter()
                .filter(|r| touches(required, ci, r))
                .cloned()
                .collect();
            if !required.admits(matched.len()) {
                return None;
            }
            effective
                .relations
                .insert(required.identifier.clone(), matched);
        }

        for optional in &generic.optional_attributes {
            if effective.attributes.contains_key(&optional.identifier) {
                continue;
            }
            if let Some(merged) = attributes
                .get(&optional.template.name)
                .filter(|m| optional.template.matches(m.value()))
            {
                effective
                    .attributes
                    .insert(optional.identifier.clone(), merged.clone());
            }
        }
        for optional in &generic.optional_relations {
            let matched: Vec<MergedRelation> = relations
                .iter()
                .filter(|r| touches(optional, ci, r))
                .cloned()
                .collect();
            if !matched.is_empty() && optional.admits(matched.len()) {
                effective
                    .relations
                    .insert(optional.identifier.clone(), matched);
            }
        }
        Some(effective)
    }

    /// `ci` seen through `generic`, or `None` if it does not have the trait.
    ///
    /// A CI that did not exist yet at `at` has no traits.
    pub fn get_effective_trait_for_ci(
        reader: &dyn RecordReader,
        ci: CiId,
        generic: &GenericTrait,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<Option<EffectiveTrait>, StoreError> {
        if !CiModel::ci_exists_at(reader, ci, at)? {
            return Ok(None);
        }
        let mut merged = MergeEngine::get_merged_attributes(
            reader,
            &CiSelection::specific([ci]),
            &attribute_selection(generic),
            layers,
            at,
        )?;
        let attributes = merged.remove(&ci).unwrap_or_default();
        let relations = MergeEngine::get_merged_relations(
            reader,
            &relation_selection(generic, &BTreeSet::from([ci])),
            layers,
            at,
        )?;
        Ok(Self::evaluate(generic, ci, &attributes, &relations))
    }

    /// Every CI of `cis` that has `generic`, keyed by CI.
    pub fn get_effective_traits_for_trait(
        reader: &dyn RecordReader,
        generic: &GenericTrait,
        cis: &CiSelection,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<BTreeMap<CiId, EffectiveTrait>, StoreError> {
        let candidates = Self::candidates(reader, generic, cis, layers, at)?;
        if candidates.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut attributes = MergeEngine::get_merged_attributes(
            reader,
            &CiSelection::specific(candidates.iter().copied()),
            &attribute_selection(generic),
            layers,
            at,
        )?;
        let mut relations: BTreeMap<CiId, Vec<MergedRelation>> = BTreeMap::new();
        for merged in MergeEngine::get_merged_relations(
            reader,
            &relation_selection(generic, &candidates),
            layers,
            at,
        )? {
            for end in [merged.record.from, merged.record.to] {
                if candidates.contains(&end) {
                    relations.entry(end).or_default().push(merged.clone());
                }
            }
        }

        let mut result = BTreeMap::new();
        for ci in candidates {
            let ci_attributes = attributes.remove(&ci).unwrap_or_default();
            let ci_relations = relations.remove(&ci).unwrap_or_default();
            if let Some(effective) = Self::evaluate(generic, ci, &ci_attributes, &ci_relations) {
                result.insert(ci, effective);
            }
        }
        tracing::debug!(
            trait_id = %generic.id,
            layers = %layers,
            matched = result.len(),
            "evaluated trait"
        );
        Ok(result)
    }

    /// CIs of `cis` holding a merged attribute for every required name.
    fn candidates(
        reader: &dyn RecordReader,
        generic: &GenericTrait,
        cis: &CiSelection,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<BTreeSet<CiId>, StoreError> {
        let required: BTreeSet<String> = generic
            .required_attribute_names()
            .map(str::to_string)
            .collect();
        if required.is_empty() {
            return Ok(cis.resolve(&reader.ci_ids_at(at)?));
        }
        let present = MergeEngine::get_merged_attributes(
            reader,
            cis,
            &AttributeSelection::specific(required.iter().cloned()),
            layers,
            at,
        )?;
        Ok(present
            .into_iter()
            .filter(|(_, names)| required.iter().all(|n| names.contains_key(n)))
            .map(|(ci, _)| ci)
            .collect())
    }

    /// Every trait of `traits` that `ci` has, keyed by trait id.
    pub fn effective_traits_of_ci<'t>(
        reader: &dyn RecordReader,
        ci: CiId,
        traits: impl IntoIterator<Item = &'t GenericTrait>,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<BTreeMap<TraitId, EffectiveTrait>, StoreError> {
        if !CiModel::ci_exists_at(reader, ci, at)? {
            return Ok(BTreeMap::new());
        }
        let mut merged = MergeEngine::get_merged_attributes(
            reader,
            &CiSelection::specific([ci]),
            &AttributeSelection::All,
            layers,
            at,
        )?;
        let attributes = merged.remove(&ci).unwrap_or_default();
        let relations = MergeEngine::get_merged_relations(
            reader,
            &RelationSelection::either([ci]),
            layers,
            at,
        )?;
        Ok(traits
            .into_iter()
            .filter_map(|generic| Self::evaluate(generic, ci, &attributes, &relations))
            .map(|effective| (effective.trait_id.clone(), effective))
            .collect())
    }

    /// CIs of `cis` that have `generic`.
    pub fn cis_having_trait(
        reader: &dyn RecordReader,
        generic: &GenericTrait,
        cis: &CiSelection,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<BTreeSet<CiId>, StoreError> {
        Ok(
            Self::get_effective_traits_for_trait(reader, generic, cis, layers, at)?
                .into_keys()
                .collect(),
        )
    }

    /// CIs of `cis` existing at `at` that do not have `generic`.
    pub fn cis_lacking_trait(
        reader: &dyn RecordReader,
        generic: &GenericTrait,
        cis: &CiSelection,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<BTreeSet<CiId>, StoreError> {
        let having = Self::cis_having_trait(reader, generic, cis, layers, at)?;
        Ok(cis
            .resolve(&reader.ci_ids_at(at)?)
            .difference(&having)
            .copied()
            .collect())
    }
}

// =============================================================================
// TESTS
// =============================================================================
