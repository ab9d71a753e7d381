//! # Trait Flattening
//!
//! Turns [`RecursiveTrait`]s into [`GenericTrait`]s by unioning in every
//! transitively required trait.
//!
//! ## Rules
//!
//! - Encounter order: own required templates, own optional templates, then
//!   each required trait (already flattened) in declaration order.
//! - The earliest definition of a local identifier wins; a later, different
//!   definition is dropped and reported as a [`FlattenConflict`].
//! - An identifier required anywhere is required in the result.
//! - The trait graph is walked depth-first with grey/black colouring; a
//!   back edge is a [`StoreError::TraitCycle`].
//!
//! Flattening is a pure function of its input: the same definitions always
//! give structurally equal results.

use super::{GenericTrait, RecursiveTrait, TraitAttribute, TraitRelation};
use crate::primitives::MAX_TRAIT_DEPTH;
use crate::types::{StoreError, TraitId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Two contributors define one identifier differently.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlattenConflict {
    /// The trait being flattened.
    pub trait_id: TraitId,
    pub identifier: String,
    /// Contributor whose definition was kept.
    pub kept_from: TraitId,
    /// Contributor whose definition was dropped.
    pub dropped_from: TraitId,
}

/// Result of flattening a whole trait set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlattenReport {
    pub traits: BTreeMap<TraitId, GenericTrait>,
    pub conflicts: Vec<FlattenConflict>,
    /// Traits that could not be flattened.
    pub errors: BTreeMap<TraitId, StoreError>,
}

struct Entry<T> {
    item: T,
    required: bool,
    source: TraitId,
}

/// Accumulates templates in encounter order.
struct Accumulator {
    root: TraitId,
    attributes: Vec<Entry<TraitAttribute>>,
    relations: Vec<Entry<TraitRelation>>,
    ancestors: Vec<TraitId>,
    conflicts: Vec<FlattenConflict>,
}

impl Accumulator {
    fn new(root: TraitId) -> Self {
        Self {
            root,
            attributes: Vec::new(),
            relations: Vec::new(),
            ancestors: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    fn add_attribute(&mut self, item: &TraitAttribute, required: bool, source: &TraitId) {
        match self
            .attributes
            .iter_mut()
            .find(|e| e.item.identifier == item.identifier)
        {
            Some(existing) => {
                existing.required |= required;
                if existing.item.template != item.template {
                    self.conflicts.push(FlattenConflict {
                        trait_id: self.root.clone(),
                        identifier: item.identifier.clone(),
                        kept_from: existing.source.clone(),
                        dropped_from: source.clone(),
                    });
                }
            }
            None => self.attributes.push(Entry {
                item: item.clone(),
                required,
                source: source.clone(),
            }),
        }
    }

    fn add_relation(&mut self, item: &TraitRelation, required: bool, source: &TraitId) {
        match self
            .relations
            .iter_mut()
            .find(|e| e.item.identifier == item.identifier)
        {
            Some(existing) => {
                existing.required |= required;
                let same = existing.item.predicate == item.predicate
                    && existing.item.direction == item.direction
                    && existing.item.min_cardinality == item.min_cardinality
                    && existing.item.max_cardinality == item.max_cardinality;
                if !same {
                    self.conflicts.push(FlattenConflict {
                        trait_id: self.root.clone(),
                        identifier: item.identifier.clone(),
                        kept_from: existing.source.clone(),
                        dropped_from: source.clone(),
                    });
                }
            }
            None => self.relations.push(Entry {
                item: item.clone(),
                required,
                source: source.clone(),
            }),
        }
    }

    fn add_flattened(&mut self, sub: &GenericTrait) {
        for a in &sub.required_attributes {
            self.add_attribute(a, true, &sub.id);
        }
        for a in &sub.optional_attributes {
            self.add_attribute(a, false, &sub.id);
        }
        for r in &sub.required_relations {
            self.add_relation(r, true, &sub.id);
        }
        for r in &sub.optional_relations {
            self.add_relation(r, false, &sub.id);
        }
        for ancestor in std::iter::once(&sub.id).chain(&sub.ancestors) {
            if !self.ancestors.contains(ancestor) {
                self.ancestors.push(ancestor.clone());
            }
        }
    }

    fn finish(self, source: &RecursiveTrait) -> (GenericTrait, Vec<FlattenConflict>) {
        let (required_attributes, optional_attributes): (Vec<_>, Vec<_>) =
            self.attributes.into_iter().partition(|e| e.required);
        let (required_relations, optional_relations): (Vec<_>, Vec<_>) =
            self.relations.into_iter().partition(|e| e.required);
        let generic = GenericTrait {
            id: source.id.clone(),
            origin: source.origin,
            required_attributes: required_attributes.into_iter().map(|e| e.item).collect(),
            optional_attributes: optional_attributes.into_iter().map(|e| e.item).collect(),
            required_relations: required_relations.into_iter().map(|e| e.item).collect(),
            optional_relations: optional_relations.into_iter().map(|e| e.item).collect(),
            ancestors: self.ancestors,
        };
        (generic, self.conflicts)
    }
}

type Flattened = Result<(GenericTrait, Vec<FlattenConflict>), StoreError>;

/// Depth-first, memoized flattener over one set of definitions.
pub struct TraitFlattener<'a> {
    sources: &'a BTreeMap<TraitId, RecursiveTrait>,
    /// Black: finished traits.
    done: BTreeMap<TraitId, Flattened>,
    /// Grey: traits on the current DFS path.
    path: Vec<TraitId>,
}

impl<'a> TraitFlattener<'a> {
    #[must_use]
    pub fn new(sources: &'a BTreeMap<TraitId, RecursiveTrait>) -> Self {
        Self {
            sources,
            done: BTreeMap::new(),
            path: Vec::new(),
        }
    }

    /// Flatten one trait.
    pub fn flatten(&mut self, id: &TraitId) -> Result<GenericTrait, StoreError> {
        self.visit(id).map(|(generic, _)| generic)
    }

    /// Flatten every trait, collecting failures instead of stopping at them.
    #[must_use]
    pub fn flatten_all(mut self) -> FlattenReport {
        for id in self.sources.keys() {
            let _ = self.visit(id);
        }
        let mut report = FlattenReport::default();
        for (id, result) in self.done {
            match result {
                Ok((generic, conflicts)) => {
                    report.conflicts.extend(conflicts);
                    report.traits.insert(id, generic);
                }
                Err(e) => {
                    tracing::warn!(trait_id = %id, error = %e, "trait excluded");
                    report.errors.insert(id, e);
                }
            }
        }
        report
    }

    fn visit(&mut self, id: &TraitId) -> Flattened {
        if let Some(done) = self.done.get(id) {
            return done.clone();
        }
        if let Some(start) = self.path.iter().position(|p| p == id) {
            let mut cycle = self.path[start..].to_vec();
            cycle.push(id.clone());
            return Err(StoreError::TraitCycle(cycle));
        }
        if self.path.len() >= MAX_TRAIT_DEPTH {
            return Err(StoreError::InvalidState(format!(
                "Trait {} nests deeper than {} levels",
                id, MAX_TRAIT_DEPTH
            )));
        }
        let Some(source) = self.sources.get(id) else {
            return Err(StoreError::NotFound(format!("Trait {}", id)));
        };

        self.path.push(id.clone());
        let result = self.flatten_source(source);
        self.path.pop();
        self.done.insert(id.clone(), result.clone());
        result
    }

    fn flatten_source(&mut self, source: &RecursiveTrait) -> Flattened {
        let mut acc = Accumulator::new(source.id.clone());
        for a in &source.required_attributes {
            acc.add_attribute(a, true, &source.id);
        }
        for a in &source.optional_attributes {
            acc.add_attribute(a, false, &source.id);
        }
        for r in &source.required_relations {
            acc.add_relation(r, true, &source.id);
        }
        for r in &source.optional_relations {
            acc.add_relation(r, false, &source.id);
        }
        for required in &source.required_traits {
            let (sub, _) = self.visit(required)?;
            acc.add_flattened(&sub);
        }
        Ok(acc.finish(source))
    }
}

/// Flatten a trait that requires no other trait.
pub fn flatten_standalone(source: RecursiveTrait) -> Result<GenericTrait, StoreError> {
    let id = source.id.clone();
    let sources = BTreeMap::from([(id.clone(), source)]);
    TraitFlattener::new(&sources).flatten(&id)
}

// =============================================================================
// TESTS
// =============================================================================
