//! # Merge Engine
//!
//! Resolves the records of several layers into one view.
//!
//! ## Merge Rule
//!
//! For one key, layers are visited in LayerSet order. The first layer whose
//! current record is not `Removed` decides: a live record wins, a mask makes
//! the key absent. Every layer holding any current record for the key
//! (removed and masked included) is listed in the layer stack, most
//! precedent first. Layers whose current record is a mask are also listed
//! in `masked_layers`.
//!
//! Reads apply masks by default. [`MaskHandlingForRetrieval::GetMasks`]
//! returns a winning mask record instead of dropping the key, for callers
//! that need to see what a layer hides.
//!
//! ## Batching
//!
//! Batched reads go layer by layer: one store scan per layer, never one per
//! CI and layer.

use crate::layer::LayerSet;
use crate::primitives::NAME_ATTRIBUTE;
use crate::selection::{AttributeSelection, CiSelection, RelationSelection};
use crate::storage::RecordReader;
use crate::types::{
    AttributeRecord, AttributeValue, CiId, LayerId, RelationKey, RelationRecord, StoreError,
    TimeThreshold,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// MERGED VIEWS
// =============================================================================

/// What a read does with a mask that decides a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskHandlingForRetrieval {
    /// The key is absent.
    #[default]
    ApplyMasks,
    /// The mask record is returned as the merged record.
    GetMasks,
}

/// The merged value of one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedAttribute {
    /// The winning record.
    pub record: AttributeRecord,
    /// Layers holding any record for the key, most precedent first.
    pub layer_stack: Vec<LayerId>,
    /// Layers of `layer_stack` whose current record is a mask.
    #[serde(default)]
    pub masked_layers: Vec<LayerId>,
}

impl MergedAttribute {
    #[must_use]
    pub fn value(&self) -> &AttributeValue {
        &self.record.value
    }
}

/// One merged relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedRelation {
    pub record: RelationRecord,
    pub layer_stack: Vec<LayerId>,
    #[serde(default)]
    pub masked_layers: Vec<LayerId>,
}

impl MergedRelation {
    #[must_use]
    pub fn key(&self) -> RelationKey {
        self.record.key()
    }
}

/// All merged attributes of one CI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedCi {
    pub id: CiId,
    pub layers: LayerSet,
    pub at: TimeThreshold,
    pub attributes: BTreeMap<String, MergedAttribute>,
}

impl MergedCi {
    /// Value of the `__name` attribute, if it is text.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.attributes
            .get(NAME_ATTRIBUTE)
            .and_then(|a| a.value().as_text())
    }

    /// Last time any attribute of this CI changed, over the merged view.
    #[must_use]
    pub fn last_change(&self) -> Option<DateTime<Utc>> {
        self.attributes.values().map(|a| a.record.timestamp).max()
    }
}

// =============================================================================
// FOLDING
// =============================================================================

/// The per-record facts the merge rule looks at.
trait Layered: Clone {
    fn removed(&self) -> bool;
    fn masked(&self) -> bool;
}

impl Layered for AttributeRecord {
    fn removed(&self) -> bool {
        self.state.is_removed()
    }

    fn masked(&self) -> bool {
        self.is_mask()
    }
}

impl Layered for RelationRecord {
    fn removed(&self) -> bool {
        self.state.is_removed()
    }

    fn masked(&self) -> bool {
        self.is_mask()
    }
}

enum Outcome<R> {
    Open,
    Won(R),
    Masked(R),
}

/// A decided key: winning record, layer stack, masked layers.
type Decided<R> = (R, Vec<LayerId>, Vec<LayerId>);

/// Merge state of one key while folding layers in precedence order.
struct Slot<R> {
    outcome: Outcome<R>,
    stack: Vec<LayerId>,
    masked: Vec<LayerId>,
}

impl<R: Layered> Slot<R> {
    fn new() -> Self {
        Self {
            outcome: Outcome::Open,
            stack: Vec::new(),
            masked: Vec::new(),
        }
    }

    /// Feed the current record of the next layer down.
    fn push(&mut self, layer: &LayerId, record: R) {
        self.stack.push(layer.clone());
        if record.masked() {
            self.masked.push(layer.clone());
        }
        if matches!(self.outcome, Outcome::Open) && !record.removed() {
            self.outcome = if record.masked() {
                Outcome::Masked(record)
            } else {
                Outcome::Won(record)
            };
        }
    }

    fn finish(self, masks: MaskHandlingForRetrieval) -> Option<Decided<R>> {
        match (self.outcome, masks) {
            (Outcome::Won(record), _)
            | (Outcome::Masked(record), MaskHandlingForRetrieval::GetMasks) => {
                Some((record, self.stack, self.masked))
            }
            (Outcome::Open, _) | (Outcome::Masked(_), MaskHandlingForRetrieval::ApplyMasks) => {
                None
            }
        }
    }
}

/// Fold per-layer records (fed in precedence order) into merged winners.
struct Folder<K, R> {
    slots: BTreeMap<K, Slot<R>>,
}

impl<K: Ord, R: Layered> Folder<K, R> {
    fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }

    fn push(&mut self, key: K, layer: &LayerId, record: R) {
        self.slots
            .entry(key)
            .or_insert_with(Slot::new)
            .push(layer, record);
    }

    fn finish(self, masks: MaskHandlingForRetrieval) -> impl Iterator<Item = (K, Decided<R>)> {
        self.slots
            .into_iter()
            .filter_map(move |(k, slot)| slot.finish(masks).map(|decided| (k, decided)))
    }
}

// =============================================================================
// MERGE ENGINE
// =============================================================================

/// Layer-precedence merge over the record store.
pub struct MergeEngine;

impl MergeEngine {
    /// Merged value of one attribute.
    pub fn get_merged_attribute(
        reader: &dyn RecordReader,
        ci: CiId,
        name: &str,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<Option<MergedAttribute>, StoreError> {
        let mut slot = Slot::new();
        for layer in layers {
            if let Some(record) = reader.current_attribute(ci, name, layer, at)? {
                slot.push(layer, record);
            }
        }
        Ok(slot
            .finish(MaskHandlingForRetrieval::ApplyMasks)
            .map(|(record, layer_stack, masked_layers)| MergedAttribute {
                record,
                layer_stack,
                masked_layers,
            }))
    }

    /// Merged attributes of many CIs, one scan per layer.
    ///
    /// CIs without any merged attribute are absent from the result.
    pub fn get_merged_attributes(
        reader: &dyn RecordReader,
        cis: &CiSelection,
        names: &AttributeSelection,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<BTreeMap<CiId, BTreeMap<String, MergedAttribute>>, StoreError> {
        Self::get_merged_attributes_with(
            reader,
            cis,
            names,
            layers,
            at,
            MaskHandlingForRetrieval::ApplyMasks,
        )
    }

    /// [`MergeEngine::get_merged_attributes`] with an explicit mask handling.
    pub fn get_merged_attributes_with(
        reader: &dyn RecordReader,
        cis: &CiSelection,
        names: &AttributeSelection,
        layers: &LayerSet,
        at: TimeThreshold,
        masks: MaskHandlingForRetrieval,
    ) -> Result<BTreeMap<CiId, BTreeMap<String, MergedAttribute>>, StoreError> {
        let mut folder = Folder::new();
        if !cis.is_none() && !names.is_none() {
            for layer in layers {
                for record in reader.current_attributes(layer, cis, names, at)? {
                    folder.push((record.ci, record.name.clone()), layer, record);
                }
            }
        }

        let mut merged: BTreeMap<CiId, BTreeMap<String, MergedAttribute>> = BTreeMap::new();
        for ((ci, name), (record, layer_stack, masked_layers)) in folder.finish(masks) {
            merged.entry(ci).or_default().insert(
                name,
                MergedAttribute {
                    record,
                    layer_stack,
                    masked_layers,
                },
            );
        }
        Ok(merged)
    }

    /// Merged view of one CI. A CI without data yields an empty view.
    pub fn get_merged_ci(
        reader: &dyn RecordReader,
        ci: CiId,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<MergedCi, StoreError> {
        let mut merged = Self::get_merged_attributes(
            reader,
            &CiSelection::specific([ci]),
            &AttributeSelection::All,
            layers,
            at,
        )?;
        Ok(MergedCi {
            id: ci,
            layers: layers.clone(),
            at,
            attributes: merged.remove(&ci).unwrap_or_default(),
        })
    }

    /// Merged views of every CI in `cis` that existed at `at`, ordered by CI id.
    pub fn get_merged_cis(
        reader: &dyn RecordReader,
        cis: &CiSelection,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<Vec<MergedCi>, StoreError> {
        let ids = cis.resolve(&reader.ci_ids_at(at)?);
        let mut merged = Self::get_merged_attributes(
            reader,
            &CiSelection::specific(ids.iter().copied()),
            &AttributeSelection::All,
            layers,
            at,
        )?;
        Ok(ids
            .into_iter()
            .map(|id| MergedCi {
                id,
                layers: layers.clone(),
                at,
                attributes: merged.remove(&id).unwrap_or_default(),
            })
            .collect())
    }

    /// Merged state of one relation.
    pub fn get_merged_relation(
        reader: &dyn RecordReader,
        key: &RelationKey,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<Option<MergedRelation>, StoreError> {
        let mut slot = Slot::new();
        for layer in layers {
            if let Some(record) = reader.current_relation(key, layer, at)? {
                slot.push(layer, record);
            }
        }
        Ok(slot
            .finish(MaskHandlingForRetrieval::ApplyMasks)
            .map(|(record, layer_stack, masked_layers)| MergedRelation {
                record,
                layer_stack,
                masked_layers,
            }))
    }

    /// Merged relations matching `selection`, ordered by key.
    pub fn get_merged_relations(
        reader: &dyn RecordReader,
        selection: &RelationSelection,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<Vec<MergedRelation>, StoreError> {
        Self::get_merged_relations_with(
            reader,
            selection,
            layers,
            at,
            MaskHandlingForRetrieval::ApplyMasks,
        )
    }

    /// [`MergeEngine::get_merged_relations`] with an explicit mask handling.
    pub fn get_merged_relations_with(
        reader: &dyn RecordReader,
        selection: &RelationSelection,
        layers: &LayerSet,
        at: TimeThreshold,
        masks: MaskHandlingForRetrieval,
    ) -> Result<Vec<MergedRelation>, StoreError> {
        let mut folder = Folder::new();
        for layer in layers {
            for record in reader.current_relations(layer, selection, at)? {
                folder.push(record.key(), layer, record);
            }
        }
        Ok(folder
            .finish(masks)
            .map(|(_, (record, layer_stack, masked_layers))| MergedRelation {
                record,
                layer_stack,
                masked_layers,
            })
            .collect())
    }
}

// =============================================================================
// TESTS
// =============================================================================
