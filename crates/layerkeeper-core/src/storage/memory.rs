//! # In-Memory Storage
//!
//! A volatile backend holding the ledgers in ordered maps.
//!
//! A write transaction works on a staged copy of the whole state and swaps
//! it in on commit, so an abandoned transaction leaves no trace.
//!
//! Beginning a transaction therefore costs O(state) in time and memory.
//! This backend serves tests and small scratch sessions; large datasets
//! belong in the redb backend, whose transactions are copy-on-write.

use super::{RecordCounts, RecordReader, RecordWriter};
use crate::layer::Layer;
use crate::selection::{AttributeSelection, CiSelection, RelationSelection};
use crate::types::{
    AttributeRecord, Changeset, ChangesetId, CiId, LayerId, LedgerEntry, PredicateId,
    RelationKey, RelationRecord, StoreError, TimeThreshold,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

type AttributeSlot = (LayerId, CiId, String);
type RelationSlot = (LayerId, CiId, CiId, PredicateId);

/// The complete contents of an in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    attributes: BTreeMap<AttributeSlot, Vec<AttributeRecord>>,
    relations: BTreeMap<RelationSlot, Vec<RelationRecord>>,
    changesets: BTreeMap<ChangesetId, Changeset>,
    ledger: BTreeMap<ChangesetId, Vec<LedgerEntry>>,
    cis: BTreeMap<CiId, DateTime<Utc>>,
    layers: BTreeMap<LayerId, Layer>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Pick the newest admissible row; later appends win timestamp ties.
fn current_of<R: Clone>(
    history: &[R],
    at: TimeThreshold,
    timestamp: impl Fn(&R) -> DateTime<Utc>,
) -> Option<R> {
    history
        .iter()
        .enumerate()
        .filter(|(_, r)| at.admits(timestamp(r)))
        .max_by_key(|(i, r)| (timestamp(r), *i))
        .map(|(_, r)| r.clone())
}

fn ordered<R: Clone>(history: &[R], timestamp: impl Fn(&R) -> DateTime<Utc>) -> Vec<R> {
    let mut rows = history.to_vec();
    rows.sort_by_key(|r| timestamp(r));
    rows
}

impl MemoryState {
    fn layer_attribute_slots<'a>(
        &'a self,
        layer: &'a LayerId,
        cis: &'a CiSelection,
    ) -> Box<dyn Iterator<Item = (&'a AttributeSlot, &'a Vec<AttributeRecord>)> + 'a> {
        match cis.as_specific() {
            Some(specific) => Box::new(specific.iter().flat_map(move |ci| {
                self.attributes
                    .range((layer.clone(), *ci, String::new())..)
                    .take_while(move |((l, c, _), _)| l == layer && c == ci)
            })),
            None => Box::new(
                self.attributes
                    .range((layer.clone(), CiId::from_u128(0), String::new())..)
                    .take_while(move |((l, _, _), _)| l == layer),
            ),
        }
    }

    fn touch_ci(&mut self, ci: CiId, at: DateTime<Utc>) {
        self.cis.entry(ci).or_insert(at);
    }

    fn record_entry(&mut self, changeset: ChangesetId, entry: LedgerEntry) {
        self.ledger.entry(changeset).or_default().push(entry);
    }
}

impl RecordReader for MemoryState {
    fn current_attribute(
        &self,
        ci: CiId,
        name: &str,
        layer: &LayerId,
        at: TimeThreshold,
    ) -> Result<Option<AttributeRecord>, StoreError> {
        Ok(self
            .attributes
            .get(&(layer.clone(), ci, name.to_string()))
            .and_then(|h| current_of(h, at, |r| r.timestamp)))
    }

    fn current_attributes(
        &self,
        layer: &LayerId,
        cis: &CiSelection,
        names: &AttributeSelection,
        at: TimeThreshold,
    ) -> Result<Vec<AttributeRecord>, StoreError> {
        if cis.is_none() || names.is_none() {
            return Ok(Vec::new());
        }
        Ok(self
            .layer_attribute_slots(layer, cis)
            .filter(|((_, ci, name), _)| cis.contains(ci) && names.contains(name))
            .filter_map(|(_, history)| current_of(history, at, |r| r.timestamp))
            .collect())
    }

    fn attribute_history(
        &self,
        ci: CiId,
        name: &str,
        layer: &LayerId,
    ) -> Result<Vec<AttributeRecord>, StoreError> {
        Ok(self
            .attributes
            .get(&(layer.clone(), ci, name.to_string()))
            .map(|h| ordered(h, |r| r.timestamp))
            .unwrap_or_default())
    }

    fn current_relation(
        &self,
        key: &RelationKey,
        layer: &LayerId,
        at: TimeThreshold,
    ) -> Result<Option<RelationRecord>, StoreError> {
        Ok(self
            .relations
            .get(&(layer.clone(), key.from, key.to, key.predicate.clone()))
            .and_then(|h| current_of(h, at, |r| r.timestamp)))
    }

    fn current_relations(
        &self,
        layer: &LayerId,
        selection: &RelationSelection,
        at: TimeThreshold,
    ) -> Result<Vec<RelationRecord>, StoreError> {
        let rows = self
            .relations
            .iter()
            .filter(|((l, from, to, predicate), _)| {
                l == layer && selection.matches(&RelationKey::new(*from, *to, predicate.clone()))
            })
            .filter_map(|(_, history)| current_of(history, at, |r| r.timestamp))
            .collect();
        Ok(rows)
    }

    fn relation_history(
        &self,
        key: &RelationKey,
        layer: &LayerId,
    ) -> Result<Vec<RelationRecord>, StoreError> {
        Ok(self
            .relations
            .get(&(layer.clone(), key.from, key.to, key.predicate.clone()))
            .map(|h| ordered(h, |r| r.timestamp))
            .unwrap_or_default())
    }

    fn changeset(&self, id: ChangesetId) -> Result<Option<Changeset>, StoreError> {
        Ok(self.changesets.get(&id).cloned())
    }

    fn changesets(&self) -> Result<Vec<Changeset>, StoreError> {
        Ok(self.changesets.values().cloned().collect())
    }

    fn changeset_entries(&self, id: ChangesetId) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self.ledger.get(&id).cloned().unwrap_or_default())
    }

    fn ci_exists(&self, ci: CiId) -> Result<bool, StoreError> {
        Ok(self.cis.contains_key(&ci))
    }

    fn ci_created(&self, ci: CiId) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.cis.get(&ci).copied())
    }

    fn ci_ids_at(&self, at: TimeThreshold) -> Result<BTreeSet<CiId>, StoreError> {
        Ok(self
            .cis
            .iter()
            .filter(|(_, created)| at.admits(**created))
            .map(|(ci, _)| *ci)
            .collect())
    }

    fn layer(&self, id: &LayerId) -> Result<Option<Layer>, StoreError> {
        Ok(self.layers.get(id).cloned())
    }

    fn layers(&self) -> Result<Vec<Layer>, StoreError> {
        Ok(self.layers.values().cloned().collect())
    }

    fn record_counts(&self, layer: &LayerId) -> Result<RecordCounts, StoreError> {
        let attribute_records = self
            .attributes
            .iter()
            .filter(|((l, _, _), _)| l == layer)
            .map(|(_, h)| h.len() as u64)
            .sum();
        let relation_records = self
            .relations
            .iter()
            .filter(|((l, _, _, _), _)| l == layer)
            .map(|(_, h)| h.len() as u64)
            .sum();
        Ok(RecordCounts {
            attribute_records,
            relation_records,
        })
    }

    fn last_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.last_timestamp)
    }
}

// =============================================================================
// STORE & TRANSACTIONS
// =============================================================================

/// A volatile record store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: MemoryState,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed state, readable without a transaction.
    #[must_use]
    pub fn state(&self) -> &MemoryState {
        &self.state
    }

    /// Start a write transaction on a staged copy.
    ///
    /// Clones the full committed state, so the cost grows with the store.
    pub fn begin_write(&mut self) -> MemoryWriteTxn<'_> {
        let staged = self.state.clone();
        MemoryWriteTxn {
            target: &mut self.state,
            staged,
        }
    }
}

/// A write transaction against a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryWriteTxn<'a> {
    target: &'a mut MemoryState,
    staged: MemoryState,
}

impl RecordWriter for MemoryWriteTxn<'_> {
    fn reader(&self) -> &dyn RecordReader {
        &self.staged
    }

    fn append_attribute(&mut self, record: &AttributeRecord) -> Result<(), StoreError> {
        let state = &mut self.staged;
        state.touch_ci(record.ci, record.timestamp);
        state
            .attributes
            .entry((record.layer.clone(), record.ci, record.name.clone()))
            .or_default()
            .push(record.clone());
        state.record_entry(record.changeset, LedgerEntry::Attribute(record.clone()));
        Ok(())
    }

    fn append_relation(&mut self, record: &RelationRecord) -> Result<(), StoreError> {
        let state = &mut self.staged;
        state.touch_ci(record.from, record.timestamp);
        state.touch_ci(record.to, record.timestamp);
        state
            .relations
            .entry((
                record.layer.clone(),
                record.from,
                record.to,
                record.predicate.clone(),
            ))
            .or_default()
            .push(record.clone());
        state.record_entry(record.changeset, LedgerEntry::Relation(record.clone()));
        Ok(())
    }

    fn append_changeset(&mut self, changeset: &Changeset) -> Result<(), StoreError> {
        let state = &mut self.staged;
        if state.changesets.contains_key(&changeset.id) {
            return Err(StoreError::InvalidState(format!(
                "Changeset {} already exists",
                changeset.id
            )));
        }
        state.last_timestamp = state.last_timestamp.max(Some(changeset.timestamp));
        state.changesets.insert(changeset.id, changeset.clone());
        Ok(())
    }

    fn insert_ci(&mut self, ci: CiId, created: DateTime<Utc>) -> Result<(), StoreError> {
        self.staged.touch_ci(ci, created);
        Ok(())
    }

    fn put_layer(&mut self, layer: &Layer) -> Result<(), StoreError> {
        self.staged.layers.insert(layer.id.clone(), layer.clone());
        Ok(())
    }

    fn delete_layer(&mut self, id: &LayerId) -> Result<bool, StoreError> {
        Ok(self.staged.layers.remove(id).is_some())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let txn = *self;
        *txn.target = txn.staged;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
