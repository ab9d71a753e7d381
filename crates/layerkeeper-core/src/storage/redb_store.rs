//! # redb-backed Record Storage
//!
//! A disk-backed record store using the redb embedded database, providing:
//! - ACID write transactions (one writer at a time)
//! - MVCC read transactions: a read sees a consistent snapshot as of its start
//! - Crash safety (copy-on-write B-trees)
//!
//! ## Layout
//!
//! History tables are keyed layer-first so that a merge can range-scan one
//! layer at a time. Inside a key the timestamp (microseconds) and a global
//! append sequence order the history of one attribute or relation:
//!
//! ```text
//! attributes: (layer, ci, name, ts, seq)                -> AttributeRecord
//! relations:  (layer, from, to, predicate, ts, seq)     -> RelationRecord
//! changesets: changeset                                 -> Changeset
//! ledger:     (changeset, seq)                          -> LedgerEntry
//! ```
//!
//! Values are postcard-encoded.

use super::{RecordCounts, RecordReader, RecordWriter};
use crate::layer::Layer;
use crate::selection::{AttributeSelection, CiSelection, RelationSelection};
use crate::types::{
    AttributeRecord, Changeset, ChangesetId, CiId, LayerId, LedgerEntry, RelationKey,
    RelationRecord, StoreError, TimeThreshold,
};
use chrono::{DateTime, Utc};
use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition,
    WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

type AttrKey = (&'static str, u128, &'static str, i64, u64);
type RelKey = (&'static str, u128, u128, &'static str, i64, u64);

/// Attribute history: (layer, ci, name, ts, seq) -> AttributeRecord
const ATTRIBUTES: TableDefinition<AttrKey, &[u8]> = TableDefinition::new("attributes");

/// Relation history: (layer, from, to, predicate, ts, seq) -> RelationRecord
const RELATIONS: TableDefinition<RelKey, &[u8]> = TableDefinition::new("relations");

/// Changesets: id -> Changeset
const CHANGESETS: TableDefinition<u128, &[u8]> = TableDefinition::new("changesets");

/// Rows by writing changeset: (changeset, seq) -> LedgerEntry
const LEDGER: TableDefinition<(u128, u64), &[u8]> = TableDefinition::new("ledger");

/// Known CIs: id -> creation time (µs)
const CIS: TableDefinition<u128, i64> = TableDefinition::new("cis");

/// Layer registry: id -> Layer
const LAYERS: TableDefinition<&str, &[u8]> = TableDefinition::new("layers");

/// Counters: key -> value
const METADATA: TableDefinition<&str, i64> = TableDefinition::new("metadata");

const NEXT_SEQ: &str = "next_seq";
const LAST_TIMESTAMP: &str = "last_timestamp";

fn transient(e: impl std::fmt::Display) -> StoreError {
    StoreError::TransientStore(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    postcard::to_allocvec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    postcard::from_bytes(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
}

// =============================================================================
// TABLE READS (shared by read and write transactions)
// =============================================================================

fn current_attribute_in(
    table: &impl ReadableTable<AttrKey, &'static [u8]>,
    ci: CiId,
    name: &str,
    layer: &LayerId,
    at: TimeThreshold,
) -> Result<Option<AttributeRecord>, StoreError> {
    let (l, c) = (layer.as_str(), ci.as_u128());
    let last = table
        .range((l, c, name, i64::MIN, 0u64)..=(l, c, name, at.bound_micros(), u64::MAX))
        .map_err(transient)?
        .next_back();
    match last {
        Some(entry) => {
            let (_, value) = entry.map_err(transient)?;
            decode(value.value()).map(Some)
        }
        None => Ok(None),
    }
}

/// Scan `layer` from `start_ci`, keeping the newest admissible row per (ci, name).
fn scan_attributes(
    table: &impl ReadableTable<AttrKey, &'static [u8]>,
    layer: &LayerId,
    start_ci: u128,
    only_ci: Option<u128>,
    names: &AttributeSelection,
    bound: i64,
    current: &mut BTreeMap<(u128, String), Vec<u8>>,
) -> Result<(), StoreError> {
    let l = layer.as_str();
    for entry in table
        .range((l, start_ci, "", i64::MIN, 0u64)..)
        .map_err(transient)?
    {
        let (key, value) = entry.map_err(transient)?;
        let (row_layer, ci, name, ts, _) = key.value();
        if row_layer != l || only_ci.is_some_and(|only| only != ci) {
            break;
        }
        if ts <= bound && names.contains(&name.to_string()) {
            current.insert((ci, name.to_string()), value.value().to_vec());
        }
    }
    Ok(())
}

fn current_attributes_in(
    table: &impl ReadableTable<AttrKey, &'static [u8]>,
    layer: &LayerId,
    cis: &CiSelection,
    names: &AttributeSelection,
    at: TimeThreshold,
) -> Result<Vec<AttributeRecord>, StoreError> {
    if cis.is_none() || names.is_none() {
        return Ok(Vec::new());
    }
    let bound = at.bound_micros();
    let mut current = BTreeMap::new();
    match cis.as_specific() {
        Some(specific) => {
            for ci in specific {
                let c = ci.as_u128();
                scan_attributes(table, layer, c, Some(c), names, bound, &mut current)?;
            }
        }
        None => scan_attributes(table, layer, 0, None, names, bound, &mut current)?,
    }
    current
        .into_iter()
        .filter(|((ci, _), _)| cis.contains(&CiId::from_u128(*ci)))
        .map(|(_, bytes)| decode(&bytes))
        .collect()
}

fn attribute_history_in(
    table: &impl ReadableTable<AttrKey, &'static [u8]>,
    ci: CiId,
    name: &str,
    layer: &LayerId,
) -> Result<Vec<AttributeRecord>, StoreError> {
    let (l, c) = (layer.as_str(), ci.as_u128());
    let mut rows = Vec::new();
    for entry in table
        .range((l, c, name, i64::MIN, 0u64)..=(l, c, name, i64::MAX, u64::MAX))
        .map_err(transient)?
    {
        let (_, value) = entry.map_err(transient)?;
        rows.push(decode(value.value())?);
    }
    Ok(rows)
}

fn current_relation_in(
    table: &impl ReadableTable<RelKey, &'static [u8]>,
    key: &RelationKey,
    layer: &LayerId,
    at: TimeThreshold,
) -> Result<Option<RelationRecord>, StoreError> {
    let (l, f, t, p) = (
        layer.as_str(),
        key.from.as_u128(),
        key.to.as_u128(),
        key.predicate.as_str(),
    );
    let last = table
        .range((l, f, t, p, i64::MIN, 0u64)..=(l, f, t, p, at.bound_micros(), u64::MAX))
        .map_err(transient)?
        .next_back();
    match last {
        Some(entry) => {
            let (_, value) = entry.map_err(transient)?;
            decode(value.value()).map(Some)
        }
        None => Ok(None),
    }
}

fn scan_relations(
    table: &impl ReadableTable<RelKey, &'static [u8]>,
    layer: &LayerId,
    only_from: Option<u128>,
    bound: i64,
    current: &mut BTreeMap<(u128, u128, String), Vec<u8>>,
) -> Result<(), StoreError> {
    let l = layer.as_str();
    let start = only_from.unwrap_or(0);
    for entry in table
        .range((l, start, 0u128, "", i64::MIN, 0u64)..)
        .map_err(transient)?
    {
        let (key, value) = entry.map_err(transient)?;
        let (row_layer, from, to, predicate, ts, _) = key.value();
        if row_layer != l || only_from.is_some_and(|only| only != from) {
            break;
        }
        if ts <= bound {
            current.insert((from, to, predicate.to_string()), value.value().to_vec());
        }
    }
    Ok(())
}

fn current_relations_in(
    table: &impl ReadableTable<RelKey, &'static [u8]>,
    layer: &LayerId,
    selection: &RelationSelection,
    at: TimeThreshold,
) -> Result<Vec<RelationRecord>, StoreError> {
    let bound = at.bound_micros();
    let mut current = BTreeMap::new();
    match selection.source_hint() {
        Some(sources) => {
            for from in sources {
                scan_relations(table, layer, Some(from.as_u128()), bound, &mut current)?;
            }
        }
        None => scan_relations(table, layer, None, bound, &mut current)?,
    }
    let mut rows = Vec::with_capacity(current.len());
    for bytes in current.into_values() {
        let record: RelationRecord = decode(&bytes)?;
        if selection.matches(&record.key()) {
            rows.push(record);
        }
    }
    Ok(rows)
}

fn relation_history_in(
    table: &impl ReadableTable<RelKey, &'static [u8]>,
    key: &RelationKey,
    layer: &LayerId,
) -> Result<Vec<RelationRecord>, StoreError> {
    let (l, f, t, p) = (
        layer.as_str(),
        key.from.as_u128(),
        key.to.as_u128(),
        key.predicate.as_str(),
    );
    let mut rows = Vec::new();
    for entry in table
        .range((l, f, t, p, i64::MIN, 0u64)..=(l, f, t, p, i64::MAX, u64::MAX))
        .map_err(transient)?
    {
        let (_, value) = entry.map_err(transient)?;
        rows.push(decode(value.value())?);
    }
    Ok(rows)
}

fn count_layer_attributes(
    table: &impl ReadableTable<AttrKey, &'static [u8]>,
    layer: &LayerId,
) -> Result<u64, StoreError> {
    let l = layer.as_str();
    let mut count = 0u64;
    for entry in table.range((l, 0u128, "", i64::MIN, 0u64)..).map_err(transient)? {
        let (key, _) = entry.map_err(transient)?;
        if key.value().0 != l {
            break;
        }
        count = count.saturating_add(1);
    }
    Ok(count)
}

fn count_layer_relations(
    table: &impl ReadableTable<RelKey, &'static [u8]>,
    layer: &LayerId,
) -> Result<u64, StoreError> {
    let l = layer.as_str();
    let mut count = 0u64;
    for entry in table
        .range((l, 0u128, 0u128, "", i64::MIN, 0u64)..)
        .map_err(transient)?
    {
        let (key, _) = entry.map_err(transient)?;
        if key.value().0 != l {
            break;
        }
        count = count.saturating_add(1);
    }
    Ok(count)
}

fn decode_all<T: DeserializeOwned>(
    table: &impl ReadableTable<u128, &'static [u8]>,
) -> Result<Vec<T>, StoreError> {
    let mut rows = Vec::new();
    for entry in table.iter().map_err(transient)? {
        let (_, value) = entry.map_err(transient)?;
        rows.push(decode(value.value())?);
    }
    Ok(rows)
}

// Read and write transactions expose the same `open_table` surface, so the
// reader implementation is shared.
macro_rules! impl_record_reader {
    ($txn:ty) => {
        impl RecordReader for $txn {
            fn current_attribute(
                &self,
                ci: CiId,
                name: &str,
                layer: &LayerId,
                at: TimeThreshold,
            ) -> Result<Option<AttributeRecord>, StoreError> {
                let table = self.txn.open_table(ATTRIBUTES).map_err(transient)?;
                current_attribute_in(&table, ci, name, layer, at)
            }

            fn current_attributes(
                &self,
                layer: &LayerId,
                cis: &CiSelection,
                names: &AttributeSelection,
                at: TimeThreshold,
            ) -> Result<Vec<AttributeRecord>, StoreError> {
                let table = self.txn.open_table(ATTRIBUTES).map_err(transient)?;
                current_attributes_in(&table, layer, cis, names, at)
            }

            fn attribute_history(
                &self,
                ci: CiId,
                name: &str,
                layer: &LayerId,
            ) -> Result<Vec<AttributeRecord>, StoreError> {
                let table = self.txn.open_table(ATTRIBUTES).map_err(transient)?;
                attribute_history_in(&table, ci, name, layer)
            }

            fn current_relation(
                &self,
                key: &RelationKey,
                layer: &LayerId,
                at: TimeThreshold,
            ) -> Result<Option<RelationRecord>, StoreError> {
                let table = self.txn.open_table(RELATIONS).map_err(transient)?;
                current_relation_in(&table, key, layer, at)
            }

            fn current_relations(
                &self,
                layer: &LayerId,
                selection: &RelationSelection,
                at: TimeThreshold,
            ) -> Result<Vec<RelationRecord>, StoreError> {
                let table = self.txn.open_table(RELATIONS).map_err(transient)?;
                current_relations_in(&table, layer, selection, at)
            }

            fn relation_history(
                &self,
                key: &RelationKey,
                layer: &LayerId,
            ) -> Result<Vec<RelationRecord>, StoreError> {
                let table = self.txn.open_table(RELATIONS).map_err(transient)?;
                relation_history_in(&table, key, layer)
            }

            fn changeset(&self, id: ChangesetId) -> Result<Option<Changeset>, StoreError> {
                let table = self.txn.open_table(CHANGESETS).map_err(transient)?;
                let row = table.get(id.as_u128()).map_err(transient)?;
                row.map(|v| decode(v.value())).transpose()
            }

            fn changesets(&self) -> Result<Vec<Changeset>, StoreError> {
                let table = self.txn.open_table(CHANGESETS).map_err(transient)?;
                decode_all(&table)
            }

            fn changeset_entries(
                &self,
                id: ChangesetId,
            ) -> Result<Vec<LedgerEntry>, StoreError> {
                let table = self.txn.open_table(LEDGER).map_err(transient)?;
                let c = id.as_u128();
                let mut rows = Vec::new();
                for entry in table.range((c, 0u64)..=(c, u64::MAX)).map_err(transient)? {
                    let (_, value) = entry.map_err(transient)?;
                    rows.push(decode(value.value())?);
                }
                Ok(rows)
            }

            fn ci_exists(&self, ci: CiId) -> Result<bool, StoreError> {
                let table = self.txn.open_table(CIS).map_err(transient)?;
                Ok(table.get(ci.as_u128()).map_err(transient)?.is_some())
            }

            fn ci_created(&self, ci: CiId) -> Result<Option<DateTime<Utc>>, StoreError> {
                let table = self.txn.open_table(CIS).map_err(transient)?;
                let row = table.get(ci.as_u128()).map_err(transient)?;
                Ok(row.and_then(|v| from_micros(v.value())))
            }

            fn ci_ids_at(&self, at: TimeThreshold) -> Result<BTreeSet<CiId>, StoreError> {
                let table = self.txn.open_table(CIS).map_err(transient)?;
                let bound = at.bound_micros();
                let mut ids = BTreeSet::new();
                for entry in table.iter().map_err(transient)? {
                    let (key, created) = entry.map_err(transient)?;
                    if created.value() <= bound {
                        ids.insert(CiId::from_u128(key.value()));
                    }
                }
                Ok(ids)
            }

            fn layer(&self, id: &LayerId) -> Result<Option<Layer>, StoreError> {
                let table = self.txn.open_table(LAYERS).map_err(transient)?;
                let row = table.get(id.as_str()).map_err(transient)?;
                row.map(|v| decode(v.value())).transpose()
            }

            fn layers(&self) -> Result<Vec<Layer>, StoreError> {
                let table = self.txn.open_table(LAYERS).map_err(transient)?;
                let mut layers = Vec::new();
                for entry in table.iter().map_err(transient)? {
                    let (_, value) = entry.map_err(transient)?;
                    layers.push(decode(value.value())?);
                }
                Ok(layers)
            }

            fn record_counts(&self, layer: &LayerId) -> Result<RecordCounts, StoreError> {
                let attributes = self.txn.open_table(ATTRIBUTES).map_err(transient)?;
                let attribute_records = count_layer_attributes(&attributes, layer)?;
                drop(attributes);
                let relations = self.txn.open_table(RELATIONS).map_err(transient)?;
                let relation_records = count_layer_relations(&relations, layer)?;
                Ok(RecordCounts {
                    attribute_records,
                    relation_records,
                })
            }

            fn last_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
                let table = self.txn.open_table(METADATA).map_err(transient)?;
                let row = table.get(LAST_TIMESTAMP).map_err(transient)?;
                Ok(row.and_then(|v| from_micros(v.value())))
            }
        }
    };
}

// =============================================================================
// STORE
// =============================================================================

/// A disk-backed record store using redb.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a record database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(transient)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(transient)?;
            let _ = write_txn.open_table(ATTRIBUTES).map_err(transient)?;
            let _ = write_txn.open_table(RELATIONS).map_err(transient)?;
            let _ = write_txn.open_table(CHANGESETS).map_err(transient)?;
            let _ = write_txn.open_table(LEDGER).map_err(transient)?;
            let _ = write_txn.open_table(CIS).map_err(transient)?;
            let _ = write_txn.open_table(LAYERS).map_err(transient)?;
            let _ = write_txn.open_table(METADATA).map_err(transient)?;
            write_txn.commit().map_err(transient)?;
        }

        tracing::debug!(path = %path.as_ref().display(), "opened redb record store");
        Ok(Self { db })
    }

    /// Start a snapshot read transaction.
    pub fn begin_read(&self) -> Result<RedbReadTxn, StoreError> {
        let txn = self.db.begin_read().map_err(transient)?;
        Ok(RedbReadTxn { txn })
    }

    /// Start the (single) write transaction.
    pub fn begin_write(&self) -> Result<RedbWriteTxn, StoreError> {
        let txn = self.db.begin_write().map_err(transient)?;
        let next_seq = {
            let table = txn.open_table(METADATA).map_err(transient)?;
            table
                .get(NEXT_SEQ)
                .map_err(transient)?
                .map(|v| v.value())
                .unwrap_or(0)
        };
        Ok(RedbWriteTxn { txn, next_seq })
    }

    /// Compact the database file.
    pub fn compact(&mut self) -> Result<(), StoreError> {
        self.db.compact().map_err(transient)?;
        Ok(())
    }
}

/// A snapshot read transaction.
pub struct RedbReadTxn {
    txn: ReadTransaction,
}

impl_record_reader!(RedbReadTxn);

/// The write transaction. Rolled back when dropped uncommitted.
pub struct RedbWriteTxn {
    txn: WriteTransaction,
    next_seq: i64,
}

impl_record_reader!(RedbWriteTxn);

impl RedbWriteTxn {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        seq as u64
    }

    fn touch_ci(&self, ci: CiId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(CIS).map_err(transient)?;
        if table.get(ci.as_u128()).map_err(transient)?.is_none() {
            table
                .insert(ci.as_u128(), at.timestamp_micros())
                .map_err(transient)?;
        }
        Ok(())
    }

    fn write_ledger(
        &self,
        changeset: ChangesetId,
        seq: u64,
        entry: &LedgerEntry,
    ) -> Result<(), StoreError> {
        let bytes = encode(entry)?;
        let mut table = self.txn.open_table(LEDGER).map_err(transient)?;
        table
            .insert((changeset.as_u128(), seq), bytes.as_slice())
            .map_err(transient)?;
        Ok(())
    }
}

impl RecordWriter for RedbWriteTxn {
    fn reader(&self) -> &dyn RecordReader {
        self
    }

    fn append_attribute(&mut self, record: &AttributeRecord) -> Result<(), StoreError> {
        let seq = self.take_seq();
        let bytes = encode(record)?;
        {
            let mut table = self.txn.open_table(ATTRIBUTES).map_err(transient)?;
            table
                .insert(
                    (
                        record.layer.as_str(),
                        record.ci.as_u128(),
                        record.name.as_str(),
                        record.timestamp.timestamp_micros(),
                        seq,
                    ),
                    bytes.as_slice(),
                )
                .map_err(transient)?;
        }
        self.touch_ci(record.ci, record.timestamp)?;
        self.write_ledger(
            record.changeset,
            seq,
            &LedgerEntry::Attribute(record.clone()),
        )
    }

    fn append_relation(&mut self, record: &RelationRecord) -> Result<(), StoreError> {
        let seq = self.take_seq();
        let bytes = encode(record)?;
        {
            let mut table = self.txn.open_table(RELATIONS).map_err(transient)?;
            table
                .insert(
                    (
                        record.layer.as_str(),
                        record.from.as_u128(),
                        record.to.as_u128(),
                        record.predicate.as_str(),
                        record.timestamp.timestamp_micros(),
                        seq,
                    ),
                    bytes.as_slice(),
                )
                .map_err(transient)?;
        }
        self.touch_ci(record.from, record.timestamp)?;
        self.touch_ci(record.to, record.timestamp)?;
        self.write_ledger(
            record.changeset,
            seq,
            &LedgerEntry::Relation(record.clone()),
        )
    }

    fn append_changeset(&mut self, changeset: &Changeset) -> Result<(), StoreError> {
        let bytes = encode(changeset)?;
        {
            let mut table = self.txn.open_table(CHANGESETS).map_err(transient)?;
            if table.get(changeset.id.as_u128()).map_err(transient)?.is_some() {
                return Err(StoreError::InvalidState(format!(
                    "Changeset {} already exists",
                    changeset.id
                )));
            }
            table
                .insert(changeset.id.as_u128(), bytes.as_slice())
                .map_err(transient)?;
        }
        let mut meta = self.txn.open_table(METADATA).map_err(transient)?;
        let micros = changeset.timestamp.timestamp_micros();
        let previous = meta
            .get(LAST_TIMESTAMP)
            .map_err(transient)?
            .map(|v| v.value());
        if previous.is_none_or(|p| p < micros) {
            meta.insert(LAST_TIMESTAMP, micros).map_err(transient)?;
        }
        Ok(())
    }

    fn insert_ci(&mut self, ci: CiId, created: DateTime<Utc>) -> Result<(), StoreError> {
        self.touch_ci(ci, created)
    }

    fn put_layer(&mut self, layer: &Layer) -> Result<(), StoreError> {
        let bytes = encode(layer)?;
        let mut table = self.txn.open_table(LAYERS).map_err(transient)?;
        table
            .insert(layer.id.as_str(), bytes.as_slice())
            .map_err(transient)?;
        Ok(())
    }

    fn delete_layer(&mut self, id: &LayerId) -> Result<bool, StoreError> {
        let mut table = self.txn.open_table(LAYERS).map_err(transient)?;
        let removed = table.remove(id.as_str()).map_err(transient)?.is_some();
        Ok(removed)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let txn = *self;
        {
            let mut meta = txn.txn.open_table(METADATA).map_err(transient)?;
            meta.insert(NEXT_SEQ, txn.next_seq).map_err(transient)?;
        }
        txn.txn.commit().map_err(transient)
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.txn.abort().map_err(transient)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{AttributeValue, ChangeState, DataOrigin, UserId};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn layer(id: &str) -> LayerId {
        LayerId::new(id).unwrap()
    }

    fn record(ci: CiId, name: &str, value: &str, micros: i64) -> AttributeRecord {
        AttributeRecord {
            id: Uuid::new_v4(),
            ci,
            name: name.to_string(),
            layer: layer("base"),
            value: AttributeValue::text(value),
            state: ChangeState::New,
            changeset: ChangesetId(Uuid::from_u128(7)),
            timestamp: from_micros(micros).unwrap(),
            origin: DataOrigin::Manual,
        }
    }

    #[test]
    fn current_attribute_respects_threshold() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("t.redb")).unwrap();
        let ci = CiId::from_u128(1);

        let mut txn = Box::new(store.begin_write().unwrap());
        txn.append_attribute(&record(ci, "a", "v1", 1_000)).unwrap();
        txn.append_attribute(&record(ci, "a", "v2", 2_000)).unwrap();
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        let at_1500 = TimeThreshold::at(from_micros(1_500).unwrap());
        let old = read
            .current_attribute(ci, "a", &layer("base"), at_1500)
            .unwrap()
            .unwrap();
        assert_eq!(old.value, AttributeValue::text("v1"));

        let latest = read
            .current_attribute(ci, "a", &layer("base"), TimeThreshold::Latest)
            .unwrap()
            .unwrap();
        assert_eq!(latest.value, AttributeValue::text("v2"));
        assert_eq!(
            read.attribute_history(ci, "a", &layer("base")).unwrap().len(),
            2
        );
        assert!(read.ci_exists(ci).unwrap());
    }

    #[test]
    fn ci_creation_time_bounds_listing() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("t.redb")).unwrap();
        let (early, late) = (CiId::from_u128(1), CiId::from_u128(2));

        let mut txn = Box::new(store.begin_write().unwrap());
        txn.append_attribute(&record(early, "a", "v", 1_000)).unwrap();
        txn.append_attribute(&record(late, "a", "v", 2_000)).unwrap();
        txn.append_attribute(&record(early, "a", "w", 3_000)).unwrap();
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        assert_eq!(read.ci_created(early).unwrap(), from_micros(1_000));
        assert_eq!(read.ci_created(CiId::from_u128(9)).unwrap(), None);
        let at_1500 = TimeThreshold::at(from_micros(1_500).unwrap());
        assert_eq!(read.ci_ids_at(at_1500).unwrap(), BTreeSet::from([early]));
        assert_eq!(read.ci_ids_at(TimeThreshold::Latest).unwrap().len(), 2);
    }

    #[test]
    fn layer_scan_stays_inside_layer_and_selection() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("t.redb")).unwrap();
        let (a, b) = (CiId::from_u128(1), CiId::from_u128(2));

        let mut txn = Box::new(store.begin_write().unwrap());
        txn.append_attribute(&record(a, "x", "1", 10)).unwrap();
        txn.append_attribute(&record(b, "x", "2", 10)).unwrap();
        txn.append_attribute(&record(b, "y", "3", 10)).unwrap();
        let mut other = record(a, "x", "other", 10);
        other.layer = layer("basf");
        txn.append_attribute(&other).unwrap();
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        let all = read
            .current_attributes(
                &layer("base"),
                &CiSelection::All,
                &AttributeSelection::All,
                TimeThreshold::Latest,
            )
            .unwrap();
        assert_eq!(all.len(), 3);

        let only_b_x = read
            .current_attributes(
                &layer("base"),
                &CiSelection::specific([b]),
                &AttributeSelection::specific(["x".to_string()]),
                TimeThreshold::Latest,
            )
            .unwrap();
        assert_eq!(only_b_x.len(), 1);
        assert_eq!(only_b_x[0].value, AttributeValue::text("2"));

        let counts = read.record_counts(&layer("base")).unwrap();
        assert_eq!(counts.attribute_records, 3);
    }

    #[test]
    fn dropped_write_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("t.redb")).unwrap();
        let ci = CiId::from_u128(3);
        {
            let mut txn = store.begin_write().unwrap();
            txn.append_attribute(&record(ci, "a", "v", 10)).unwrap();
            txn.append_changeset(&Changeset {
                id: ChangesetId(Uuid::from_u128(7)),
                user: UserId::new("tester"),
                layer: layer("base"),
                origin: DataOrigin::Manual,
                timestamp: from_micros(10).unwrap(),
            })
            .unwrap();
        }
        let read = store.begin_read().unwrap();
        assert!(!read.ci_exists(ci).unwrap());
        assert!(read.changesets().unwrap().is_empty());
        assert_eq!(read.last_timestamp().unwrap(), None);
    }
}
