//! # Storage Backends
//!
//! The seam between the models and the backing transactional store.
//!
//! A backend exposes point-in-time indexed reads of the three append-only
//! ledgers through [`RecordReader`] and appends through [`RecordWriter`].
//! Two implementations exist:
//! - [`MemoryStore`]: volatile; a write transaction stages a copy of the state
//! - [`RedbStore`]: redb file database with ACID transactions and MVCC reads
//!
//! Readers must return, per key, the record with the greatest timestamp not
//! after the threshold (ties broken by append order), whatever its state.

pub mod memory;
pub mod redb_store;

pub use memory::{MemoryState, MemoryStore, MemoryWriteTxn};
pub use redb_store::{RedbReadTxn, RedbStore, RedbWriteTxn};

use crate::layer::Layer;
use crate::selection::{AttributeSelection, CiSelection, RelationSelection};
use crate::types::{
    AttributeRecord, Changeset, ChangesetId, CiId, LayerId, LedgerEntry, RelationKey,
    RelationRecord, StoreError, TimeThreshold,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Number of history rows a layer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordCounts {
    pub attribute_records: u64,
    pub relation_records: u64,
}

/// Read access to the ledgers within one transaction.
pub trait RecordReader {
    /// Current record of one attribute key at `at`, whatever its state.
    fn current_attribute(
        &self,
        ci: CiId,
        name: &str,
        layer: &LayerId,
        at: TimeThreshold,
    ) -> Result<Option<AttributeRecord>, StoreError>;

    /// Current records of one layer, restricted by CI and name.
    fn current_attributes(
        &self,
        layer: &LayerId,
        cis: &CiSelection,
        names: &AttributeSelection,
        at: TimeThreshold,
    ) -> Result<Vec<AttributeRecord>, StoreError>;

    /// Full history of one attribute key, oldest first.
    fn attribute_history(
        &self,
        ci: CiId,
        name: &str,
        layer: &LayerId,
    ) -> Result<Vec<AttributeRecord>, StoreError>;

    /// Current record of one relation key in one layer.
    fn current_relation(
        &self,
        key: &RelationKey,
        layer: &LayerId,
        at: TimeThreshold,
    ) -> Result<Option<RelationRecord>, StoreError>;

    /// Current records of one layer matching `selection`.
    fn current_relations(
        &self,
        layer: &LayerId,
        selection: &RelationSelection,
        at: TimeThreshold,
    ) -> Result<Vec<RelationRecord>, StoreError>;

    /// Full history of one relation key, oldest first.
    fn relation_history(
        &self,
        key: &RelationKey,
        layer: &LayerId,
    ) -> Result<Vec<RelationRecord>, StoreError>;

    fn changeset(&self, id: ChangesetId) -> Result<Option<Changeset>, StoreError>;

    /// Every changeset, in no particular order.
    fn changesets(&self) -> Result<Vec<Changeset>, StoreError>;

    /// Rows written by one changeset, in write order.
    fn changeset_entries(&self, id: ChangesetId) -> Result<Vec<LedgerEntry>, StoreError>;

    fn ci_exists(&self, ci: CiId) -> Result<bool, StoreError>;

    /// When the CI came into existence, if it exists.
    fn ci_created(&self, ci: CiId) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// CIs that existed at `at`.
    fn ci_ids_at(&self, at: TimeThreshold) -> Result<BTreeSet<CiId>, StoreError>;

    fn layer(&self, id: &LayerId) -> Result<Option<Layer>, StoreError>;

    fn layers(&self) -> Result<Vec<Layer>, StoreError>;

    fn record_counts(&self, layer: &LayerId) -> Result<RecordCounts, StoreError>;

    /// Timestamp of the newest changeset ever written.
    fn last_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Append access within one write transaction.
///
/// Dropping a writer without calling [`RecordWriter::commit`] discards
/// every staged row.
pub trait RecordWriter {
    /// Reads through this transaction, including its own uncommitted rows.
    fn reader(&self) -> &dyn RecordReader;

    /// Append an attribute row. Registers the CI if it is not yet known.
    fn append_attribute(&mut self, record: &AttributeRecord) -> Result<(), StoreError>;

    /// Append a relation row. Registers both CIs if they are not yet known.
    fn append_relation(&mut self, record: &RelationRecord) -> Result<(), StoreError>;

    fn append_changeset(&mut self, changeset: &Changeset) -> Result<(), StoreError>;

    /// Register a CI. Registering an existing CI is a no-op.
    fn insert_ci(&mut self, ci: CiId, created: DateTime<Utc>) -> Result<(), StoreError>;

    fn put_layer(&mut self, layer: &Layer) -> Result<(), StoreError>;

    /// Returns whether the layer existed.
    fn delete_layer(&mut self, id: &LayerId) -> Result<bool, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
