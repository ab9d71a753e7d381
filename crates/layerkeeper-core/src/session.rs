//! # Session Module
//!
//! Session management over a record store.
//!
//! A [`Session`] owns the storage backend and hands out two kinds of access:
//! - [`ReadView`]: a consistent snapshot for read-only requests
//! - [`UnitOfWork`]: the single write transaction of one logical operation
//!
//! ## Storage Backends
//!
//! Session supports two storage backends:
//! - `InMemory`: Uses [`MemoryStore`] (fast, volatile)
//! - `Persistent`: Uses [`RedbStore`] for disk-backed ACID storage
//!
//! ## Unit of Work
//!
//! A unit of work carries the user, data origin and timestamp of its writes,
//! plus the per-request caches (changesets per layer, active traits). Its
//! timestamp is strictly greater than every changeset already stored, so
//! history stays totally ordered by time. Dropping a unit of work without
//! committing rolls it back.

use crate::changeset::{ChangesetCache, ChangesetModel};
use crate::layer::LayerSet;
use crate::storage::{
    MemoryState, MemoryStore, RecordReader, RecordWriter, RedbReadTxn, RedbStore,
};
use crate::trait_store::{ActiveTraits, TraitCache, TraitsProvider};
use crate::types::{Changeset, DataOrigin, LayerId, StoreError, TimeThreshold, UserId};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::path::Path;
use std::sync::Arc;

/// Storage backend for a Session.
#[derive(Debug)]
pub enum StorageBackend {
    /// In-memory store (fast, volatile).
    InMemory(MemoryStore),
    /// Disk-backed store using redb (ACID, persistent).
    Persistent(RedbStore),
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::InMemory(MemoryStore::new())
    }
}

/// Entry point to a record store.
#[derive(Debug, Default)]
pub struct Session {
    backend: StorageBackend,
}

impl Session {
    /// Create a new empty session with in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with persistent redb storage.
    ///
    /// Opens or creates a redb database at the given path.
    pub fn with_redb(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = RedbStore::open(path)?;
        Ok(Self::with_redb_store(store))
    }

    /// Create a session with an existing RedbStore.
    #[must_use]
    pub fn with_redb_store(store: RedbStore) -> Self {
        Self {
            backend: StorageBackend::Persistent(store),
        }
    }

    /// Check if using persistent storage.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, StorageBackend::Persistent(_))
    }

    /// Open a read snapshot.
    pub fn read(&self) -> Result<ReadView<'_>, StoreError> {
        let source = match &self.backend {
            StorageBackend::InMemory(store) => ReadSource::Memory(store.state()),
            StorageBackend::Persistent(store) => ReadSource::Persistent(store.begin_read()?),
        };
        Ok(ReadView { source })
    }

    /// Start the unit of work of `user`.
    pub fn begin(&mut self, user: UserId) -> Result<UnitOfWork<'_>, StoreError> {
        let writer: Box<dyn RecordWriter + '_> = match &mut self.backend {
            StorageBackend::InMemory(store) => Box::new(store.begin_write()),
            StorageBackend::Persistent(store) => Box::new(store.begin_write()?),
        };
        let timestamp = next_timestamp(writer.reader().last_timestamp()?);
        tracing::debug!(user = %user, %timestamp, "begin unit of work");
        Ok(UnitOfWork {
            writer,
            user,
            origin: DataOrigin::default(),
            timestamp,
            changesets: ChangesetCache::default(),
            traits: TraitCache::default(),
        })
    }

    /// Compact the persistent store. No-op for in-memory sessions.
    pub fn compact(&mut self) -> Result<(), StoreError> {
        match &mut self.backend {
            StorageBackend::InMemory(_) => Ok(()),
            StorageBackend::Persistent(store) => store.compact(),
        }
    }
}

/// Current time at storage resolution, strictly after `last`.
fn next_timestamp(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6);
    match last {
        Some(last) if last >= now => last + Duration::microseconds(1),
        _ => now,
    }
}

// =============================================================================
// READ VIEW
// =============================================================================

enum ReadSource<'a> {
    Memory(&'a MemoryState),
    Persistent(RedbReadTxn),
}

/// A read-only snapshot of the store.
pub struct ReadView<'a> {
    source: ReadSource<'a>,
}

impl ReadView<'_> {
    pub fn reader(&self) -> &dyn RecordReader {
        match &self.source {
            ReadSource::Memory(state) => *state,
            ReadSource::Persistent(txn) => txn,
        }
    }

    /// Active traits of the meta layers, computed without caching.
    pub fn active_traits(&self, meta: &LayerSet) -> Result<ActiveTraits, StoreError> {
        TraitsProvider::active_traits(self.reader(), meta, TimeThreshold::Latest)
    }
}

// =============================================================================
// UNIT OF WORK
// =============================================================================

/// One write transaction plus its request-scoped caches.
pub struct UnitOfWork<'a> {
    writer: Box<dyn RecordWriter + 'a>,
    user: UserId,
    origin: DataOrigin,
    timestamp: DateTime<Utc>,
    pub(crate) changesets: ChangesetCache,
    traits: TraitCache,
}

impl std::fmt::Debug for UnitOfWork<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("user", &self.user)
            .field("origin", &self.origin)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

impl<'a> UnitOfWork<'a> {
    /// Reads through this transaction, own writes included.
    pub fn reader(&self) -> &dyn RecordReader {
        self.writer.reader()
    }

    pub(crate) fn writer(&mut self) -> &mut dyn RecordWriter {
        &mut *self.writer
    }

    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    #[must_use]
    pub fn origin(&self) -> DataOrigin {
        self.origin
    }

    /// Origin stamped on changesets created from now on.
    pub fn set_origin(&mut self, origin: DataOrigin) {
        self.origin = origin;
    }

    /// The timestamp shared by every record written by this unit of work.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The changeset of `layer` in this unit of work, created on first use.
    pub fn changeset(&mut self, layer: &LayerId) -> Result<Changeset, StoreError> {
        ChangesetModel::get_or_create_changeset(self, layer)
    }

    /// Changesets created so far, ordered by layer.
    pub fn created_changesets(&self) -> Vec<Changeset> {
        self.changesets.iter().cloned().collect()
    }

    /// Flattened traits of the meta layers, cached until a meta layer is written.
    pub fn active_traits(&mut self, meta: &LayerSet) -> Result<Arc<ActiveTraits>, StoreError> {
        if let Some(cached) = self.traits.get(meta) {
            return Ok(cached);
        }
        let active = Arc::new(TraitsProvider::active_traits(
            self.writer.reader(),
            meta,
            TimeThreshold::Latest,
        )?);
        self.traits.insert(meta.clone(), Arc::clone(&active));
        Ok(active)
    }

    /// Drop cached data derived from `layer`.
    pub(crate) fn note_write(&mut self, layer: &LayerId) {
        self.traits.invalidate_layer(layer);
    }

    pub fn commit(self) -> Result<(), StoreError> {
        let changesets = self.changesets.len();
        self.writer.commit()?;
        tracing::debug!(user = %self.user, changesets, "committed unit of work");
        Ok(())
    }

    pub fn rollback(self) -> Result<(), StoreError> {
        tracing::debug!(user = %self.user, "rolled back unit of work");
        self.writer.rollback()
    }
}

// =============================================================================
// TESTS
// =============================================================================
