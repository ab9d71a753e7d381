//! # Changeset Ledger
//!
//! Every record is written under a changeset: the audit grouping of all
//! writes of one unit of work to one layer. A unit of work creates at most
//! one changeset per layer and only when a record is actually written, so a
//! no-op write never leaves an empty changeset behind.

use crate::layer::LayerSet;
use crate::selection::CiSelection;
use crate::session::UnitOfWork;
use crate::storage::RecordReader;
use crate::types::{
    AttributeRecord, Changeset, ChangesetId, LayerId, LedgerEntry, RelationRecord, StoreError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Changesets created by one unit of work, keyed by layer.
#[derive(Debug, Default)]
pub struct ChangesetCache {
    by_layer: BTreeMap<LayerId, Changeset>,
}

impl ChangesetCache {
    #[must_use]
    pub fn get(&self, layer: &LayerId) -> Option<&Changeset> {
        self.by_layer.get(layer)
    }

    fn insert(&mut self, changeset: Changeset) {
        self.by_layer.insert(changeset.layer.clone(), changeset);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_layer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_layer.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Changeset> {
        self.by_layer.values()
    }
}

/// The records written under one changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetData {
    pub changeset: Changeset,
    pub attributes: Vec<AttributeRecord>,
    pub relations: Vec<RelationRecord>,
}

/// Changeset ledger operations.
pub struct ChangesetModel;

impl ChangesetModel {
    /// The changeset of `layer` for this unit of work.
    ///
    /// The first call persists a new changeset stamped with the unit of
    /// work's user, origin and timestamp; later calls return the same one.
    pub fn get_or_create_changeset(
        uow: &mut UnitOfWork<'_>,
        layer: &LayerId,
    ) -> Result<Changeset, StoreError> {
        if let Some(cached) = uow.changesets.get(layer) {
            return Ok(cached.clone());
        }
        let changeset = Changeset {
            id: ChangesetId::new_random(),
            user: uow.user().clone(),
            layer: layer.clone(),
            origin: uow.origin(),
            timestamp: uow.timestamp(),
        };
        uow.writer().append_changeset(&changeset)?;
        tracing::info!(
            changeset = %changeset.id,
            layer = %layer,
            user = %changeset.user,
            "created changeset"
        );
        uow.changesets.insert(changeset.clone());
        Ok(changeset)
    }

    pub fn get_changeset(
        reader: &dyn RecordReader,
        id: ChangesetId,
    ) -> Result<Changeset, StoreError> {
        reader
            .changeset(id)?
            .ok_or_else(|| StoreError::NotFound(format!("Changeset {}", id)))
    }

    /// Changesets in `[from, to]` written to one of `layers`, newest first.
    ///
    /// With a CI filter other than `All`, only changesets that wrote a
    /// record touching a selected CI are returned.
    pub fn changesets_in_timespan(
        reader: &dyn RecordReader,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        layers: &LayerSet,
        cis: &CiSelection,
        limit: Option<usize>,
    ) -> Result<Vec<Changeset>, StoreError> {
        let mut found: Vec<Changeset> = reader
            .changesets()?
            .into_iter()
            .filter(|c| c.timestamp >= from && c.timestamp <= to && layers.contains(&c.layer))
            .collect();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));

        let mut result = Vec::new();
        for changeset in found {
            if limit.is_some_and(|max| result.len() >= max) {
                break;
            }
            if !cis.is_all() && !Self::touches(reader, changeset.id, cis)? {
                continue;
            }
            result.push(changeset);
        }
        Ok(result)
    }

    fn touches(
        reader: &dyn RecordReader,
        id: ChangesetId,
        cis: &CiSelection,
    ) -> Result<bool, StoreError> {
        Ok(reader
            .changeset_entries(id)?
            .iter()
            .any(|entry| match entry {
                LedgerEntry::Attribute(a) => cis.contains(&a.ci),
                LedgerEntry::Relation(r) => cis.contains(&r.from) || cis.contains(&r.to),
            }))
    }

    /// Everything written under a changeset, in write order.
    pub fn changeset_data(
        reader: &dyn RecordReader,
        id: ChangesetId,
    ) -> Result<ChangesetData, StoreError> {
        let changeset = Self::get_changeset(reader, id)?;
        let mut attributes = Vec::new();
        let mut relations = Vec::new();
        for entry in reader.changeset_entries(id)? {
            match entry {
                LedgerEntry::Attribute(a) => attributes.push(a),
                LedgerEntry::Relation(r) => relations.push(r),
            }
        }
        Ok(ChangesetData {
            changeset,
            attributes,
            relations,
        })
    }

    pub fn latest_changeset_for_layer(
        reader: &dyn RecordReader,
        layer: &LayerId,
    ) -> Result<Option<Changeset>, StoreError> {
        Ok(reader
            .changesets()?
            .into_iter()
            .filter(|c| &c.layer == layer)
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id))))
    }
}

// =============================================================================
// TESTS
// =============================================================================
