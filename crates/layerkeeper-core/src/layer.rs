//! # Layers
//!
//! A layer is a named overlay of attribute and relation data. Reads combine
//! layers through a [`LayerSet`]: an ordered list where earlier layers take
//! precedence over later ones.
//!
//! The registry of known layers lives in the store next to the ledgers.
//! Layers are created explicitly and can only be deleted while they hold
//! no records.

use crate::primitives::MAX_LAYERSET_LENGTH;
use crate::session::UnitOfWork;
use crate::storage::RecordReader;
use crate::types::{LayerId, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// =============================================================================
// LAYER
// =============================================================================

/// A registered layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub id: LayerId,
    /// Free-form display text.
    pub description: String,
    pub created: DateTime<Utc>,
}

// =============================================================================
// LAYER SET
// =============================================================================

/// An ordered, duplicate-free list of layers, most precedent first.
///
/// Immutable once built; two sets are equal iff they list the same layers
/// in the same order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<LayerId>", into = "Vec<LayerId>")]
pub struct LayerSet(Vec<LayerId>);

impl LayerSet {
    /// Build a set from layers in precedence order.
    pub fn new(layers: impl IntoIterator<Item = LayerId>) -> Result<Self, StoreError> {
        let layers: Vec<LayerId> = layers.into_iter().collect();
        if layers.len() > MAX_LAYERSET_LENGTH {
            return Err(StoreError::InvalidState(format!(
                "LayerSet exceeds {} layers",
                MAX_LAYERSET_LENGTH
            )));
        }
        let mut seen = BTreeSet::new();
        for layer in &layers {
            if !seen.insert(layer) {
                return Err(StoreError::InvalidState(format!(
                    "Layer {} listed twice in LayerSet",
                    layer
                )));
            }
        }
        Ok(Self(layers))
    }

    /// A set holding one layer.
    #[must_use]
    pub fn single(layer: LayerId) -> Self {
        Self(vec![layer])
    }

    #[must_use]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerId> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn contains(&self, layer: &LayerId) -> bool {
        self.0.contains(layer)
    }

    /// Precedence rank of `layer`, 0 being the highest.
    #[must_use]
    pub fn position(&self, layer: &LayerId) -> Option<usize> {
        self.0.iter().position(|l| l == layer)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[LayerId] {
        &self.0
    }

    /// The layers of lower precedence than `layer`.
    ///
    /// Empty when `layer` is not part of this set.
    #[must_use]
    pub fn layers_below(&self, layer: &LayerId) -> Self {
        match self.position(layer) {
            Some(pos) => Self(self.0[pos.saturating_add(1)..].to_vec()),
            None => Self::empty(),
        }
    }

    /// This set without `layer`, order otherwise preserved.
    #[must_use]
    pub fn without(&self, layer: &LayerId) -> Self {
        Self(self.0.iter().filter(|l| *l != layer).cloned().collect())
    }
}

impl TryFrom<Vec<LayerId>> for LayerSet {
    type Error = StoreError;

    fn try_from(value: Vec<LayerId>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LayerSet> for Vec<LayerId> {
    fn from(value: LayerSet) -> Self {
        value.0
    }
}

impl<'a> IntoIterator for &'a LayerSet {
    type Item = &'a LayerId;
    type IntoIter = std::slice::Iter<'a, LayerId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for LayerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.0.iter().map(LayerId::as_str).collect();
        write!(f, "[{}]", ids.join(","))
    }
}

// =============================================================================
// LAYER MODEL
// =============================================================================

/// Record and changeset counts of one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStatistics {
    pub layer: LayerId,
    pub attribute_records: u64,
    pub relation_records: u64,
    pub changesets: u64,
    pub latest_change: Option<DateTime<Utc>>,
}

/// Layer registry operations.
pub struct LayerModel;

impl LayerModel {
    /// Register a layer unless it already exists.
    ///
    /// Returns the layer and whether it was created by this call.
    pub fn create_layer_if_not_exists(
        uow: &mut UnitOfWork<'_>,
        id: &LayerId,
        description: &str,
    ) -> Result<(Layer, bool), StoreError> {
        if let Some(existing) = uow.reader().layer(id)? {
            return Ok((existing, false));
        }
        let layer = Layer {
            id: id.clone(),
            description: description.to_string(),
            created: uow.timestamp(),
        };
        uow.writer().put_layer(&layer)?;
        tracing::info!(layer = %id, "created layer");
        Ok((layer, true))
    }

    pub fn get_layer(reader: &dyn RecordReader, id: &LayerId) -> Result<Layer, StoreError> {
        reader
            .layer(id)?
            .ok_or_else(|| StoreError::NotFound(format!("Layer {}", id)))
    }

    /// Every registered layer, ordered by id.
    pub fn all_layers(reader: &dyn RecordReader) -> Result<Vec<Layer>, StoreError> {
        let mut layers = reader.layers()?;
        layers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(layers)
    }

    /// Build a LayerSet from registered layers only.
    ///
    /// Fails with NotFound naming every unknown layer.
    pub fn build_layer_set(
        reader: &dyn RecordReader,
        ids: &[LayerId],
    ) -> Result<LayerSet, StoreError> {
        let mut missing = Vec::new();
        for id in ids {
            if reader.layer(id)?.is_none() {
                missing.push(id.as_str());
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::NotFound(format!(
                "Layers {}",
                missing.join(", ")
            )));
        }
        LayerSet::new(ids.iter().cloned())
    }

    /// Delete a layer if it holds no records.
    ///
    /// Returns `false` and leaves the layer in place otherwise.
    pub fn try_delete_layer(uow: &mut UnitOfWork<'_>, id: &LayerId) -> Result<bool, StoreError> {
        Self::get_layer(uow.reader(), id)?;
        let counts = uow.reader().record_counts(id)?;
        if counts.attribute_records > 0 || counts.relation_records > 0 {
            tracing::warn!(layer = %id, "refusing to delete non-empty layer");
            return Ok(false);
        }
        let deleted = uow.writer().delete_layer(id)?;
        tracing::info!(layer = %id, "deleted layer");
        Ok(deleted)
    }

    pub fn statistics(
        reader: &dyn RecordReader,
        id: &LayerId,
    ) -> Result<LayerStatistics, StoreError> {
        Self::get_layer(reader, id)?;
        let counts = reader.record_counts(id)?;
        let changesets: Vec<_> = reader
            .changesets()?
            .into_iter()
            .filter(|c| &c.layer == id)
            .collect();
        Ok(LayerStatistics {
            layer: id.clone(),
            attribute_records: counts.attribute_records,
            relation_records: counts.relation_records,
            changesets: changesets.len() as u64,
            latest_change: changesets.iter().map(|c| c.timestamp).max(),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::types::UserId;

    fn l(id: &str) -> LayerId {
        LayerId::new(id).unwrap()
    }

    #[test]
    fn layer_set_rejects_duplicates() {
        assert!(LayerSet::new([l("a"), l("b"), l("a")]).is_err());
        let set = LayerSet::new([l("a"), l("b"), l("c")]).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.to_string(), "[a,b,c]");
    }

    #[test]
    fn layers_below_and_without() {
        let set = LayerSet::new([l("a"), l("b"), l("c")]).unwrap();
        assert_eq!(set.layers_below(&l("a")), LayerSet::new([l("b"), l("c")]).unwrap());
        assert!(set.layers_below(&l("c")).is_empty());
        assert!(set.layers_below(&l("z")).is_empty());
        assert_eq!(set.without(&l("b")), LayerSet::new([l("a"), l("c")]).unwrap());
    }

    #[test]
    fn layer_set_deserialization_validates() {
        let ok: Result<LayerSet, _> = serde_json::from_str(r#"["a","b"]"#);
        assert!(ok.is_ok());
        let dup: Result<LayerSet, _> = serde_json::from_str(r#"["a","a"]"#);
        assert!(dup.is_err());
    }

    #[test]
    fn build_layer_set_names_every_missing_layer() {
        let mut session = Session::new();
        let mut uow = session.begin(UserId::new("tester")).unwrap();
        LayerModel::create_layer_if_not_exists(&mut uow, &l("known"), "").unwrap();
        let err =
            LayerModel::build_layer_set(uow.reader(), &[l("known"), l("x"), l("y")]).unwrap_err();
        assert_eq!(err, StoreError::NotFound("Layers x, y".to_string()));
        uow.commit().unwrap();
    }

    #[test]
    fn create_is_idempotent() {
        let mut session = Session::new();
        let mut uow = session.begin(UserId::new("tester")).unwrap();
        let (_, created) =
            LayerModel::create_layer_if_not_exists(&mut uow, &l("base"), "Base data").unwrap();
        assert!(created);
        let (layer, created) =
            LayerModel::create_layer_if_not_exists(&mut uow, &l("base"), "ignored").unwrap();
        assert!(!created);
        assert_eq!(layer.description, "Base data");
        uow.commit().unwrap();

        let view = session.read().unwrap();
        assert_eq!(LayerModel::all_layers(view.reader()).unwrap().len(), 1);
        assert!(matches!(
            LayerModel::get_layer(view.reader(), &l("other")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn empty_layer_can_be_deleted() {
        let mut session = Session::new();
        let mut uow = session.begin(UserId::new("tester")).unwrap();
        LayerModel::create_layer_if_not_exists(&mut uow, &l("tmp"), "").unwrap();
        assert!(LayerModel::try_delete_layer(&mut uow, &l("tmp")).unwrap());
        assert!(LayerModel::get_layer(uow.reader(), &l("tmp")).is_err());
        uow.commit().unwrap();
    }
}
