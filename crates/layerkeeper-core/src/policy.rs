//! # Write Policies
//!
//! Writes into one layer of a larger read set.
//!
//! - [`OtherLayersValueHandling`] decides whether an insert that the other
//!   layers already provide is written at all.
//! - [`MaskHandlingForRemoval`] decides whether a removal that would let a
//!   lower layer's value shine through writes a mask instead.
//!
//! Bulk replaces apply both per key through a [`BulkWritePolicy`].

use crate::attribute::AttributeModel;
use crate::layer::LayerSet;
use crate::merge::MergeEngine;
use crate::relation::RelationModel;
use crate::session::UnitOfWork;
use crate::types::{
    AttributeKey, AttributeRecord, AttributeValue, CiId, LayerId, RelationKey, RelationRecord,
    StoreError, TimeThreshold,
};
use serde::{Deserialize, Serialize};

/// Handling of values already provided by other layers of the read set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtherLayersValueHandling {
    /// Always write.
    #[default]
    ForceWrite,
    /// Skip the write if the other layers already merge to the same value
    /// and the write layer holds nothing that would override it.
    TakeIntoAccount,
}

/// Handling of removals that would expose a lower layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskHandlingForRemoval {
    /// Write a mask when a lower layer of the read set holds a live value.
    ApplyMaskIfNecessary,
    /// Always write a plain removal.
    #[default]
    ApplyNoMask,
}

/// Read set and policies a bulk replace writes under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWritePolicy {
    /// Must contain the write layer.
    pub read_layers: LayerSet,
    pub other_layers: OtherLayersValueHandling,
    pub masks: MaskHandlingForRemoval,
}

impl BulkWritePolicy {
    /// `ForceWrite` and `ApplyNoMask` over the write layer alone.
    #[must_use]
    pub fn plain(write_layer: &LayerId) -> Self {
        Self {
            read_layers: LayerSet::single(write_layer.clone()),
            other_layers: OtherLayersValueHandling::ForceWrite,
            masks: MaskHandlingForRemoval::ApplyNoMask,
        }
    }

    pub(crate) fn check_write_layer(&self, write_layer: &LayerId) -> Result<(), StoreError> {
        if self.read_layers.contains(write_layer) {
            Ok(())
        } else {
            Err(StoreError::InvalidState(format!(
                "Write layer {} is not part of read layers {}",
                write_layer, self.read_layers
            )))
        }
    }
}

/// Result of a policy-aware write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome<R> {
    /// A record was written.
    Written(R),
    /// The store already held the desired state; carries the current record.
    Unchanged(R),
    /// The write was skipped because other layers provide the value.
    Skipped,
}

impl<R> PolicyOutcome<R> {
    #[must_use]
    pub const fn changed(&self) -> bool {
        matches!(self, Self::Written(_))
    }

    #[must_use]
    pub fn record(&self) -> Option<&R> {
        match self {
            Self::Written(r) | Self::Unchanged(r) => Some(r),
            Self::Skipped => None,
        }
    }
}

fn outcome<R>((record, changed): (R, bool)) -> PolicyOutcome<R> {
    if changed {
        PolicyOutcome::Written(record)
    } else {
        PolicyOutcome::Unchanged(record)
    }
}

/// Policy-aware writes of attributes and relations.
pub struct LayeredWriter;

impl LayeredWriter {
    pub fn insert_attribute(
        uow: &mut UnitOfWork<'_>,
        ci: CiId,
        name: &str,
        value: AttributeValue,
        write_layer: &LayerId,
        read_layers: &LayerSet,
        handling: OtherLayersValueHandling,
    ) -> Result<PolicyOutcome<AttributeRecord>, StoreError> {
        if handling == OtherLayersValueHandling::TakeIntoAccount {
            let own = AttributeModel::get_attribute(
                uow.reader(),
                &AttributeKey::new(ci, name, write_layer.clone()),
                TimeThreshold::Latest,
            )?;
            if own.is_none() {
                let others = MergeEngine::get_merged_attribute(
                    uow.reader(),
                    ci,
                    name,
                    &read_layers.without(write_layer),
                    TimeThreshold::Latest,
                )?;
                if others.is_some_and(|m| m.value() == &value) {
                    tracing::debug!(
                        ci = %ci,
                        name,
                        layer = %write_layer,
                        "value provided by other layers"
                    );
                    return Ok(PolicyOutcome::Skipped);
                }
            }
        }
        AttributeModel::insert_attribute(uow, ci, name, value, write_layer).map(outcome)
    }

    /// Remove (ci, name) from `write_layer`, masking lower layers if asked.
    ///
    /// With [`MaskHandlingForRemoval::ApplyMaskIfNecessary`] a mask is written
    /// even when the write layer holds no record, so the removal is visible
    /// in every merge including the write layer.
    pub fn remove_attribute(
        uow: &mut UnitOfWork<'_>,
        ci: CiId,
        name: &str,
        write_layer: &LayerId,
        read_layers: &LayerSet,
        handling: MaskHandlingForRemoval,
    ) -> Result<PolicyOutcome<AttributeRecord>, StoreError> {
        if handling == MaskHandlingForRemoval::ApplyMaskIfNecessary {
            let below = MergeEngine::get_merged_attribute(
                uow.reader(),
                ci,
                name,
                &read_layers.layers_below(write_layer),
                TimeThreshold::Latest,
            )?;
            if below.is_some() {
                return AttributeModel::insert_mask(uow, ci, name, write_layer).map(outcome);
            }
        }
        AttributeModel::remove_attribute(uow, ci, name, write_layer).map(outcome)
    }

    pub fn insert_relation(
        uow: &mut UnitOfWork<'_>,
        key: &RelationKey,
        write_layer: &LayerId,
        read_layers: &LayerSet,
        handling: OtherLayersValueHandling,
    ) -> Result<PolicyOutcome<RelationRecord>, StoreError> {
        if handling == OtherLayersValueHandling::TakeIntoAccount {
            let own = RelationModel::get_relation(
                uow.reader(),
                key,
                write_layer,
                TimeThreshold::Latest,
            )?;
            if own.is_none() {
                let others = MergeEngine::get_merged_relation(
                    uow.reader(),
                    key,
                    &read_layers.without(write_layer),
                    TimeThreshold::Latest,
                )?;
                if others.is_some() {
                    return Ok(PolicyOutcome::Skipped);
                }
            }
        }
        RelationModel::insert_relation(uow, key, write_layer).map(outcome)
    }

    pub fn remove_relation(
        uow: &mut UnitOfWork<'_>,
        key: &RelationKey,
        write_layer: &LayerId,
        read_layers: &LayerSet,
        handling: MaskHandlingForRemoval,
    ) -> Result<PolicyOutcome<RelationRecord>, StoreError> {
        if handling == MaskHandlingForRemoval::ApplyMaskIfNecessary {
            let below = MergeEngine::get_merged_relation(
                uow.reader(),
                key,
                &read_layers.layers_below(write_layer),
                TimeThreshold::Latest,
            )?;
            if below.is_some() {
                return RelationModel::insert_relation_mask(uow, key, write_layer).map(outcome);
            }
        }
        RelationModel::remove_relation(uow, key, write_layer).map(outcome)
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
    use crate::types::{PredicateId, UserId};

    fn l(id: &str) -> LayerId {
        LayerId::new(id).unwrap()
    }

    #[test]
    fn mask_keeps_lower_layer_visible_alone() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let (w, r) = (l("w"), l("r"));
        let both = LayerSet::new([w.clone(), r.clone()]).unwrap();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        AttributeModel::insert_attribute(&mut uow, ci, "k", AttributeValue::text("lower"), &r)
            .unwrap();
        AttributeModel::insert_attribute(&mut uow, ci, "k", AttributeValue::text("upper"), &w)
            .unwrap();

        let removed = LayeredWriter::remove_attribute(
            &mut uow,
            ci,
            "k",
            &w,
            &both,
            MaskHandlingForRemoval::ApplyMaskIfNecessary,
        )
        .unwrap();
        assert!(removed.changed());
        assert!(removed.record().unwrap().is_mask());

        let merged =
            MergeEngine::get_merged_attribute(uow.reader(), ci, "k", &both, TimeThreshold::Latest)
                .unwrap();
        assert!(merged.is_none());
        let lower = MergeEngine::get_merged_attribute(
            uow.reader(),
            ci,
            "k",
            &LayerSet::single(r),
            TimeThreshold::Latest,
        )
        .unwrap()
        .unwrap();
        assert_eq!(lower.value(), &AttributeValue::text("lower"));
    }

    #[test]
    fn no_mask_lets_lower_value_through() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let (w, r) = (l("w"), l("r"));
        let both = LayerSet::new([w.clone(), r.clone()]).unwrap();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        AttributeModel::insert_attribute(&mut uow, ci, "k", AttributeValue::text("lower"), &r)
            .unwrap();
        AttributeModel::insert_attribute(&mut uow, ci, "k", AttributeValue::text("upper"), &w)
            .unwrap();
        LayeredWriter::remove_attribute(
            &mut uow,
            ci,
            "k",
            &w,
            &both,
            MaskHandlingForRemoval::ApplyNoMask,
        )
        .unwrap();
        let merged =
            MergeEngine::get_merged_attribute(uow.reader(), ci, "k", &both, TimeThreshold::Latest)
                .unwrap()
                .unwrap();
        assert_eq!(merged.value(), &AttributeValue::text("lower"));
    }

    #[test]
    fn take_into_account_skips_redundant_write() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let (w, r) = (l("w"), l("r"));
        let both = LayerSet::new([w.clone(), r.clone()]).unwrap();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        AttributeModel::insert_attribute(&mut uow, ci, "k", AttributeValue::text("same"), &r)
            .unwrap();

        let skipped = LayeredWriter::insert_attribute(
            &mut uow,
            ci,
            "k",
            AttributeValue::text("same"),
            &w,
            &both,
            OtherLayersValueHandling::TakeIntoAccount,
        )
        .unwrap();
        assert_eq!(skipped, PolicyOutcome::Skipped);

        let forced = LayeredWriter::insert_attribute(
            &mut uow,
            ci,
            "k",
            AttributeValue::text("same"),
            &w,
            &both,
            OtherLayersValueHandling::ForceWrite,
        )
        .unwrap();
        assert!(forced.changed());
    }

    #[test]
    fn relation_removal_masks_lower_layer() {
        let mut session = Session::new();
        let key = RelationKey::new(
            CiId::new_random(),
            CiId::new_random(),
            PredicateId::new("has_member").unwrap(),
        );
        let (w, r) = (l("w"), l("r"));
        let both = LayerSet::new([w.clone(), r.clone()]).unwrap();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        RelationModel::insert_relation(&mut uow, &key, &r).unwrap();

        let removed = LayeredWriter::remove_relation(
            &mut uow,
            &key,
            &w,
            &both,
            MaskHandlingForRemoval::ApplyMaskIfNecessary,
        )
        .unwrap();
        assert!(removed.record().unwrap().is_mask());
        assert!(
            MergeEngine::get_merged_relation(uow.reader(), &key, &both, TimeThreshold::Latest)
                .unwrap()
                .is_none()
        );
    }
}
