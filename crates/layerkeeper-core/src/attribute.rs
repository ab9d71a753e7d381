//! # Versioned Attribute Store
//!
//! Append-only attribute history per (CI, name, layer).
//!
//! ## State Machine
//!
//! | current record        | operation         | result                         |
//! |-----------------------|-------------------|--------------------------------|
//! | none                  | insert            | `New`                          |
//! | live, same value      | insert            | no-op, unchanged               |
//! | live, other value     | insert            | `Changed`                      |
//! | `Removed`             | insert            | `Renewed`                      |
//! | none                  | remove            | `NotFound`                     |
//! | live                  | remove            | `Removed`, carrying old value  |
//! | `Removed`             | remove            | no-op, returns the tombstone   |
//!
//! Masks are ordinary rows whose value is [`AttributeValue::Mask`]; they go
//! through the same state machine.

use crate::policy::{BulkWritePolicy, LayeredWriter, PolicyOutcome};
use crate::primitives::{MAX_ATTRIBUTE_NAME_LENGTH, MAX_BULK_FRAGMENTS, MAX_VALUE_LENGTH};
use crate::selection::{AttributeSelection, CiSelection};
use crate::session::UnitOfWork;
use crate::storage::RecordReader;
use crate::types::{
    AttributeKey, AttributeRecord, AttributeValue, ChangeState, CiId, LayerId, StoreError,
    TimeThreshold,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

// =============================================================================
// BULK TYPES
// =============================================================================

/// The region of a layer a bulk replace takes ownership of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeBulkScope {
    /// Every attribute of the layer whose name starts with the prefix.
    LayerNamePrefix(String),
    /// Attributes of one CI whose name starts with the prefix.
    CiNamePrefix { ci: CiId, prefix: String },
    /// Exactly these (CI, name) pairs.
    Specific(BTreeSet<(CiId, String)>),
}

impl AttributeBulkScope {
    #[must_use]
    pub fn contains(&self, ci: CiId, name: &str) -> bool {
        match self {
            Self::LayerNamePrefix(prefix) => name.starts_with(prefix.as_str()),
            Self::CiNamePrefix { ci: owner, prefix } => {
                *owner == ci && name.starts_with(prefix.as_str())
            }
            Self::Specific(keys) => keys.contains(&(ci, name.to_string())),
        }
    }

    fn cis(&self) -> CiSelection {
        match self {
            Self::LayerNamePrefix(_) => CiSelection::All,
            Self::CiNamePrefix { ci, .. } => CiSelection::specific([*ci]),
            Self::Specific(keys) => CiSelection::specific(keys.iter().map(|(ci, _)| *ci)),
        }
    }

    fn names(&self) -> AttributeSelection {
        match self {
            Self::Specific(keys) => {
                AttributeSelection::specific(keys.iter().map(|(_, name)| name.clone()))
            }
            _ => AttributeSelection::All,
        }
    }
}

/// One desired attribute of a bulk replace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeFragment {
    pub ci: CiId,
    pub name: String,
    pub value: AttributeValue,
}

/// What a bulk replace wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BulkOutcome {
    /// New, changed or renewed rows.
    pub written: usize,
    /// Tombstones for rows absent from the fragments.
    pub removed: usize,
    /// Fragments equal to the current value, and masks kept as they are.
    pub unchanged: usize,
    /// Fragments other layers already provide.
    pub skipped: usize,
}

impl BulkOutcome {
    pub(crate) fn count_write<R>(&mut self, outcome: &PolicyOutcome<R>) {
        match outcome {
            PolicyOutcome::Written(_) => self.written += 1,
            PolicyOutcome::Unchanged(_) => self.unchanged += 1,
            PolicyOutcome::Skipped => self.skipped += 1,
        }
    }

    pub(crate) fn count_removal<R>(&mut self, outcome: &PolicyOutcome<R>) {
        match outcome {
            PolicyOutcome::Written(_) => self.removed += 1,
            PolicyOutcome::Unchanged(_) | PolicyOutcome::Skipped => self.unchanged += 1,
        }
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.len() > MAX_ATTRIBUTE_NAME_LENGTH {
        return Err(StoreError::InvalidId {
            kind: "attribute name",
            id: name.to_string(),
        });
    }
    Ok(())
}

fn validate_value(value: &AttributeValue) -> Result<(), StoreError> {
    if value.payload_len() > MAX_VALUE_LENGTH {
        return Err(StoreError::InvalidState(format!(
            "Attribute value exceeds {} bytes",
            MAX_VALUE_LENGTH
        )));
    }
    Ok(())
}

// =============================================================================
// ATTRIBUTE MODEL
// =============================================================================

/// Reads and writes of the attribute history.
pub struct AttributeModel;

impl AttributeModel {
    /// The current non-removed record of `key` (live value or mask).
    pub fn get_attribute(
        reader: &dyn RecordReader,
        key: &AttributeKey,
        at: TimeThreshold,
    ) -> Result<Option<AttributeRecord>, StoreError> {
        Ok(reader
            .current_attribute(key.ci, &key.name, &key.layer, at)?
            .filter(|r| !r.state.is_removed()))
    }

    /// Current non-removed records of one layer.
    pub fn attributes_of_layer(
        reader: &dyn RecordReader,
        layer: &LayerId,
        cis: &CiSelection,
        names: &AttributeSelection,
        at: TimeThreshold,
    ) -> Result<Vec<AttributeRecord>, StoreError> {
        let mut records = reader.current_attributes(layer, cis, names, at)?;
        records.retain(|r| !r.state.is_removed());
        Ok(records)
    }

    /// Every record ever written for (ci, name) in `layer`, oldest first.
    pub fn attribute_history(
        reader: &dyn RecordReader,
        ci: CiId,
        name: &str,
        layer: &LayerId,
    ) -> Result<Vec<AttributeRecord>, StoreError> {
        reader.attribute_history(ci, name, layer)
    }

    /// Write `value` unless it equals the current live value.
    ///
    /// Returns the current record and whether a new one was written.
    pub fn insert_attribute(
        uow: &mut UnitOfWork<'_>,
        ci: CiId,
        name: &str,
        value: AttributeValue,
        layer: &LayerId,
    ) -> Result<(AttributeRecord, bool), StoreError> {
        if value.is_mask() {
            return Err(StoreError::InvalidState(
                "Masks are written through insert_mask".to_string(),
            ));
        }
        Self::insert_value(uow, ci, name, value, layer)
    }

    /// Write a mask hiding lower layers' values of (ci, name).
    pub fn insert_mask(
        uow: &mut UnitOfWork<'_>,
        ci: CiId,
        name: &str,
        layer: &LayerId,
    ) -> Result<(AttributeRecord, bool), StoreError> {
        Self::insert_value(uow, ci, name, AttributeValue::Mask, layer)
    }

    fn insert_value(
        uow: &mut UnitOfWork<'_>,
        ci: CiId,
        name: &str,
        value: AttributeValue,
        layer: &LayerId,
    ) -> Result<(AttributeRecord, bool), StoreError> {
        validate_name(name)?;
        validate_value(&value)?;

        let current = uow
            .reader()
            .current_attribute(ci, name, layer, TimeThreshold::Latest)?;
        if let Some(current) = &current
            && !current.state.is_removed()
            && current.value == value
        {
            return Ok((current.clone(), false));
        }
        let state = ChangeState::after_insert(current.map(|r| r.state));
        let record = Self::append(uow, ci, name, layer, value, state)?;
        Ok((record, true))
    }

    /// Tombstone the current value of (ci, name) in `layer`.
    pub fn remove_attribute(
        uow: &mut UnitOfWork<'_>,
        ci: CiId,
        name: &str,
        layer: &LayerId,
    ) -> Result<(AttributeRecord, bool), StoreError> {
        let current = uow
            .reader()
            .current_attribute(ci, name, layer, TimeThreshold::Latest)?
            .ok_or_else(|| {
                StoreError::NotFound(format!("Attribute {} of CI {} in layer {}", name, ci, layer))
            })?;
        if current.state.is_removed() {
            return Ok((current, false));
        }
        let record = Self::append(uow, ci, name, layer, current.value, ChangeState::Removed)?;
        Ok((record, true))
    }

    fn append(
        uow: &mut UnitOfWork<'_>,
        ci: CiId,
        name: &str,
        layer: &LayerId,
        value: AttributeValue,
        state: ChangeState,
    ) -> Result<AttributeRecord, StoreError> {
        let changeset = uow.changeset(layer)?;
        let record = AttributeRecord {
            id: Uuid::new_v4(),
            ci,
            name: name.to_string(),
            layer: layer.clone(),
            value,
            state,
            changeset: changeset.id,
            timestamp: changeset.timestamp,
            origin: changeset.origin,
        };
        uow.writer().append_attribute(&record)?;
        uow.note_write(layer);
        tracing::debug!(
            ci = %ci,
            name,
            layer = %layer,
            state = state.name(),
            "wrote attribute record"
        );
        Ok(record)
    }

    /// Make `fragments` the complete content of `scope` in `layer`.
    ///
    /// Each fragment is inserted and each live record of the scope without a
    /// fragment is removed, both through [`LayeredWriter`] under `policy`.
    /// A mask without a fragment therefore stays while
    /// `ApplyMaskIfNecessary` finds a live value below it. The caller's unit
    /// of work makes the whole replace atomic.
    pub fn bulk_replace_attributes(
        uow: &mut UnitOfWork<'_>,
        layer: &LayerId,
        scope: &AttributeBulkScope,
        fragments: Vec<AttributeFragment>,
        policy: &BulkWritePolicy,
    ) -> Result<BulkOutcome, StoreError> {
        policy.check_write_layer(layer)?;
        if fragments.len() > MAX_BULK_FRAGMENTS {
            return Err(StoreError::InvalidState(format!(
                "Bulk replace exceeds {} fragments",
                MAX_BULK_FRAGMENTS
            )));
        }
        let mut desired = BTreeSet::new();
        for fragment in &fragments {
            if !scope.contains(fragment.ci, &fragment.name) {
                return Err(StoreError::InvalidState(format!(
                    "Fragment {} of CI {} lies outside the bulk scope",
                    fragment.name, fragment.ci
                )));
            }
            if !desired.insert((fragment.ci, fragment.name.clone())) {
                return Err(StoreError::InvalidState(format!(
                    "Duplicate fragment {} of CI {}",
                    fragment.name, fragment.ci
                )));
            }
        }

        let existing: Vec<AttributeRecord> = Self::attributes_of_layer(
            uow.reader(),
            layer,
            &scope.cis(),
            &scope.names(),
            TimeThreshold::Latest,
        )?
        .into_iter()
        .filter(|r| scope.contains(r.ci, &r.name))
        .collect();

        let mut outcome = BulkOutcome::default();
        for fragment in fragments {
            let written = LayeredWriter::insert_attribute(
                uow,
                fragment.ci,
                &fragment.name,
                fragment.value,
                layer,
                &policy.read_layers,
                policy.other_layers,
            )?;
            outcome.count_write(&written);
        }
        for record in existing {
            if !desired.contains(&(record.ci, record.name.clone())) {
                let removed = LayeredWriter::remove_attribute(
                    uow,
                    record.ci,
                    &record.name,
                    layer,
                    &policy.read_layers,
                    policy.masks,
                )?;
                outcome.count_removal(&removed);
            }
        }
        tracing::info!(
            layer = %layer,
            written = outcome.written,
            removed = outcome.removed,
            unchanged = outcome.unchanged,
            skipped = outcome.skipped,
            "bulk replaced attributes"
        );
        Ok(outcome)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::layer::LayerSet;
    use crate::merge::MergeEngine;
    use crate::policy::{MaskHandlingForRemoval, OtherLayersValueHandling};
    use crate::session::Session;
    use crate::types::UserId;

    fn layer() -> LayerId {
        LayerId::new("base").unwrap()
    }

    fn text(s: &str) -> AttributeValue {
        AttributeValue::text(s)
    }

    #[test]
    fn state_machine_walk() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let mut uow = session.begin(UserId::new("u")).unwrap();

        let (r, changed) =
            AttributeModel::insert_attribute(&mut uow, ci, "a", text("v1"), &layer()).unwrap();
        assert!(changed);
        assert_eq!(r.state, ChangeState::New);

        let (r, changed) =
            AttributeModel::insert_attribute(&mut uow, ci, "a", text("v1"), &layer()).unwrap();
        assert!(!changed);
        assert_eq!(r.state, ChangeState::New);

        let (r, _) =
            AttributeModel::insert_attribute(&mut uow, ci, "a", text("v2"), &layer()).unwrap();
        assert_eq!(r.state, ChangeState::Changed);

        let (r, changed) = AttributeModel::remove_attribute(&mut uow, ci, "a", &layer()).unwrap();
        assert!(changed);
        assert_eq!(r.state, ChangeState::Removed);
        assert_eq!(r.value, text("v2"));

        let (again, changed) =
            AttributeModel::remove_attribute(&mut uow, ci, "a", &layer()).unwrap();
        assert!(!changed);
        assert_eq!(again.id, r.id);

        let (r, _) =
            AttributeModel::insert_attribute(&mut uow, ci, "a", text("v1"), &layer()).unwrap();
        assert_eq!(r.state, ChangeState::Renewed);
        uow.commit().unwrap();
    }

    #[test]
    fn remove_missing_is_not_found() {
        let mut session = Session::new();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        let result = AttributeModel::remove_attribute(&mut uow, CiId::new_random(), "x", &layer());
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn noop_write_creates_no_changeset() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        AttributeModel::insert_attribute(&mut uow, ci, "a", text("v"), &layer()).unwrap();
        uow.commit().unwrap();

        let mut uow = session.begin(UserId::new("u")).unwrap();
        AttributeModel::insert_attribute(&mut uow, ci, "a", text("v"), &layer()).unwrap();
        assert!(uow.created_changesets().is_empty());
        uow.commit().unwrap();

        let view = session.read().unwrap();
        assert_eq!(view.reader().changesets().unwrap().len(), 1);
    }

    #[test]
    fn invalid_names_and_masks_are_rejected() {
        let mut session = Session::new();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        let ci = CiId::new_random();
        assert!(matches!(
            AttributeModel::insert_attribute(&mut uow, ci, "", text("v"), &layer()),
            Err(StoreError::InvalidId { .. })
        ));
        assert!(matches!(
            AttributeModel::insert_attribute(&mut uow, ci, "a", AttributeValue::Mask, &layer()),
            Err(StoreError::InvalidState(_))
        ));
    }

    #[test]
    fn bulk_replace_diffs_scope() {
        let mut session = Session::new();
        let (a, b) = (CiId::new_random(), CiId::new_random());
        let mut uow = session.begin(UserId::new("u")).unwrap();
        AttributeModel::insert_attribute(&mut uow, a, "net.ip", text("10.0.0.1"), &layer())
            .unwrap();
        AttributeModel::insert_attribute(&mut uow, a, "net.mask", text("24"), &layer()).unwrap();
        AttributeModel::insert_attribute(&mut uow, b, "os", text("linux"), &layer()).unwrap();

        let scope = AttributeBulkScope::LayerNamePrefix("net.".to_string());
        let outcome = AttributeModel::bulk_replace_attributes(
            &mut uow,
            &layer(),
            &scope,
            vec![
                AttributeFragment {
                    ci: a,
                    name: "net.ip".to_string(),
                    value: text("10.0.0.1"),
                },
                AttributeFragment {
                    ci: b,
                    name: "net.ip".to_string(),
                    value: text("10.0.0.2"),
                },
            ],
            &BulkWritePolicy::plain(&layer()),
        )
        .unwrap();
        assert_eq!(
            outcome,
            BulkOutcome {
                written: 1,
                removed: 1,
                unchanged: 1,
                skipped: 0,
            }
        );

        let live = AttributeModel::attributes_of_layer(
            uow.reader(),
            &layer(),
            &CiSelection::All,
            &AttributeSelection::All,
            TimeThreshold::Latest,
        )
        .unwrap();
        let names: BTreeSet<(CiId, String)> =
            live.into_iter().map(|r| (r.ci, r.name)).collect();
        assert!(names.contains(&(b, "os".to_string())));
        assert!(names.contains(&(b, "net.ip".to_string())));
        assert!(!names.contains(&(a, "net.mask".to_string())));
        uow.commit().unwrap();
    }

    #[test]
    fn bulk_replace_rejects_out_of_scope_and_duplicates() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        let scope = AttributeBulkScope::CiNamePrefix {
            ci,
            prefix: "x.".to_string(),
        };
        let outside = AttributeFragment {
            ci,
            name: "y".to_string(),
            value: text("v"),
        };
        let plain = BulkWritePolicy::plain(&layer());
        assert!(
            AttributeModel::bulk_replace_attributes(
                &mut uow,
                &layer(),
                &scope,
                vec![outside],
                &plain
            )
            .is_err()
        );
        let dup = AttributeFragment {
            ci,
            name: "x.a".to_string(),
            value: text("v"),
        };
        assert!(
            AttributeModel::bulk_replace_attributes(
                &mut uow,
                &layer(),
                &scope,
                vec![dup.clone(), dup],
                &plain
            )
            .is_err()
        );
    }

    #[test]
    fn bulk_replace_keeps_needed_masks() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let (w, r) = (LayerId::new("w").unwrap(), layer());
        let both = LayerSet::new([w.clone(), r.clone()]).unwrap();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        AttributeModel::insert_attribute(&mut uow, ci, "k", text("lower"), &r).unwrap();
        AttributeModel::insert_mask(&mut uow, ci, "k", &w).unwrap();
        let scope = AttributeBulkScope::CiNamePrefix {
            ci,
            prefix: String::new(),
        };

        let masking = BulkWritePolicy {
            read_layers: both.clone(),
            other_layers: OtherLayersValueHandling::ForceWrite,
            masks: MaskHandlingForRemoval::ApplyMaskIfNecessary,
        };
        let outcome =
            AttributeModel::bulk_replace_attributes(&mut uow, &w, &scope, vec![], &masking)
                .unwrap();
        assert_eq!(outcome.removed, 0);
        assert_eq!(outcome.unchanged, 1);
        assert!(
            MergeEngine::get_merged_attribute(uow.reader(), ci, "k", &both, TimeThreshold::Latest)
                .unwrap()
                .is_none()
        );

        let plain = BulkWritePolicy {
            read_layers: both.clone(),
            ..BulkWritePolicy::plain(&w)
        };
        let outcome =
            AttributeModel::bulk_replace_attributes(&mut uow, &w, &scope, vec![], &plain)
                .unwrap();
        assert_eq!(outcome.removed, 1);
        let merged =
            MergeEngine::get_merged_attribute(uow.reader(), ci, "k", &both, TimeThreshold::Latest)
                .unwrap()
                .unwrap();
        assert_eq!(merged.value(), &text("lower"));
    }

    #[test]
    fn bulk_replace_skips_values_other_layers_provide() {
        let mut session = Session::new();
        let ci = CiId::new_random();
        let (w, r) = (LayerId::new("w").unwrap(), layer());
        let mut uow = session.begin(UserId::new("u")).unwrap();
        AttributeModel::insert_attribute(&mut uow, ci, "k", text("same"), &r).unwrap();
        let policy = BulkWritePolicy {
            read_layers: LayerSet::new([w.clone(), r]).unwrap(),
            other_layers: OtherLayersValueHandling::TakeIntoAccount,
            masks: MaskHandlingForRemoval::ApplyNoMask,
        };
        let fragment = |value: &str| AttributeFragment {
            ci,
            name: "k".to_string(),
            value: text(value),
        };
        let scope = AttributeBulkScope::LayerNamePrefix(String::new());

        let outcome = AttributeModel::bulk_replace_attributes(
            &mut uow,
            &w,
            &scope,
            vec![fragment("same")],
            &policy,
        )
        .unwrap();
        assert_eq!(outcome.skipped, 1);
        let outcome = AttributeModel::bulk_replace_attributes(
            &mut uow,
            &w,
            &scope,
            vec![fragment("other")],
            &policy,
        )
        .unwrap();
        assert_eq!(outcome.written, 1);
    }

    #[test]
    fn bulk_replace_requires_write_layer_in_read_set() {
        let mut session = Session::new();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        let w = LayerId::new("w").unwrap();
        assert!(matches!(
            AttributeModel::bulk_replace_attributes(
                &mut uow,
                &w,
                &AttributeBulkScope::LayerNamePrefix(String::new()),
                vec![],
                &BulkWritePolicy::plain(&layer()),
            ),
            Err(StoreError::InvalidState(_))
        ));
    }
}
