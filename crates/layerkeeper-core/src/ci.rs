//! # CI Identity
//!
//! CIs are bare identifiers. A CI exists once it was created explicitly or
//! once any attribute or relation record names it. CIs are never deleted.

use crate::layer::LayerSet;
use crate::merge::MergeEngine;
use crate::primitives::NAME_ATTRIBUTE;
use crate::selection::{AttributeSelection, CiSelection};
use crate::session::UnitOfWork;
use crate::storage::RecordReader;
use crate::types::{CiId, StoreError, TimeThreshold};
use std::collections::{BTreeMap, BTreeSet};

pub struct CiModel;

impl CiModel {
    /// Create a CI, with a random id unless one is given.
    ///
    /// A given id must not exist yet.
    pub fn create_ci(uow: &mut UnitOfWork<'_>, id: Option<CiId>) -> Result<CiId, StoreError> {
        let id = match id {
            Some(id) if uow.reader().ci_exists(id)? => {
                return Err(StoreError::InvalidState(format!("CI {} already exists", id)));
            }
            Some(id) => id,
            None => CiId::new_random(),
        };
        let created = uow.timestamp();
        uow.writer().insert_ci(id, created)?;
        tracing::info!(ci = %id, "created CI");
        Ok(id)
    }

    pub fn ci_exists(reader: &dyn RecordReader, id: CiId) -> Result<bool, StoreError> {
        reader.ci_exists(id)
    }

    /// Whether the CI had come into existence at `at`.
    pub fn ci_exists_at(
        reader: &dyn RecordReader,
        id: CiId,
        at: TimeThreshold,
    ) -> Result<bool, StoreError> {
        Ok(reader.ci_created(id)?.is_some_and(|created| at.admits(created)))
    }

    /// Create every CI of `ids` that does not exist yet; returns those created.
    pub fn ensure_cis(
        uow: &mut UnitOfWork<'_>,
        ids: impl IntoIterator<Item = CiId>,
    ) -> Result<BTreeSet<CiId>, StoreError> {
        let mut created = BTreeSet::new();
        for id in ids {
            if !uow.reader().ci_exists(id)? {
                let timestamp = uow.timestamp();
                uow.writer().insert_ci(id, timestamp)?;
                created.insert(id);
            }
        }
        if !created.is_empty() {
            tracing::info!(created = created.len(), "ensured CIs");
        }
        Ok(created)
    }

    pub fn all_ci_ids(reader: &dyn RecordReader) -> Result<BTreeSet<CiId>, StoreError> {
        reader.ci_ids_at(TimeThreshold::Latest)
    }

    pub fn ci_ids_at(
        reader: &dyn RecordReader,
        at: TimeThreshold,
    ) -> Result<BTreeSet<CiId>, StoreError> {
        reader.ci_ids_at(at)
    }

    /// Merged `__name` of each CI of `cis` that has a text name.
    pub fn merged_ci_names(
        reader: &dyn RecordReader,
        cis: &CiSelection,
        layers: &LayerSet,
        at: TimeThreshold,
    ) -> Result<BTreeMap<CiId, String>, StoreError> {
        let merged = MergeEngine::get_merged_attributes(
            reader,
            cis,
            &AttributeSelection::specific([NAME_ATTRIBUTE.to_string()]),
            layers,
            at,
        )?;
        Ok(merged
            .into_iter()
            .filter_map(|(ci, attributes)| {
                attributes
                    .get(NAME_ATTRIBUTE)
                    .and_then(|a| a.value().as_text())
                    .map(|name| (ci, name.to_string()))
            })
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::attribute::AttributeModel;
    use crate::session::Session;
    use crate::types::{AttributeValue, LayerId, UserId};

    #[test]
    fn create_with_existing_id_fails() {
        let mut session = Session::new();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        let id = CiModel::create_ci(&mut uow, None).unwrap();
        assert!(CiModel::ci_exists(uow.reader(), id).unwrap());
        assert!(matches!(
            CiModel::create_ci(&mut uow, Some(id)),
            Err(StoreError::InvalidState(_))
        ));
    }

    #[test]
    fn ensure_cis_reports_only_new_ones() {
        let mut session = Session::new();
        let external = CiId::from_external("ldap", "cn=alice");
        let mut uow = session.begin(UserId::new("u")).unwrap();
        let known = CiModel::create_ci(&mut uow, None).unwrap();
        let created = CiModel::ensure_cis(&mut uow, [known, external]).unwrap();
        assert_eq!(created, BTreeSet::from([external]));
        assert_eq!(
            CiModel::all_ci_ids(uow.reader()).unwrap(),
            BTreeSet::from([known, external])
        );
    }

    #[test]
    fn names_come_from_merged_view() {
        let mut session = Session::new();
        let layer = LayerId::new("base").unwrap();
        let mut uow = session.begin(UserId::new("u")).unwrap();
        let a = CiModel::create_ci(&mut uow, None).unwrap();
        let b = CiModel::create_ci(&mut uow, None).unwrap();
        AttributeModel::insert_attribute(
            &mut uow,
            a,
            NAME_ATTRIBUTE,
            AttributeValue::text("web01"),
            &layer,
        )
        .unwrap();
        let names = CiModel::merged_ci_names(
            uow.reader(),
            &CiSelection::All,
            &LayerSet::single(layer),
            TimeThreshold::Latest,
        )
        .unwrap();
        assert_eq!(names.get(&a).map(String::as_str), Some("web01"));
        assert!(!names.contains_key(&b));
    }
}
