//! # Layer Export
//!
//! Deterministic, bit-exact serialization of one layer's live content.
//!
//! A redb file is not bit-identical across runs; the export stream is. Two
//! exports of the same layer content produce the same bytes, so the stream
//! doubles as a comparison format.
//!
//! Format:
//! ```text
//! [header_len: u32 LE] [LayerExportHeader (postcard)] [LayerExport (postcard)]
//! ```
//!
//! Only live values and relations are exported. Masks and history stay
//! behind; importing replaces the whole content of the target layer.

use crate::attribute::{AttributeBulkScope, AttributeFragment, AttributeModel, BulkOutcome};
use crate::policy::BulkWritePolicy;
use crate::primitives::MAX_BULK_FRAGMENTS;
use crate::relation::{RelationBulkScope, RelationModel};
use crate::selection::{AttributeSelection, CiSelection, RelationSelection};
use crate::session::UnitOfWork;
use crate::storage::RecordReader;
use crate::types::{
    AttributeValue, CiId, LayerId, PredicateId, RelationKey, StoreError, TimeThreshold,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// FORMAT
// =============================================================================

/// Magic bytes of the export format.
pub const EXPORT_MAGIC: [u8; 4] = *b"LKEX";

/// Current export format version.
pub const EXPORT_VERSION: u8 = 1;

/// Header of an export stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayerExportHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub attribute_count: u64,
    pub relation_count: u64,
    /// FNV-1a over the encoded data section.
    pub checksum: u64,
}

impl LayerExportHeader {
    /// Error messages stay generic so they do not describe the format.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.magic != EXPORT_MAGIC {
            return Err(StoreError::Serialization("Invalid file format".to_string()));
        }
        if self.version != EXPORT_VERSION {
            return Err(StoreError::Serialization(
                "Unsupported file version".to_string(),
            ));
        }
        let limit = MAX_BULK_FRAGMENTS as u64;
        if self.attribute_count > limit || self.relation_count > limit {
            return Err(StoreError::Serialization(format!(
                "Export exceeds {} records",
                MAX_BULK_FRAGMENTS
            )));
        }
        Ok(())
    }
}

/// One exported attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportedAttribute {
    pub ci: CiId,
    pub name: String,
    pub value: AttributeValue,
}

/// One exported relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExportedRelation {
    pub from: CiId,
    pub to: CiId,
    pub predicate: PredicateId,
}

/// The live content of a layer, sorted by key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayerExport {
    /// Layer the content was read from.
    pub layer: LayerId,
    /// Sorted by (ci, name).
    pub attributes: Vec<ExportedAttribute>,
    /// Sorted by (from, to, predicate).
    pub relations: Vec<ExportedRelation>,
}

impl LayerExport {
    /// Collect the live content of `layer` as of `at`.
    pub fn from_layer(
        reader: &dyn RecordReader,
        layer: &LayerId,
        at: TimeThreshold,
    ) -> Result<Self, StoreError> {
        let mut attributes: Vec<ExportedAttribute> = AttributeModel::attributes_of_layer(
            reader,
            layer,
            &CiSelection::All,
            &AttributeSelection::All,
            at,
        )?
        .into_iter()
        .filter(|r| !r.is_mask())
        .map(|r| ExportedAttribute {
            ci: r.ci,
            name: r.name,
            value: r.value,
        })
        .collect();
        attributes.sort_by(|a, b| (a.ci, &a.name).cmp(&(b.ci, &b.name)));

        let mut relations: Vec<ExportedRelation> =
            RelationModel::relations_of_layer(reader, layer, &RelationSelection::All, at)?
                .into_iter()
                .filter(|r| !r.is_mask())
                .map(|r| ExportedRelation {
                    from: r.from,
                    to: r.to,
                    predicate: r.predicate,
                })
                .collect();
        relations.sort();

        Ok(Self {
            layer: layer.clone(),
            attributes,
            relations,
        })
    }
}

fn checksum(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    data.iter()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

// =============================================================================
// EXPORT / IMPORT
// =============================================================================

/// Encode the live content of `layer` as an export stream.
pub fn export_layer(
    reader: &dyn RecordReader,
    layer: &LayerId,
    at: TimeThreshold,
) -> Result<Vec<u8>, StoreError> {
    encode_export(&LayerExport::from_layer(reader, layer, at)?)
}

pub fn encode_export(export: &LayerExport) -> Result<Vec<u8>, StoreError> {
    let data = postcard::to_allocvec(export)
        .map_err(|e| StoreError::Serialization(format!("Data: {}", e)))?;
    let header = LayerExportHeader {
        magic: EXPORT_MAGIC,
        version: EXPORT_VERSION,
        attribute_count: export.attributes.len() as u64,
        relation_count: export.relations.len() as u64,
        checksum: checksum(&data),
    };
    let header_bytes = postcard::to_allocvec(&header)
        .map_err(|e| StoreError::Serialization(format!("Header: {}", e)))?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| StoreError::Serialization("Header too large".to_string()))?;

    let mut result = Vec::with_capacity(4 + header_bytes.len() + data.len());
    result.extend_from_slice(&header_len.to_le_bytes());
    result.extend_from_slice(&header_bytes);
    result.extend_from_slice(&data);
    Ok(result)
}

/// Decode and verify an export stream.
pub fn decode_export(bytes: &[u8]) -> Result<LayerExport, StoreError> {
    let Some((len_bytes, rest)) = bytes.split_first_chunk::<4>() else {
        return Err(StoreError::Serialization("Data too short".to_string()));
    };
    let header_len = u32::from_le_bytes(*len_bytes) as usize;
    if rest.len() < header_len {
        return Err(StoreError::Serialization(
            "Data too short for header".to_string(),
        ));
    }
    let (header_bytes, data) = rest.split_at(header_len);

    let header: LayerExportHeader = postcard::from_bytes(header_bytes)
        .map_err(|e| StoreError::Serialization(format!("Header: {}", e)))?;
    header.validate()?;

    let computed = checksum(data);
    if computed != header.checksum {
        return Err(StoreError::Serialization(format!(
            "Checksum mismatch: expected {}, got {}",
            header.checksum, computed
        )));
    }
    let export: LayerExport = postcard::from_bytes(data)
        .map_err(|e| StoreError::Serialization(format!("Data: {}", e)))?;
    if export.attributes.len() as u64 != header.attribute_count
        || export.relations.len() as u64 != header.relation_count
    {
        return Err(StoreError::Serialization("Record count mismatch".to_string()));
    }
    Ok(export)
}

/// What an import changed in the target layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub attributes: BulkOutcome,
    pub relations: BulkOutcome,
}

/// Replace the content of `target` with an export stream.
///
/// Atomic with the caller's unit of work.
pub fn import_layer(
    uow: &mut UnitOfWork<'_>,
    target: &LayerId,
    bytes: &[u8],
) -> Result<ImportOutcome, StoreError> {
    let export = decode_export(bytes)?;
    let fragments = export
        .attributes
        .into_iter()
        .map(|a| AttributeFragment {
            ci: a.ci,
            name: a.name,
            value: a.value,
        })
        .collect();
    let policy = BulkWritePolicy::plain(target);
    let attributes = AttributeModel::bulk_replace_attributes(
        uow,
        target,
        &AttributeBulkScope::LayerNamePrefix(String::new()),
        fragments,
        &policy,
    )?;
    let keys = export
        .relations
        .into_iter()
        .map(|r| RelationKey::new(r.from, r.to, r.predicate))
        .collect();
    let relations = RelationModel::bulk_replace_relations(
        uow,
        target,
        &RelationBulkScope::Layer,
        keys,
        &policy,
    )?;
    tracing::info!(
        source = %export.layer,
        target = %target,
        attributes = attributes.written,
        relations = relations.written,
        "imported layer"
    );
    Ok(ImportOutcome {
        attributes,
        relations,
    })
}

/// BLAKE3 digest of an export stream as hex.
#[cfg(feature = "crypto-hash")]
#[must_use]
pub fn export_digest(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

// =============================================================================
// TESTS
// =============================================================================
