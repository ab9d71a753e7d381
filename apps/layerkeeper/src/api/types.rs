//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API.

use chrono::{DateTime, Utc};
use layerkeeper_core::{
    AttributeRecord, AttributeValue, AttributeValueType, CiId, EffectiveTrait, GenericTrait,
    Layer, MaskHandlingForRemoval, MaskHandlingForRetrieval, OtherLayersValueHandling,
    PolicyOutcome, RelationRecord, StoreError, TimeThreshold, schema::FlattenConflict,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// ERROR RESPONSE
// =============================================================================

/// Body of every failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            error: msg.into(),
        }
    }
}

// =============================================================================
// READ PARAMETERS
// =============================================================================

/// Query string of merged reads: `?layers=a,b&at=2024-01-01T00:00:00Z`.
///
/// Relation reads also take `masks=get_masks` to return deciding masks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadParams {
    /// Comma-separated layer ids, most precedent first.
    pub layers: String,
    /// As-of time; latest when absent.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub masks: MaskHandlingForRetrieval,
}

impl ReadParams {
    pub fn threshold(&self) -> TimeThreshold {
        self.at.map_or(TimeThreshold::Latest, TimeThreshold::AsOf)
    }
}

// =============================================================================
// LAYERS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLayerRequest {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerResponse {
    pub layer: Layer,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteLayerResponse {
    pub deleted: bool,
}

// =============================================================================
// CIS
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateCiRequest {
    /// Caller-chosen id; a random one when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiResponse {
    pub id: CiId,
}

// =============================================================================
// ATTRIBUTE VALUES
// =============================================================================

fn default_value_type() -> String {
    "text".to_string()
}

/// Wire form of an attribute value: type, array-ness and raw items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueJson {
    #[serde(rename = "type", default = "default_value_type")]
    pub value_type: String,
    #[serde(default)]
    pub array: bool,
    #[serde(default)]
    pub items: Vec<String>,
}

impl ValueJson {
    /// A scalar text value.
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            value_type: default_value_type(),
            array: false,
            items: vec![s.into()],
        }
    }

    pub fn to_value(&self) -> Result<AttributeValue, StoreError> {
        let value_type: AttributeValueType = self.value_type.parse()?;
        if value_type == AttributeValueType::Mask {
            return Err(StoreError::InvalidState(
                "Masks are written by removing with apply_mask_if_necessary".to_string(),
            ));
        }
        AttributeValue::from_parts(value_type, self.array, &self.items)
    }
}

// =============================================================================
// ATTRIBUTE WRITES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAttributeRequest {
    pub ci: String,
    pub name: String,
    pub value: ValueJson,
    pub layer: String,
    /// Read set for the policy check; the write layer alone when empty.
    #[serde(default)]
    pub read_layers: Vec<String>,
    #[serde(default)]
    pub policy: OtherLayersValueHandling,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveAttributeRequest {
    pub ci: String,
    pub name: String,
    pub layer: String,
    #[serde(default)]
    pub read_layers: Vec<String>,
    #[serde(default)]
    pub mask: MaskHandlingForRemoval,
    #[serde(default)]
    pub user: Option<String>,
}

/// Outcome of a policy-aware write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub changed: bool,
    pub skipped: bool,
    /// State of the current record, absent when skipped.
    pub state: Option<String>,
    pub mask: bool,
}

impl From<PolicyOutcome<AttributeRecord>> for WriteResponse {
    fn from(outcome: PolicyOutcome<AttributeRecord>) -> Self {
        Self {
            changed: outcome.changed(),
            skipped: matches!(outcome, PolicyOutcome::Skipped),
            state: outcome.record().map(|r| r.state.name().to_string()),
            mask: outcome.record().is_some_and(AttributeRecord::is_mask),
        }
    }
}

impl From<PolicyOutcome<RelationRecord>> for WriteResponse {
    fn from(outcome: PolicyOutcome<RelationRecord>) -> Self {
        Self {
            changed: outcome.changed(),
            skipped: matches!(outcome, PolicyOutcome::Skipped),
            state: outcome.record().map(|r| r.state.name().to_string()),
            mask: outcome.record().is_some_and(RelationRecord::is_mask),
        }
    }
}

// =============================================================================
// RELATION WRITES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRelationRequest {
    pub from: String,
    pub to: String,
    pub predicate: String,
    pub layer: String,
    #[serde(default)]
    pub read_layers: Vec<String>,
    #[serde(default)]
    pub policy: OtherLayersValueHandling,
    /// Require the predicate to be defined in the meta layers.
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveRelationRequest {
    pub from: String,
    pub to: String,
    pub predicate: String,
    pub layer: String,
    #[serde(default)]
    pub read_layers: Vec<String>,
    #[serde(default)]
    pub mask: MaskHandlingForRemoval,
    #[serde(default)]
    pub user: Option<String>,
}

// =============================================================================
// TRAITS
// =============================================================================

/// Active traits of the meta layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitListResponse {
    pub traits: Vec<GenericTrait>,
    pub conflicts: Vec<FlattenConflict>,
    /// Excluded traits and why.
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveTraitsResponse {
    pub trait_id: String,
    pub effective: Vec<EffectiveTrait>,
}

// =============================================================================
// PREDICATES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateRequest {
    pub id: String,
    pub wording_from: String,
    pub wording_to: String,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateWriteResponse {
    pub ci: CiId,
    pub changed: bool,
}

// =============================================================================
// CHANGESETS
// =============================================================================

/// Query string of `/changesets`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesetParams {
    pub layers: String,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    /// Only changesets touching this CI.
    #[serde(default)]
    pub ci: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

// =============================================================================
// EXPORT
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    pub layer: String,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

/// Export response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResponse {
    pub success: bool,
    /// Base64 encoded export stream.
    pub data: String,
    /// BLAKE3 digest of the stream.
    pub digest: String,
    pub attributes: usize,
    pub relations: usize,
}

impl ExportResponse {
    pub fn new(data: &[u8], digest: String, attributes: usize, relations: usize) -> Self {
        Self {
            success: true,
            data: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, data),
            digest,
            attributes,
            relations,
        }
    }
}
