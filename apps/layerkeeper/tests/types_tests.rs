//! Serialization tests for the API request and response types.

#![allow(clippy::unwrap_used, clippy::panic)]

use layerkeeper::api::{
    ChangesetParams, CreateCiRequest, ErrorResponse, ExportResponse, HealthResponse, ReadParams,
    RemoveAttributeRequest, SetAttributeRequest, SetRelationRequest, ValueJson, WriteResponse,
};
use layerkeeper_core::{
    AttributeValue, MaskHandlingForRemoval, MaskHandlingForRetrieval, OtherLayersValueHandling,
    PolicyOutcome, RelationRecord, TimeThreshold,
};

// =============================================================================
// HEALTH / ERROR RESPONSE TESTS
// =============================================================================

#[test]
fn test_health_response_default() {
    let health = HealthResponse::default();
    assert_eq!(health.status, "ok");
    assert!(!health.version.is_empty());
}

#[test]
fn test_error_response_shape() {
    let json = serde_json::to_value(ErrorResponse::new("Layer ghost")).unwrap();
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "Layer ghost");
}

// =============================================================================
// VALUE TESTS
// =============================================================================

#[test]
fn test_value_type_defaults_to_text() {
    let value: ValueJson = serde_json::from_str(r#"{"items":["db01"]}"#).unwrap();
    assert_eq!(value, ValueJson::text("db01"));
    assert_eq!(
        value.to_value().unwrap(),
        AttributeValue::Text("db01".to_string())
    );
}

#[test]
fn test_value_type_field_is_named_type() {
    let json = serde_json::to_value(ValueJson::text("x")).unwrap();
    assert_eq!(json["type"], "text");
    assert_eq!(json["array"], false);
}

#[test]
fn test_integer_value_parses() {
    let value: ValueJson = serde_json::from_str(r#"{"type":"integer","items":["42"]}"#).unwrap();
    assert_eq!(value.to_value().unwrap(), AttributeValue::Integer(42));
}

#[test]
fn test_unknown_value_type_is_rejected() {
    let value: ValueJson = serde_json::from_str(r#"{"type":"blob","items":["x"]}"#).unwrap();
    assert!(value.to_value().is_err());
}

#[test]
fn test_mask_value_is_rejected() {
    let value: ValueJson = serde_json::from_str(r#"{"type":"mask"}"#).unwrap();
    assert!(value.to_value().is_err());
}

// =============================================================================
// WRITE REQUEST TESTS
// =============================================================================

#[test]
fn test_set_attribute_defaults() {
    let request: SetAttributeRequest = serde_json::from_str(
        r#"{"ci":"c","name":"n","value":{"items":["v"]},"layer":"base"}"#,
    )
    .unwrap();
    assert_eq!(request.policy, OtherLayersValueHandling::ForceWrite);
    assert!(request.read_layers.is_empty());
    assert!(request.user.is_none());
}

#[test]
fn test_policies_use_snake_case() {
    let request: SetAttributeRequest = serde_json::from_str(
        r#"{"ci":"c","name":"n","value":{"items":["v"]},"layer":"base",
            "read_layers":["top","base"],"policy":"take_into_account","user":"ops"}"#,
    )
    .unwrap();
    assert_eq!(request.policy, OtherLayersValueHandling::TakeIntoAccount);
    assert_eq!(request.read_layers, vec!["top", "base"]);

    let removal: RemoveAttributeRequest = serde_json::from_str(
        r#"{"ci":"c","name":"n","layer":"top","mask":"apply_mask_if_necessary"}"#,
    )
    .unwrap();
    assert_eq!(removal.mask, MaskHandlingForRemoval::ApplyMaskIfNecessary);

    let unchecked: SetRelationRequest =
        serde_json::from_str(r#"{"from":"a","to":"b","predicate":"owns","layer":"base"}"#)
            .unwrap();
    assert!(!unchecked.checked);
}

#[test]
fn test_create_ci_request_may_be_empty() {
    let request: CreateCiRequest = serde_json::from_str("{}").unwrap();
    assert!(request.id.is_none());
}

#[test]
fn test_skipped_write_response() {
    let response = WriteResponse::from(PolicyOutcome::<RelationRecord>::Skipped);
    assert!(response.skipped);
    assert!(!response.changed);
    assert!(!response.mask);
    assert!(response.state.is_none());
}

// =============================================================================
// QUERY PARAMETER TESTS
// =============================================================================

#[test]
fn test_read_params_threshold() {
    let latest: ReadParams = serde_json::from_str(r#"{"layers":"a,b"}"#).unwrap();
    assert_eq!(latest.threshold(), TimeThreshold::Latest);

    let as_of: ReadParams =
        serde_json::from_str(r#"{"layers":"a","at":"2024-03-01T12:00:00Z"}"#).unwrap();
    assert!(matches!(as_of.threshold(), TimeThreshold::AsOf(_)));
    assert_eq!(as_of.masks, MaskHandlingForRetrieval::ApplyMasks);

    let masks: ReadParams =
        serde_json::from_str(r#"{"layers":"a","masks":"get_masks"}"#).unwrap();
    assert_eq!(masks.masks, MaskHandlingForRetrieval::GetMasks);
}

#[test]
fn test_changeset_params_optional_fields() {
    let params: ChangesetParams = serde_json::from_str(r#"{"layers":"base"}"#).unwrap();
    assert!(params.from.is_none());
    assert!(params.ci.is_none());
    assert!(params.limit.is_none());
}

// =============================================================================
// EXPORT RESPONSE TESTS
// =============================================================================

#[test]
fn test_export_response_encodes_base64() {
    let response = ExportResponse::new(b"layer", "digest".to_string(), 3, 1);
    assert!(response.success);
    assert_eq!(response.data, "bGF5ZXI=");
    assert_eq!(response.attributes, 3);
    assert_eq!(response.relations, 1);
}
