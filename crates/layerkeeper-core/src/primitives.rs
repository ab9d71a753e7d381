//! # Primitives
//!
//! Hardcoded limits and identifier rules for the layerkeeper CORE.
//!
//! These values are compiled into the binary and are immutable at runtime.
//! Every write path validates against them before touching storage.

// =============================================================================
// IDENTIFIER RULES
// =============================================================================

/// Maximum length of a layer, predicate or trait identifier.
pub const MAX_ID_LENGTH: usize = 128;

/// Attribute name carrying the human readable name of a CI.
pub const NAME_ATTRIBUTE: &str = "__name";

/// Layer ids: lowercase ascii letters, digits and `_`.
#[must_use]
pub fn is_valid_layer_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LENGTH
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Trait and predicate ids additionally allow `.` as a namespace separator.
#[must_use]
pub fn is_valid_dotted_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LENGTH
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'.')
}

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length for attribute names.
pub const MAX_ATTRIBUTE_NAME_LENGTH: usize = 256;

/// Maximum encoded size of a single attribute value in bytes.
///
/// Array values count the sum of their elements.
pub const MAX_VALUE_LENGTH: usize = 1024 * 1024;

/// Maximum number of layers in one LayerSet.
pub const MAX_LAYERSET_LENGTH: usize = 64;

/// Maximum number of fragments accepted by one bulk replace.
pub const MAX_BULK_FRAGMENTS: usize = 1_000_000;

/// Maximum nesting depth while flattening recursive traits.
///
/// Cycles are detected explicitly; this bounds pathological but acyclic chains.
pub const MAX_TRAIT_DEPTH: usize = 64;

// =============================================================================
// TESTS
// =============================================================================
