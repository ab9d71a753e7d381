//! # Trait Schema
//!
//! Traits are named schema fragments: the attributes and relations a CI
//! must (or may) have to count as, say, a `host` or a `team`.
//!
//! - [`RecursiveTrait`]: a trait as defined, possibly requiring other traits
//! - [`GenericTrait`]: the flattened form with every required trait unioned in
//!
//! Traits are schema, not data: they are unversioned and immutable once
//! built, so a flattened trait can be shared freely between requests.

pub mod core_traits;
pub mod flatten;

pub use core_traits::CoreTraits;
pub use flatten::{FlattenConflict, FlattenReport, TraitFlattener, flatten_standalone};

use crate::types::{AttributeValue, AttributeValueType, PredicateId, StoreError, TraitId};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compiled size limit for user supplied patterns.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

// =============================================================================
// CONSTRAINTS
// =============================================================================

/// A regular expression kept together with its source text.
///
/// Compares and serializes by source.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TextPattern {
    source: String,
    regex: Regex,
}

impl TextPattern {
    pub fn new(source: impl Into<String>) -> Result<Self, StoreError> {
        let source = source.into();
        let regex = RegexBuilder::new(&source)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map_err(|e| StoreError::InvalidState(format!("Invalid pattern {source:?}: {e}")))?;
        Ok(Self { source, regex })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for TextPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for TextPattern {}

impl fmt::Debug for TextPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TextPattern").field(&self.source).finish()
    }
}

impl TryFrom<String> for TextPattern {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TextPattern> for String {
    fn from(value: TextPattern) -> Self {
        value.source
    }
}

/// A check on an attribute value beyond its type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttributeConstraint {
    /// Length in characters of every text item.
    TextLength {
        min: Option<usize>,
        max: Option<usize>,
    },
    /// Every text item matches the pattern.
    TextRegex { pattern: TextPattern },
    /// Number of elements of an array value.
    ArrayLength {
        min: Option<usize>,
        max: Option<usize>,
    },
}

fn within(n: usize, min: Option<usize>, max: Option<usize>) -> bool {
    min.is_none_or(|m| n >= m) && max.is_none_or(|m| n <= m)
}

impl AttributeConstraint {
    #[must_use]
    pub fn text_min_length(min: usize) -> Self {
        Self::TextLength {
            min: Some(min),
            max: None,
        }
    }

    pub fn text_regex(pattern: &str) -> Result<Self, StoreError> {
        Ok(Self::TextRegex {
            pattern: TextPattern::new(pattern)?,
        })
    }

    #[must_use]
    pub fn array_min_length(min: usize) -> Self {
        Self::ArrayLength {
            min: Some(min),
            max: None,
        }
    }

    /// Whether `value` satisfies this constraint.
    ///
    /// Text constraints fail on non-text values; array constraints fail on
    /// scalars.
    #[must_use]
    pub fn check(&self, value: &AttributeValue) -> bool {
        match self {
            Self::TextLength { min, max } => value
                .text_items()
                .is_some_and(|items| items.iter().all(|s| within(s.chars().count(), *min, *max))),
            Self::TextRegex { pattern } => value
                .text_items()
                .is_some_and(|items| items.iter().all(|s| pattern.is_match(s))),
            Self::ArrayLength { min, max } => value
                .array_len()
                .is_some_and(|n| within(n, *min, *max)),
        }
    }
}

// =============================================================================
// TEMPLATES
// =============================================================================

/// What a trait expects of one underlying attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitAttributeTemplate {
    /// Underlying attribute name.
    pub name: String,
    /// Required scalar type; `None` accepts any type.
    #[serde(default)]
    pub value_type: Option<AttributeValueType>,
    /// Required array-ness; `None` accepts both.
    #[serde(default)]
    pub is_array: Option<bool>,
    #[serde(default)]
    pub constraints: Vec<AttributeConstraint>,
}

impl TraitAttributeTemplate {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: None,
            is_array: None,
            constraints: Vec::new(),
        }
    }

    /// A scalar of the given type.
    #[must_use]
    pub fn scalar(name: impl Into<String>, value_type: AttributeValueType) -> Self {
        Self {
            value_type: Some(value_type),
            is_array: Some(false),
            ..Self::new(name)
        }
    }

    /// An array of the given type.
    #[must_use]
    pub fn array(name: impl Into<String>, value_type: AttributeValueType) -> Self {
        Self {
            value_type: Some(value_type),
            is_array: Some(true),
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn with(mut self, constraint: AttributeConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Type, array-ness and every constraint hold for `value`.
    #[must_use]
    pub fn matches(&self, value: &AttributeValue) -> bool {
        if value.is_mask() {
            return false;
        }
        self.value_type.is_none_or(|t| t == value.value_type())
            && self.is_array.is_none_or(|a| a == value.is_array())
            && self.constraints.iter().all(|c| c.check(value))
    }
}

/// A trait-local identifier bound to an attribute template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitAttribute {
    pub identifier: String,
    pub template: TraitAttributeTemplate,
}

impl TraitAttribute {
    #[must_use]
    pub fn new(identifier: impl Into<String>, template: TraitAttributeTemplate) -> Self {
        Self {
            identifier: identifier.into(),
            template,
        }
    }
}

/// Which end of a relation the CI sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationDirection {
    /// The CI is the source.
    Forward,
    /// The CI is the target.
    Back,
}

/// A trait-local identifier bound to a relation requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitRelation {
    pub identifier: String,
    pub predicate: PredicateId,
    pub direction: RelationDirection,
    #[serde(default)]
    pub min_cardinality: usize,
    #[serde(default)]
    pub max_cardinality: Option<usize>,
}

impl TraitRelation {
    #[must_use]
    pub fn new(
        identifier: impl Into<String>,
        predicate: PredicateId,
        direction: RelationDirection,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            predicate,
            direction,
            min_cardinality: 0,
            max_cardinality: None,
        }
    }

    #[must_use]
    pub fn cardinality(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_cardinality = min;
        self.max_cardinality = max;
        self
    }

    #[must_use]
    pub fn admits(&self, count: usize) -> bool {
        within(count, Some(self.min_cardinality), self.max_cardinality)
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// Where a trait definition comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraitOrigin {
    /// Built into the engine.
    Core,
    /// Stored as a configuration record.
    Data,
}

/// A trait as defined, possibly requiring other traits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecursiveTrait {
    pub id: TraitId,
    pub origin: TraitOrigin,
    pub required_attributes: Vec<TraitAttribute>,
    #[serde(default)]
    pub optional_attributes: Vec<TraitAttribute>,
    #[serde(default)]
    pub required_relations: Vec<TraitRelation>,
    #[serde(default)]
    pub optional_relations: Vec<TraitRelation>,
    #[serde(default)]
    pub required_traits: Vec<TraitId>,
}

impl RecursiveTrait {
    #[must_use]
    pub fn new(id: TraitId, origin: TraitOrigin) -> Self {
        Self {
            id,
            origin,
            required_attributes: Vec::new(),
            optional_attributes: Vec::new(),
            required_relations: Vec::new(),
            optional_relations: Vec::new(),
            required_traits: Vec::new(),
        }
    }
}

/// A flattened trait: no further trait references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericTrait {
    pub id: TraitId,
    pub origin: TraitOrigin,
    pub required_attributes: Vec<TraitAttribute>,
    pub optional_attributes: Vec<TraitAttribute>,
    pub required_relations: Vec<TraitRelation>,
    pub optional_relations: Vec<TraitRelation>,
    /// Every trait transitively required, in encounter order.
    pub ancestors: Vec<TraitId>,
}

impl GenericTrait {
    /// The trait every CI has.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            id: core_traits::empty_trait_id(),
            origin: TraitOrigin::Core,
            required_attributes: Vec::new(),
            optional_attributes: Vec::new(),
            required_relations: Vec::new(),
            optional_relations: Vec::new(),
            ancestors: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.required_attributes.is_empty()
            && self.optional_attributes.is_empty()
            && self.required_relations.is_empty()
            && self.optional_relations.is_empty()
    }

    /// Underlying names of the required attributes.
    pub fn required_attribute_names(&self) -> impl Iterator<Item = &str> {
        self.required_attributes
            .iter()
            .map(|a| a.template.name.as_str())
    }

    /// Underlying names of every attribute, required first.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.required_attributes
            .iter()
            .chain(&self.optional_attributes)
            .map(|a| a.template.name.as_str())
    }

    /// Look up an attribute by trait-local identifier.
    #[must_use]
    pub fn attribute(&self, identifier: &str) -> Option<&TraitAttribute> {
        self.required_attributes
            .iter()
            .chain(&self.optional_attributes)
            .find(|a| a.identifier == identifier)
    }

    pub fn relations(&self) -> impl Iterator<Item = &TraitRelation> {
        self.required_relations
            .iter()
            .chain(&self.optional_relations)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn template_checks_type_arrayness_and_constraints() {
        let template = TraitAttributeTemplate::scalar("id", AttributeValueType::Text)
            .with(AttributeConstraint::text_min_length(1));
        assert!(template.matches(&AttributeValue::text("x1")));
        assert!(!template.matches(&AttributeValue::text("")));
        assert!(!template.matches(&AttributeValue::Integer(1)));
        assert!(!template.matches(&AttributeValue::text_array(["x"])));
        assert!(!template.matches(&AttributeValue::Mask));
    }

    #[test]
    fn regex_and_array_constraints() {
        let regex = AttributeConstraint::text_regex("^[a-z]+$").unwrap();
        assert!(regex.check(&AttributeValue::text("abc")));
        assert!(!regex.check(&AttributeValue::text("ABC")));
        assert!(!regex.check(&AttributeValue::Integer(3)));

        let arr = AttributeConstraint::array_min_length(2);
        assert!(arr.check(&AttributeValue::text_array(["a", "b"])));
        assert!(!arr.check(&AttributeValue::text_array(["a"])));
        assert!(!arr.check(&AttributeValue::text("a")));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(TextPattern::new("(unclosed").is_err());
        let parsed: Result<TextPattern, _> = serde_json::from_str("\"(\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn constraints_round_trip_through_json() {
        let template = TraitAttributeTemplate::array("tags", AttributeValueType::Text)
            .with(AttributeConstraint::text_regex("^t").unwrap())
            .with(AttributeConstraint::array_min_length(1));
        let json = serde_json::to_string(&template).unwrap();
        let back: TraitAttributeTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, template);
    }

    #[test]
    fn relation_cardinality() {
        let rel = TraitRelation::new(
            "members",
            PredicateId::new("has_member").unwrap(),
            RelationDirection::Forward,
        )
        .cardinality(1, Some(2));
        assert!(!rel.admits(0));
        assert!(rel.admits(2));
        assert!(!rel.admits(3));
    }
}
