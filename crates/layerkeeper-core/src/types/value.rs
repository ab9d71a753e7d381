//! # Attribute Values
//!
//! Typed attribute payloads. Every value is either a scalar, a homogeneous
//! array of scalars, or the distinguished `Mask` marker.
//!
//! Value equality drives write deduplication, so JSON payloads are kept in
//! canonical serialized form: two JSON documents that parse to the same tree
//! compare equal.

use super::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The scalar type of an attribute value, independent of array-ness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttributeValueType {
    Text,
    MultilineText,
    Integer,
    Boolean,
    Json,
    Yaml,
    Mask,
}

impl AttributeValueType {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::MultilineText => "multiline_text",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Mask => "mask",
        }
    }

    /// Text-like types participate in length and regex constraints.
    #[must_use]
    pub const fn is_textual(self) -> bool {
        matches!(self, Self::Text | Self::MultilineText)
    }
}

impl fmt::Display for AttributeValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AttributeValueType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "multiline_text" | "multilinetext" => Ok(Self::MultilineText),
            "integer" => Ok(Self::Integer),
            "boolean" => Ok(Self::Boolean),
            "json" => Ok(Self::Json),
            "yaml" => Ok(Self::Yaml),
            "mask" => Ok(Self::Mask),
            other => Err(StoreError::InvalidState(format!(
                "Unknown attribute value type {other:?}"
            ))),
        }
    }
}

/// A typed attribute payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    Text(String),
    MultilineText(String),
    Integer(i64),
    Boolean(bool),
    /// Canonical JSON text.
    Json(String),
    Yaml(String),
    TextArray(Vec<String>),
    MultilineTextArray(Vec<String>),
    IntegerArray(Vec<i64>),
    BooleanArray(Vec<bool>),
    JsonArray(Vec<String>),
    YamlArray(Vec<String>),
    /// Hides values of lower layers without carrying data of its own.
    Mask,
}

impl AttributeValue {
    /// Scalar text value.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Array of text values.
    #[must_use]
    pub fn text_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::TextArray(items.into_iter().map(Into::into).collect())
    }

    /// Scalar JSON value, stored canonicalised.
    pub fn json(value: &serde_json::Value) -> Result<Self, StoreError> {
        Ok(Self::Json(canonical_json(value)?))
    }

    /// Array of JSON values, each stored canonicalised.
    pub fn json_array(values: &[serde_json::Value]) -> Result<Self, StoreError> {
        values
            .iter()
            .map(canonical_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::JsonArray)
    }

    /// Build a value from its type, array-ness and raw string items.
    ///
    /// Scalars take exactly one item. Integers, booleans and JSON are parsed;
    /// the mask type takes no items at all.
    pub fn from_parts(
        value_type: AttributeValueType,
        is_array: bool,
        items: &[String],
    ) -> Result<Self, StoreError> {
        if value_type == AttributeValueType::Mask {
            return if items.is_empty() && !is_array {
                Ok(Self::Mask)
            } else {
                Err(StoreError::InvalidState(
                    "Mask values carry no items".to_string(),
                ))
            };
        }
        if !is_array && items.len() != 1 {
            return Err(StoreError::InvalidState(format!(
                "Scalar value expects exactly one item, got {}",
                items.len()
            )));
        }

        let value = match value_type {
            AttributeValueType::Text => Self::TextArray(items.to_vec()),
            AttributeValueType::MultilineText => Self::MultilineTextArray(items.to_vec()),
            AttributeValueType::Yaml => Self::YamlArray(
                items
                    .iter()
                    .map(|s| {
                        serde_yaml::from_str::<serde_yaml::Value>(s)
                            .map(|_| s.clone())
                            .map_err(|e| StoreError::InvalidState(format!("Not YAML: {e}")))
                    })
                    .collect::<Result<_, _>>()?,
            ),
            AttributeValueType::Integer => Self::IntegerArray(
                items
                    .iter()
                    .map(|s| {
                        s.trim().parse::<i64>().map_err(|_| {
                            StoreError::InvalidState(format!("Not an integer: {s:?}"))
                        })
                    })
                    .collect::<Result<_, _>>()?,
            ),
            AttributeValueType::Boolean => Self::BooleanArray(
                items
                    .iter()
                    .map(|s| match s.trim() {
                        "true" => Ok(true),
                        "false" => Ok(false),
                        other => Err(StoreError::InvalidState(format!(
                            "Not a boolean: {other:?}"
                        ))),
                    })
                    .collect::<Result<_, _>>()?,
            ),
            AttributeValueType::Json => Self::JsonArray(
                items
                    .iter()
                    .map(|s| {
                        serde_json::from_str::<serde_json::Value>(s)
                            .map_err(|e| StoreError::InvalidState(format!("Not JSON: {e}")))
                            .and_then(|v| canonical_json(&v))
                    })
                    .collect::<Result<_, _>>()?,
            ),
            AttributeValueType::Mask => Self::Mask,
        };

        Ok(if is_array { value } else { value.into_scalar() })
    }

    /// Collapse a one-element array into its scalar form.
    fn into_scalar(self) -> Self {
        fn single<T>(mut items: Vec<T>) -> Option<T> {
            if items.len() == 1 { items.pop() } else { None }
        }
        match self {
            Self::TextArray(v) => single(v).map(Self::Text),
            Self::MultilineTextArray(v) => single(v).map(Self::MultilineText),
            Self::IntegerArray(v) => single(v).map(Self::Integer),
            Self::BooleanArray(v) => single(v).map(Self::Boolean),
            Self::JsonArray(v) => single(v).map(Self::Json),
            Self::YamlArray(v) => single(v).map(Self::Yaml),
            other => Some(other),
        }
        .unwrap_or(Self::Mask)
    }

    #[must_use]
    pub const fn value_type(&self) -> AttributeValueType {
        match self {
            Self::Text(_) | Self::TextArray(_) => AttributeValueType::Text,
            Self::MultilineText(_) | Self::MultilineTextArray(_) => {
                AttributeValueType::MultilineText
            }
            Self::Integer(_) | Self::IntegerArray(_) => AttributeValueType::Integer,
            Self::Boolean(_) | Self::BooleanArray(_) => AttributeValueType::Boolean,
            Self::Json(_) | Self::JsonArray(_) => AttributeValueType::Json,
            Self::Yaml(_) | Self::YamlArray(_) => AttributeValueType::Yaml,
            Self::Mask => AttributeValueType::Mask,
        }
    }

    #[must_use]
    pub const fn is_array(&self) -> bool {
        matches!(
            self,
            Self::TextArray(_)
                | Self::MultilineTextArray(_)
                | Self::IntegerArray(_)
                | Self::BooleanArray(_)
                | Self::JsonArray(_)
                | Self::YamlArray(_)
        )
    }

    #[must_use]
    pub const fn is_mask(&self) -> bool {
        matches!(self, Self::Mask)
    }

    /// Number of elements for arrays, `None` for scalars and masks.
    #[must_use]
    pub fn array_len(&self) -> Option<usize> {
        match self {
            Self::TextArray(v)
            | Self::MultilineTextArray(v)
            | Self::JsonArray(v)
            | Self::YamlArray(v) => Some(v.len()),
            Self::IntegerArray(v) => Some(v.len()),
            Self::BooleanArray(v) => Some(v.len()),
            _ => None,
        }
    }

    /// The scalar text of a `Text` or `MultilineText` value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::MultilineText(s) => Some(s),
            _ => None,
        }
    }

    /// The scalar integer of an `Integer` value.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// All text items of a text-like value, scalar or array.
    #[must_use]
    pub fn text_items(&self) -> Option<Vec<&str>> {
        match self {
            Self::Text(s) | Self::MultilineText(s) => Some(vec![s.as_str()]),
            Self::TextArray(v) | Self::MultilineTextArray(v) => {
                Some(v.iter().map(String::as_str).collect())
            }
            _ => None,
        }
    }

    /// Parsed JSON items of a JSON value, scalar or array.
    pub fn json_items(&self) -> Result<Vec<serde_json::Value>, StoreError> {
        let items: Vec<&String> = match self {
            Self::Json(s) => vec![s],
            Self::JsonArray(v) => v.iter().collect(),
            other => {
                return Err(StoreError::InvalidState(format!(
                    "Expected a JSON value, found {}",
                    other.value_type()
                )));
            }
        };
        items
            .into_iter()
            .map(|s| {
                serde_json::from_str(s).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    /// Every item rendered as a string, in order.
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        match self {
            Self::Text(s) | Self::MultilineText(s) | Self::Json(s) | Self::Yaml(s) => {
                vec![s.clone()]
            }
            Self::Integer(i) => vec![i.to_string()],
            Self::Boolean(b) => vec![b.to_string()],
            Self::TextArray(v)
            | Self::MultilineTextArray(v)
            | Self::JsonArray(v)
            | Self::YamlArray(v) => v.clone(),
            Self::IntegerArray(v) => v.iter().map(ToString::to_string).collect(),
            Self::BooleanArray(v) => v.iter().map(ToString::to_string).collect(),
            Self::Mask => Vec::new(),
        }
    }

    /// Approximate payload size in bytes, used for input limits.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Integer(_) | Self::IntegerArray(_) | Self::Boolean(_) | Self::BooleanArray(_) => {
                self.array_len().unwrap_or(1).saturating_mul(8)
            }
            Self::Mask => 0,
            _ => self.to_strings().iter().map(String::len).sum(),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_mask() {
            return f.write_str("<mask>");
        }
        let items = self.to_strings();
        if self.is_array() {
            write!(f, "[{}]", items.join(", "))
        } else {
            f.write_str(items.first().map_or("", String::as_str))
        }
    }
}

fn canonical_json(value: &serde_json::Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn from_parts_builds_scalars_and_arrays() {
        let scalar =
            AttributeValue::from_parts(AttributeValueType::Integer, false, &strings(&["42"]))
                .unwrap();
        assert_eq!(scalar, AttributeValue::Integer(42));

        let array =
            AttributeValue::from_parts(AttributeValueType::Text, true, &strings(&["a", "b"]))
                .unwrap();
        assert_eq!(array, AttributeValue::text_array(["a", "b"]));
        assert_eq!(array.array_len(), Some(2));
        assert!(array.is_array());
    }

    #[test]
    fn from_parts_rejects_bad_input() {
        assert!(
            AttributeValue::from_parts(AttributeValueType::Text, false, &strings(&["a", "b"]))
                .is_err()
        );
        assert!(
            AttributeValue::from_parts(AttributeValueType::Integer, false, &strings(&["x"]))
                .is_err()
        );
        assert!(
            AttributeValue::from_parts(AttributeValueType::Json, false, &strings(&["{"])).is_err()
        );
    }

    #[test]
    fn yaml_items_must_parse() {
        let doc = "key: [a, b]\nother: 1";
        let value =
            AttributeValue::from_parts(AttributeValueType::Yaml, false, &strings(&[doc])).unwrap();
        assert_eq!(value.value_type(), AttributeValueType::Yaml);

        let err = AttributeValue::from_parts(
            AttributeValueType::Yaml,
            true,
            &strings(&["ok: true", "key: [unclosed"]),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(m) if m.starts_with("Not YAML")));
    }

    #[test]
    fn single_item_array_stays_an_array() {
        let value =
            AttributeValue::from_parts(AttributeValueType::Text, true, &strings(&["only"]))
                .unwrap();
        assert_eq!(value, AttributeValue::text_array(["only"]));
    }

    #[test]
    fn json_is_canonicalised_for_equality() {
        let a = AttributeValue::from_parts(
            AttributeValueType::Json,
            false,
            &strings(&["{ \"a\" :  1 }"]),
        )
        .unwrap();
        let b = AttributeValue::json(&json!({"a": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(b.json_items().unwrap(), vec![json!({"a": 1})]);
    }

    #[test]
    fn text_items_cover_scalar_and_array() {
        assert_eq!(AttributeValue::text("x").text_items(), Some(vec!["x"]));
        assert_eq!(
            AttributeValue::text_array(["x", "y"]).text_items(),
            Some(vec!["x", "y"])
        );
        assert_eq!(AttributeValue::Integer(1).text_items(), None);
    }

    #[test]
    fn display_renders_arrays_and_masks() {
        assert_eq!(AttributeValue::text_array(["a", "b"]).to_string(), "[a, b]");
        assert_eq!(AttributeValue::Mask.to_string(), "<mask>");
        assert_eq!(AttributeValue::Boolean(true).to_string(), "true");
    }
}
