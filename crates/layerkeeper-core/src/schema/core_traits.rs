//! # Core Traits
//!
//! Traits compiled into the engine. They exist regardless of any data and
//! take precedence over data traits with the same id.

use super::{
    AttributeConstraint, RecursiveTrait, TraitAttribute, TraitAttributeTemplate, TraitOrigin,
};
use crate::primitives::NAME_ATTRIBUTE;
use crate::types::{AttributeValueType, StoreError, TraitId};

/// Id of the trait every CI has.
pub const EMPTY_TRAIT: &str = "empty";
/// Id of the trait of CIs with a non-empty `__name`.
pub const NAMED_TRAIT: &str = "named";
/// Id of the trait of stored trait definitions.
pub const TRAIT_CONFIG_TRAIT: &str = "__meta.config.trait";
/// Id of the trait of stored predicate definitions.
pub const PREDICATE_CONFIG_TRAIT: &str = "__meta.config.predicate";

/// Pattern every stored trait or predicate id must match.
const DOTTED_ID_PATTERN: &str = "^[a-z0-9_.]+$";

fn core_id(id: &'static str) -> TraitId {
    TraitId::from_static(id)
}

#[must_use]
pub fn empty_trait_id() -> TraitId {
    core_id(EMPTY_TRAIT)
}

#[must_use]
pub fn named_trait_id() -> TraitId {
    core_id(NAMED_TRAIT)
}

#[must_use]
pub fn trait_config_trait_id() -> TraitId {
    core_id(TRAIT_CONFIG_TRAIT)
}

#[must_use]
pub fn predicate_config_trait_id() -> TraitId {
    core_id(PREDICATE_CONFIG_TRAIT)
}

fn required_text(identifier: &str, name: &str) -> TraitAttribute {
    TraitAttribute::new(
        identifier,
        TraitAttributeTemplate::scalar(name, AttributeValueType::Text)
            .with(AttributeConstraint::text_min_length(1)),
    )
}

fn optional_name() -> TraitAttribute {
    TraitAttribute::new(
        "name",
        TraitAttributeTemplate::scalar(NAME_ATTRIBUTE, AttributeValueType::Text),
    )
}

/// The built-in trait set.
pub struct CoreTraits;

impl CoreTraits {
    /// Every core trait except `empty`, which is flat by construction.
    pub fn all() -> Result<Vec<RecursiveTrait>, StoreError> {
        Ok(vec![Self::named(), Self::trait_config()?, Self::predicate_config()])
    }

    #[must_use]
    pub fn named() -> RecursiveTrait {
        let mut t = RecursiveTrait::new(named_trait_id(), TraitOrigin::Core);
        t.required_attributes = vec![required_text("name", NAME_ATTRIBUTE)];
        t
    }

    pub fn trait_config() -> Result<RecursiveTrait, StoreError> {
        let json_array = |identifier: &str, name: &str| {
            TraitAttribute::new(
                identifier,
                TraitAttributeTemplate::array(name, AttributeValueType::Json),
            )
        };
        let mut t = RecursiveTrait::new(trait_config_trait_id(), TraitOrigin::Core);
        t.required_attributes = vec![
            TraitAttribute::new(
                "id",
                TraitAttributeTemplate::scalar("trait.id", AttributeValueType::Text)
                    .with(AttributeConstraint::text_min_length(1))
                    .with(AttributeConstraint::text_regex(DOTTED_ID_PATTERN)?),
            ),
            TraitAttribute::new(
                "required_attributes",
                TraitAttributeTemplate::array("trait.required_attributes", AttributeValueType::Json)
                    .with(AttributeConstraint::array_min_length(1)),
            ),
        ];
        t.optional_attributes = vec![
            json_array("optional_attributes", "trait.optional_attributes"),
            json_array("required_relations", "trait.required_relations"),
            json_array("optional_relations", "trait.optional_relations"),
            TraitAttribute::new(
                "required_traits",
                TraitAttributeTemplate::array("trait.required_traits", AttributeValueType::Text),
            ),
            optional_name(),
        ];
        Ok(t)
    }

    #[must_use]
    pub fn predicate_config() -> RecursiveTrait {
        let mut t = RecursiveTrait::new(predicate_config_trait_id(), TraitOrigin::Core);
        t.required_attributes = vec![
            required_text("id", "predicate.id"),
            required_text("wording_from", "predicate.wording_from"),
            required_text("wording_to", "predicate.wording_to"),
        ];
        t.optional_attributes = vec![optional_name()];
        t
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::AttributeValue;

    #[test]
    fn core_ids_are_valid() {
        for id in [EMPTY_TRAIT, NAMED_TRAIT, TRAIT_CONFIG_TRAIT, PREDICATE_CONFIG_TRAIT] {
            assert!(TraitId::new(id).is_ok());
        }
    }

    #[test]
    fn trait_config_checks_id_pattern() {
        let t = CoreTraits::trait_config().unwrap();
        let id = &t.required_attributes[0].template;
        assert!(id.matches(&AttributeValue::text("host.linux")));
        assert!(!id.matches(&AttributeValue::text("Host")));
    }

    #[test]
    fn all_core_traits_are_core_origin() {
        let all = CoreTraits::all().unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|t| t.origin == TraitOrigin::Core));
    }
}
