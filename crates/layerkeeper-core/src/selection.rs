//! # Selection Algebra
//!
//! Closed value types expressing "which CIs / attribute names / predicates /
//! traits" and "which relations". Every selection is immutable and composes
//! through `union`, `intersect` and `except`.
//!
//! Constructors normalise: `specific([])` is `None` and `all_except([])` is
//! `All`, so structurally different spellings of the same set compare equal.

use crate::types::{CiId, PredicateId, RelationKey, TraitId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// =============================================================================
// ID SELECTION
// =============================================================================

/// A possibly infinite set of identifiers.
///
/// Deserialization goes through the normalising constructors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "SelectionRepr<T>",
    bound(deserialize = "T: Ord + Clone + Deserialize<'de>")
)]
pub enum Selection<T: Ord> {
    All,
    Specific(BTreeSet<T>),
    AllExcept(BTreeSet<T>),
    None,
}

/// Wire shape of [`Selection`].
#[derive(Deserialize)]
#[serde(rename = "Selection")]
enum SelectionRepr<T: Ord> {
    All,
    Specific(BTreeSet<T>),
    AllExcept(BTreeSet<T>),
    None,
}

impl<T: Ord + Clone> From<SelectionRepr<T>> for Selection<T> {
    fn from(repr: SelectionRepr<T>) -> Self {
        match repr {
            SelectionRepr::All => Self::All,
            SelectionRepr::None => Self::None,
            SelectionRepr::Specific(set) => Self::specific(set),
            SelectionRepr::AllExcept(set) => Self::all_except(set),
        }
    }
}

/// Which CIs.
pub type CiSelection = Selection<CiId>;
/// Which attribute names.
pub type AttributeSelection = Selection<String>;
/// Which relation predicates.
pub type PredicateSelection = Selection<PredicateId>;
/// Which traits.
pub type TraitSelection = Selection<TraitId>;

impl<T: Ord + Clone> Selection<T> {
    #[must_use]
    pub const fn all() -> Self {
        Self::All
    }

    #[must_use]
    pub const fn none() -> Self {
        Self::None
    }

    /// Exactly the given items. An empty set selects nothing.
    #[must_use]
    pub fn specific(items: impl IntoIterator<Item = T>) -> Self {
        let set: BTreeSet<T> = items.into_iter().collect();
        if set.is_empty() {
            Self::None
        } else {
            Self::Specific(set)
        }
    }

    /// Everything but the given items. An empty set selects everything.
    #[must_use]
    pub fn all_except(items: impl IntoIterator<Item = T>) -> Self {
        let set: BTreeSet<T> = items.into_iter().collect();
        if set.is_empty() {
            Self::All
        } else {
            Self::AllExcept(set)
        }
    }

    #[must_use]
    pub fn contains(&self, item: &T) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Specific(set) => set.contains(item),
            Self::AllExcept(set) => !set.contains(item),
        }
    }

    #[must_use]
    pub const fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// The finite item set, if this selection is finite.
    #[must_use]
    pub const fn as_specific(&self) -> Option<&BTreeSet<T>> {
        match self {
            Self::Specific(set) => Some(set),
            _ => None,
        }
    }

    /// Materialise against a known universe of items.
    #[must_use]
    pub fn resolve(&self, universe: &BTreeSet<T>) -> BTreeSet<T> {
        match self {
            Self::All => universe.clone(),
            Self::None => BTreeSet::new(),
            Self::Specific(set) => set.clone(),
            Self::AllExcept(set) => universe.difference(set).cloned().collect(),
        }
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => Self::All,
            (Self::None, x) | (x, Self::None) => x.clone(),
            (Self::Specific(a), Self::Specific(b)) => Self::specific(a.union(b).cloned()),
            (Self::Specific(a), Self::AllExcept(b)) | (Self::AllExcept(b), Self::Specific(a)) => {
                Self::all_except(b.difference(a).cloned())
            }
            (Self::AllExcept(a), Self::AllExcept(b)) => {
                Self::all_except(a.intersection(b).cloned())
            }
        }
    }

    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::None, _) | (_, Self::None) => Self::None,
            (Self::All, x) | (x, Self::All) => x.clone(),
            (Self::Specific(a), Self::Specific(b)) => Self::specific(a.intersection(b).cloned()),
            (Self::Specific(a), Self::AllExcept(b)) | (Self::AllExcept(b), Self::Specific(a)) => {
                Self::specific(a.difference(b).cloned())
            }
            (Self::AllExcept(a), Self::AllExcept(b)) => Self::all_except(a.union(b).cloned()),
        }
    }

    /// Items in `self` but not in `other`.
    #[must_use]
    pub fn except(&self, other: &Self) -> Self {
        match (self, other) {
            (_, Self::All) | (Self::None, _) => Self::None,
            (x, Self::None) => x.clone(),
            (Self::All, Self::Specific(b)) => Self::all_except(b.iter().cloned()),
            (Self::All, Self::AllExcept(b)) => Self::specific(b.iter().cloned()),
            (Self::Specific(a), Self::Specific(b)) => Self::specific(a.difference(b).cloned()),
            (Self::Specific(a), Self::AllExcept(b)) => Self::specific(a.intersection(b).cloned()),
            (Self::AllExcept(a), Self::Specific(b)) => Self::all_except(a.union(b).cloned()),
            (Self::AllExcept(a), Self::AllExcept(b)) => Self::specific(b.difference(a).cloned()),
        }
    }
}

impl<T: Ord + Clone> Default for Selection<T> {
    fn default() -> Self {
        Self::All
    }
}

// =============================================================================
// RELATION SELECTION
// =============================================================================

/// Which relations, by endpoint and predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationSelection {
    All,
    None,
    /// Relations whose source CI is selected.
    From(CiSelection),
    /// Relations whose target CI is selected.
    To(CiSelection),
    /// Relations with either endpoint selected.
    EitherFromOrTo(CiSelection),
    WithPredicate(PredicateSelection),
    Specific(BTreeSet<RelationKey>),
    Union(Vec<RelationSelection>),
    Intersect(Vec<RelationSelection>),
    Except(Box<RelationSelection>, Box<RelationSelection>),
}

impl RelationSelection {
    #[must_use]
    pub fn from_cis(cis: impl IntoIterator<Item = CiId>) -> Self {
        Self::From(CiSelection::specific(cis))
    }

    #[must_use]
    pub fn to_cis(cis: impl IntoIterator<Item = CiId>) -> Self {
        Self::To(CiSelection::specific(cis))
    }

    #[must_use]
    pub fn either(cis: impl IntoIterator<Item = CiId>) -> Self {
        Self::EitherFromOrTo(CiSelection::specific(cis))
    }

    #[must_use]
    pub fn with_predicates(predicates: impl IntoIterator<Item = PredicateId>) -> Self {
        Self::WithPredicate(PredicateSelection::specific(predicates))
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => Self::All,
            (Self::None, x) | (x, Self::None) => x,
            (Self::Union(mut a), Self::Union(b)) => {
                a.extend(b);
                Self::Union(a)
            }
            (Self::Union(mut a), x) | (x, Self::Union(mut a)) => {
                a.push(x);
                Self::Union(a)
            }
            (a, b) => Self::Union(vec![a, b]),
        }
    }

    #[must_use]
    pub fn intersect(self, other: Self) -> Self {
        match (self, other) {
            (Self::None, _) | (_, Self::None) => Self::None,
            (Self::All, x) | (x, Self::All) => x,
            (Self::Intersect(mut a), Self::Intersect(b)) => {
                a.extend(b);
                Self::Intersect(a)
            }
            (Self::Intersect(mut a), x) | (x, Self::Intersect(mut a)) => {
                a.push(x);
                Self::Intersect(a)
            }
            (a, b) => Self::Intersect(vec![a, b]),
        }
    }

    #[must_use]
    pub fn except(self, other: Self) -> Self {
        match (self, other) {
            (_, Self::All) | (Self::None, _) => Self::None,
            (x, Self::None) => x,
            (a, b) => Self::Except(Box::new(a), Box::new(b)),
        }
    }

    /// Whether the relation identified by `key` is selected.
    #[must_use]
    pub fn matches(&self, key: &RelationKey) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::From(cis) => cis.contains(&key.from),
            Self::To(cis) => cis.contains(&key.to),
            Self::EitherFromOrTo(cis) => cis.contains(&key.from) || cis.contains(&key.to),
            Self::WithPredicate(predicates) => predicates.contains(&key.predicate),
            Self::Specific(keys) => keys.contains(key),
            Self::Union(parts) => parts.iter().any(|p| p.matches(key)),
            Self::Intersect(parts) => parts.iter().all(|p| p.matches(key)),
            Self::Except(a, b) => a.matches(key) && !b.matches(key),
        }
    }

    /// A finite superset of the selected source CIs, when one is known.
    ///
    /// Storage backends use this to range-scan by source instead of
    /// scanning a whole layer.
    #[must_use]
    pub fn source_hint(&self) -> Option<BTreeSet<CiId>> {
        match self {
            Self::None => Some(BTreeSet::new()),
            Self::From(cis) => cis.as_specific().cloned(),
            Self::Specific(keys) => Some(keys.iter().map(|k| k.from).collect()),
            Self::Intersect(parts) => parts
                .iter()
                .filter_map(Self::source_hint)
                .reduce(|a, b| a.intersection(&b).copied().collect()),
            Self::Union(parts) => parts
                .iter()
                .map(Self::source_hint)
                .collect::<Option<Vec<_>>>()
                .map(|sets| sets.into_iter().flatten().collect()),
            Self::Except(a, _) => a.source_hint(),
            _ => None,
        }
    }
}

impl Default for RelationSelection {
    fn default() -> Self {
        Self::All
    }
}

// =============================================================================
// TESTS
// =============================================================================
