//! # History Records
//!
//! The rows of the three append-only ledgers: attribute history, relation
//! history and changesets. Rows are immutable once written; deletion is
//! expressed by appending a `Removed` row (or a mask), never by updating.

use super::{AttributeValue, ChangesetId, CiId, DataOrigin, LayerId, PredicateId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Lifecycle state of a history row.
///
/// Valid paths per key: `New -> Changed* -> Removed -> Renewed -> Changed* -> Removed ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChangeState {
    New,
    Changed,
    Removed,
    Renewed,
}

impl ChangeState {
    #[must_use]
    pub const fn is_removed(self) -> bool {
        matches!(self, Self::Removed)
    }

    /// State of a live row written on top of `previous`.
    #[must_use]
    pub const fn after_insert(previous: Option<Self>) -> Self {
        match previous {
            None => Self::New,
            Some(Self::Removed) => Self::Renewed,
            Some(_) => Self::Changed,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Changed => "changed",
            Self::Removed => "removed",
            Self::Renewed => "renewed",
        }
    }
}

// =============================================================================
// ATTRIBUTES
// =============================================================================

/// Identity of an attribute history: one (CI, name) inside one layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttributeKey {
    pub ci: CiId,
    pub name: String,
    pub layer: LayerId,
}

impl AttributeKey {
    #[must_use]
    pub fn new(ci: CiId, name: impl Into<String>, layer: LayerId) -> Self {
        Self {
            ci,
            name: name.into(),
            layer,
        }
    }
}

/// One row of the attribute history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRecord {
    /// Row identifier.
    pub id: Uuid,
    pub ci: CiId,
    pub name: String,
    pub layer: LayerId,
    /// For `Removed` rows this is the value that was removed.
    pub value: AttributeValue,
    pub state: ChangeState,
    pub changeset: ChangesetId,
    pub timestamp: DateTime<Utc>,
    pub origin: DataOrigin,
}

impl AttributeRecord {
    #[must_use]
    pub fn key(&self) -> AttributeKey {
        AttributeKey::new(self.ci, self.name.clone(), self.layer.clone())
    }

    /// Live rows are neither removed nor masks.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.state.is_removed() && !self.value.is_mask()
    }

    #[must_use]
    pub fn is_mask(&self) -> bool {
        !self.state.is_removed() && self.value.is_mask()
    }
}

// =============================================================================
// RELATIONS
// =============================================================================

/// Identity of a relation across layers: (from, to, predicate).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationKey {
    pub from: CiId,
    pub to: CiId,
    pub predicate: PredicateId,
}

impl RelationKey {
    #[must_use]
    pub fn new(from: CiId, to: CiId, predicate: PredicateId) -> Self {
        Self {
            from,
            to,
            predicate,
        }
    }
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.from, self.predicate, self.to)
    }
}

/// One row of the relation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRecord {
    /// Row identifier.
    pub id: Uuid,
    pub from: CiId,
    pub to: CiId,
    pub predicate: PredicateId,
    pub layer: LayerId,
    pub state: ChangeState,
    /// Marks a precedence-suppression row rather than a real relation.
    pub mask: bool,
    pub changeset: ChangesetId,
    pub timestamp: DateTime<Utc>,
    pub origin: DataOrigin,
}

impl RelationRecord {
    #[must_use]
    pub fn key(&self) -> RelationKey {
        RelationKey::new(self.from, self.to, self.predicate.clone())
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.state.is_removed() && !self.mask
    }

    #[must_use]
    pub fn is_mask(&self) -> bool {
        !self.state.is_removed() && self.mask
    }
}

// =============================================================================
// CHANGESETS
// =============================================================================

/// Audit grouping of all writes of one unit of work to one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: ChangesetId,
    pub user: UserId,
    pub layer: LayerId,
    pub origin: DataOrigin,
    pub timestamp: DateTime<Utc>,
}

/// A history row as indexed by the changeset that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEntry {
    Attribute(AttributeRecord),
    Relation(RelationRecord),
}

// =============================================================================
// TESTS
// =============================================================================
