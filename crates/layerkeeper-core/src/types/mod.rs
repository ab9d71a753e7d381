//! # Core Type Definitions
//!
//! This module contains the vocabulary shared by every layerkeeper model:
//! - Identifiers (`CiId`, `LayerId`, `PredicateId`, `TraitId`, `ChangesetId`, `UserId`)
//! - Point-in-time reads (`TimeThreshold`)
//! - Provenance (`DataOrigin`)
//! - Attribute values (`value` submodule)
//! - Persisted history rows (`records` submodule)
//! - Error types (`StoreError`)
//!
//! ## Determinism Guarantees
//!
//! All identifiers implement `Ord` so they can key `BTreeMap`/`BTreeSet`,
//! and timestamps are compared at microsecond resolution, the resolution
//! at which they are persisted.

pub mod records;
pub mod value;

pub use records::{
    AttributeKey, AttributeRecord, ChangeState, Changeset, LedgerEntry, RelationKey,
    RelationRecord,
};
pub use value::{AttributeValue, AttributeValueType};

use crate::primitives::{is_valid_dotted_id, is_valid_layer_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// CI IDENTIFIER
// =============================================================================

/// Opaque identifier of a configuration item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CiId(pub Uuid);

impl CiId {
    /// Allocate a fresh random identifier.
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic identifier for an item known under `key` in an external system.
    ///
    /// Reconciliation jobs use this to create the same CI on every run.
    #[must_use]
    pub fn from_external(system: &str, key: &str) -> Self {
        let name = format!("{system}:{key}");
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0.as_u128()
    }
}

impl fmt::Display for CiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for CiId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| StoreError::InvalidId {
                kind: "ci",
                id: s.to_string(),
            })
    }
}

// =============================================================================
// STRING IDENTIFIERS
// =============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $check:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap an identifier.
            pub fn new(id: impl Into<String>) -> Result<Self, StoreError> {
                let id = id.into();
                if $check(&id) {
                    Ok(Self(id))
                } else {
                    Err(StoreError::InvalidId { kind: $kind, id })
                }
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = StoreError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of a layer. Lowercase letters, digits and `_`.
    LayerId,
    "layer",
    is_valid_layer_id
);

string_id!(
    /// Identifier of a relation predicate, e.g. `has_member`.
    PredicateId,
    "predicate",
    is_valid_dotted_id
);

string_id!(
    /// Identifier of a trait, e.g. `host` or `__meta.config.trait`.
    TraitId,
    "trait",
    is_valid_dotted_id
);

impl TraitId {
    /// Wrap a compiled-in id without validation.
    pub(crate) fn from_static(id: &'static str) -> Self {
        debug_assert!(is_valid_dotted_id(id));
        Self(id.to_string())
    }
}

/// Identifier of a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangesetId(pub Uuid);

impl ChangesetId {
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0.as_u128()
    }
}

impl fmt::Display for ChangesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ChangesetId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| StoreError::InvalidId {
                kind: "changeset",
                id: s.to_string(),
            })
    }
}

/// The user on whose behalf a unit of work writes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// TIME THRESHOLD
// =============================================================================

/// The as-of time of a read.
///
/// `Latest` is unbounded and sees every record visible to the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeThreshold {
    #[default]
    Latest,
    AsOf(DateTime<Utc>),
}

impl TimeThreshold {
    #[must_use]
    pub const fn latest() -> Self {
        Self::Latest
    }

    #[must_use]
    pub const fn at(time: DateTime<Utc>) -> Self {
        Self::AsOf(time)
    }

    #[must_use]
    pub const fn is_latest(&self) -> bool {
        matches!(self, Self::Latest)
    }

    /// Upper bound in microseconds since the epoch (inclusive).
    #[must_use]
    pub fn bound_micros(&self) -> i64 {
        match self {
            Self::Latest => i64::MAX,
            Self::AsOf(t) => t.timestamp_micros(),
        }
    }

    /// Whether a record written at `timestamp` is visible at this threshold.
    #[must_use]
    pub fn admits(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp.timestamp_micros() <= self.bound_micros()
    }
}

// =============================================================================
// DATA ORIGIN
// =============================================================================

/// Where a written record came from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum DataOrigin {
    /// Written by a user through the API or CLI.
    #[default]
    Manual,
    /// Bulk loaded from an external source.
    InboundIngest,
    /// Mirrored from an online external system.
    InboundOnline,
    /// Produced by a compute layer.
    ComputeLayer,
    /// Produced by a generator.
    Generator,
}

impl DataOrigin {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::InboundIngest => "inbound_ingest",
            Self::InboundOnline => "inbound_online",
            Self::ComputeLayer => "compute_layer",
            Self::Generator => "generator",
        }
    }
}

impl FromStr for DataOrigin {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "inbound_ingest" => Ok(Self::InboundIngest),
            "inbound_online" => Ok(Self::InboundOnline),
            "compute_layer" => Ok(Self::ComputeLayer),
            "generator" => Ok(Self::Generator),
            other => Err(StoreError::InvalidId {
                kind: "data origin",
                id: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in layerkeeper.
///
/// - No silent failures
/// - Hard errors abort the unit of work; nothing partial is ever committed
/// - Trait mismatches are not errors: they surface as `None`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation conflicts with a business rule or the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An identifier does not satisfy its syntax rules.
    #[error("Invalid {kind} id: {id:?}")]
    InvalidId { kind: &'static str, id: String },

    /// A typed config record no longer satisfies its trait after a write.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Recursive trait composition loops back on itself.
    #[error("Trait cycle: {}", format_cycle(.0))]
    TraitCycle(Vec<TraitId>),

    /// The backing store failed. Never retried inside the core.
    #[error("Transient store failure: {0}")]
    TransientStore(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn format_cycle(path: &[TraitId]) -> String {
    path.iter()
        .map(TraitId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

// =============================================================================
// TESTS
// =============================================================================
