//! # layerkeeper-core
//!
//! The temporal, layered configuration-management engine of layerkeeper.
//!
//! Configuration items (CIs) carry attributes and relations whose visible
//! value depends on the ordered set of layers a caller reads through. What
//! a CI *is* (a host, a team, a predicate definition) is computed from that
//! merged data by evaluating traits, never stored.
//!
//! ## Layout
//!
//! - `types`, `primitives`, `selection`: identifiers, values, records, limits
//!   and the selection algebra
//! - `storage`, `session`: the store seam, the memory and redb backends, and
//!   units of work
//! - `attribute`, `relation`, `changeset`, `ci`, `layer`: the append-only
//!   ledgers and their registries
//! - `merge`, `policy`: layer-precedence merge and write policies
//! - `schema`, `effective`: trait templates, flattening and evaluation
//! - `record`, `predicate`, `trait_store`: config records stored as traits
//! - `export`: deterministic layer export and import
//!
//! ## Architectural Constraints
//!
//! - Synchronous: no async, no network dependencies
//! - Deterministic: BTreeMap only, no floats
//! - Append-only: history rows are never rewritten
//! - Never installs a tracing subscriber; the binary does

// =============================================================================
// MODULES
// =============================================================================

pub mod attribute;
pub mod changeset;
pub mod ci;
pub mod effective;
pub mod export;
pub mod layer;
pub mod merge;
pub mod policy;
pub mod predicate;
pub mod primitives;
pub mod record;
pub mod relation;
pub mod schema;
pub mod selection;
pub mod session;
pub mod storage;
pub mod trait_store;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{
    AttributeKey, AttributeRecord, AttributeValue, AttributeValueType, ChangeState, Changeset,
    ChangesetId, CiId, DataOrigin, LayerId, LedgerEntry, PredicateId, RelationKey,
    RelationRecord, StoreError, TimeThreshold, TraitId, UserId,
};

// =============================================================================
// RE-EXPORTS: Store and Models
// =============================================================================

pub use attribute::{AttributeBulkScope, AttributeFragment, AttributeModel, BulkOutcome};
pub use changeset::{ChangesetData, ChangesetModel};
pub use ci::CiModel;
pub use layer::{Layer, LayerModel, LayerSet, LayerStatistics};
pub use relation::{RelationBulkScope, RelationModel};
pub use selection::{
    AttributeSelection, CiSelection, PredicateSelection, RelationSelection, Selection,
    TraitSelection,
};
pub use session::{ReadView, Session, StorageBackend, UnitOfWork};
pub use storage::{MemoryStore, RecordReader, RecordWriter, RedbStore};

// =============================================================================
// RE-EXPORTS: Merge and Traits
// =============================================================================

pub use effective::{EffectiveTrait, EffectiveTraitEngine};
pub use merge::{
    MaskHandlingForRetrieval, MergeEngine, MergedAttribute, MergedCi, MergedRelation,
};
pub use policy::{
    BulkWritePolicy, LayeredWriter, MaskHandlingForRemoval, OtherLayersValueHandling,
    PolicyOutcome,
};
pub use predicate::{Predicate, PredicateModel};
pub use record::{MetaConfiguration, RecordModel, RecordWrite, StoredRecord, TraitRecord};
pub use schema::{
    AttributeConstraint, GenericTrait, RecursiveTrait, RelationDirection, TraitAttribute,
    TraitAttributeTemplate, TraitOrigin, TraitRelation,
};
pub use trait_store::{ActiveTraits, TraitDefinition, TraitDefinitionModel, TraitsProvider};

// =============================================================================
// RE-EXPORTS: Export
// =============================================================================

pub use export::{ImportOutcome, LayerExport, decode_export, export_layer, import_layer};
