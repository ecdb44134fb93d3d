//! # Hypergraph Storage Trait
//!
//! The contract between the session engine and a domain's element store.
//! One storage instance holds one domain. Every operation that observes or
//! changes the graph takes the caller's write set (`Self::Tx`) so that a
//! session sees its own uncommitted writes and nobody else's.
//!
//! ## Implementations
//!
//! | Backend | Module | Description |
//! |---------|--------|-------------|
//! | `MemoryHypergraph` | `memory` | In-memory, committed state + per-tx write sets |

pub mod memory;

use std::sync::Arc;

use crate::model::{EdgeEnds, GraphElement, Identity, PropertyChange, PropertyValue, Value};
use crate::schema::{PropertyDescriptor, SchemaInfo};
use crate::tx::{Transaction, TxId, TxMode};
use crate::Result;

pub use memory::{MemoryHypergraph, MemoryTx};

// ============================================================================
// Relationship query
// ============================================================================

/// Filter for relationship enumeration. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct RelationshipQuery {
    /// Only relationships whose schema `is_a` this one.
    pub schema: Option<Arc<SchemaInfo>>,
    pub start: Option<Identity>,
    pub end: Option<Identity>,
    /// Number of leading results to drop.
    pub skip: usize,
}

impl RelationshipQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schema(mut self, schema: Arc<SchemaInfo>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn start(mut self, start: Identity) -> Self {
        self.start = Some(start);
        self
    }

    pub fn end(mut self, end: Identity) -> Self {
        self.end = Some(end);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub(crate) fn matches(&self, record: &GraphElement) -> bool {
        let Some(ends) = &record.ends else {
            return false;
        };
        self.schema.as_ref().is_none_or(|s| record.schema.is_a(s))
            && self.start.as_ref().is_none_or(|s| &ends.start == s)
            && self.end.as_ref().is_none_or(|e| &ends.end == e)
    }
}

// ============================================================================
// HypergraphStorage Trait
// ============================================================================

/// Element and property store for one domain.
///
/// Reads take `Option<&Self::Tx>`: `None` reads the committed state only.
/// Mutations are buffered in the write set until `commit_tx`.
pub trait HypergraphStorage: Send + Sync + 'static {
    /// The write-set type for this backend.
    type Tx: Transaction;

    /// Open an empty storage for `domain`.
    fn create(domain: &str) -> Result<Self>
    where
        Self: Sized;

    fn domain(&self) -> &str;

    // ========================================================================
    // Transactions
    // ========================================================================

    fn begin_tx(&self, id: TxId, mode: TxMode) -> Result<Self::Tx>;

    /// Apply the write set to the committed state atomically.
    fn commit_tx(&self, tx: Self::Tx) -> Result<()>;

    /// Discard the write set.
    fn rollback_tx(&self, tx: Self::Tx) -> Result<()>;

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Add an entity. `DuplicateElement` if the identity is already in use.
    fn add_entity(
        &self,
        tx: &mut Self::Tx,
        id: Identity,
        schema: Arc<SchemaInfo>,
    ) -> Result<GraphElement>;

    /// Add a relationship, validating both ends and the schema's cardinality.
    ///
    /// The start must exist in this storage. The end is checked only when it
    /// lives in the same domain; otherwise `ends.end_schema` is trusted.
    fn add_relationship(
        &self,
        tx: &mut Self::Tx,
        id: Identity,
        schema: Arc<SchemaInfo>,
        ends: EdgeEnds,
    ) -> Result<GraphElement>;

    /// Remove an entity that has no incident relationships left.
    fn remove_entity(
        &self,
        tx: &mut Self::Tx,
        id: &Identity,
        throw_if_not_exists: bool,
    ) -> Result<Option<GraphElement>>;

    fn remove_relationship(
        &self,
        tx: &mut Self::Tx,
        id: &Identity,
        throw_if_not_exists: bool,
    ) -> Result<Option<GraphElement>>;

    /// Write `value` with version current+1. `VersionConflict` if
    /// `expected_version` is given and differs from the current version.
    fn set_property_value(
        &self,
        tx: &mut Self::Tx,
        owner: &Identity,
        property: &PropertyDescriptor,
        value: Value,
        expected_version: Option<u64>,
    ) -> Result<PropertyChange>;

    // ========================================================================
    // Reads
    // ========================================================================

    fn get_element(&self, tx: Option<&Self::Tx>, id: &Identity) -> Result<Option<GraphElement>>;

    /// Stored value, or the version-0 default sentinel when never set.
    /// `InvalidReference` if the owner does not exist.
    fn get_property_value(
        &self,
        tx: Option<&Self::Tx>,
        owner: &Identity,
        property: &PropertyDescriptor,
    ) -> Result<PropertyValue>;

    /// Elements (entities and relationships) whose schema `is_a` the filter,
    /// in creation order.
    fn get_elements(
        &self,
        tx: Option<&Self::Tx>,
        schema: Option<&SchemaInfo>,
        skip: usize,
    ) -> Result<Vec<GraphElement>>;

    /// Relationships matching `query`, in creation order.
    fn get_relationships(
        &self,
        tx: Option<&Self::Tx>,
        query: &RelationshipQuery,
    ) -> Result<Vec<GraphElement>>;

    // ========================================================================
    // Introspection
    // ========================================================================

    fn element_count(&self, tx: Option<&Self::Tx>) -> usize;

    fn relationship_count(&self, tx: Option<&Self::Tx>) -> usize;

    fn contains(&self, tx: Option<&Self::Tx>, id: &Identity) -> bool {
        matches!(self.get_element(tx, id), Ok(Some(_)))
    }
}
