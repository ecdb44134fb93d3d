//! # Schema
//!
//! Type descriptors for entities and relationships. A `Schema` is a named
//! namespace of `SchemaInfo` descriptors, compiled once from a
//! `SchemaDefinition` and immutable afterwards.
//!
//! The core only needs three things from a schema: type lookup,
//! relationship cardinality, and `is_a`.

pub mod definition;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{Identity, Value};

pub use definition::{
    EntityDefinition, PropertyDefinition, RelationshipDefinition, SchemaBuilder, SchemaDefinition,
};
pub use registry::SchemaRegistry;

// ============================================================================
// Cardinality
// ============================================================================

/// Multiplicity constraint on a relationship schema.
///
/// Enforced when a relationship is added:
/// - `OneToOne` and `ManyToOne` allow one relationship of the schema into any end.
/// - `OneToOne` and `OneToMany` allow one relationship of the schema out of any start.
/// - `ManyToMany` is unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Cardinality {
    /// At most one relationship of this schema may leave a start.
    pub fn single_start(self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::OneToMany)
    }

    /// At most one relationship of this schema may enter an end.
    pub fn single_end(self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::ManyToOne)
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// A declared property and its default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub default: Value,
}

/// Relationship-only part of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipSpec {
    pub start: Identity,
    pub end: Identity,
    pub cardinality: Cardinality,
    /// The end is owned by the start and is removed with it.
    pub embedded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaKind {
    Entity,
    Relationship(RelationshipSpec),
}

/// Type descriptor for one entity or relationship kind.
#[derive(Debug)]
pub struct SchemaInfo {
    id: Identity,
    kind: SchemaKind,
    supertype: Option<Arc<SchemaInfo>>,
    properties: Vec<PropertyDescriptor>,
    cached: bool,
}

impl SchemaInfo {
    pub(crate) fn new(
        id: Identity,
        kind: SchemaKind,
        supertype: Option<Arc<SchemaInfo>>,
        properties: Vec<PropertyDescriptor>,
        cached: bool,
    ) -> Self {
        Self { id, kind, supertype, properties, cached }
    }

    /// `schema:Name`
    pub fn id(&self) -> &Identity {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.key()
    }

    pub fn kind(&self) -> &SchemaKind {
        &self.kind
    }

    pub fn supertype(&self) -> Option<&Arc<SchemaInfo>> {
        self.supertype.as_ref()
    }

    pub fn is_entity(&self) -> bool {
        matches!(self.kind, SchemaKind::Entity)
    }

    pub fn relationship(&self) -> Option<&RelationshipSpec> {
        match &self.kind {
            SchemaKind::Relationship(spec) => Some(spec),
            SchemaKind::Entity => None,
        }
    }

    /// False when elements of this type must bypass the L1 cache.
    pub fn cached(&self) -> bool {
        self.cached
    }

    pub fn is_a(&self, other: &SchemaInfo) -> bool {
        self.is_a_id(other.id())
    }

    /// Walk the supertype chain looking for `id`.
    pub fn is_a_id(&self, id: &Identity) -> bool {
        let mut current = Some(self);
        while let Some(schema) = current {
            if &schema.id == id {
                return true;
            }
            current = schema.supertype.as_deref();
        }
        false
    }

    /// Look a property up on this type, then on its supertypes.
    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .or_else(|| self.supertype.as_deref().and_then(|s| s.property(name)))
    }

    /// Properties declared directly on this type.
    pub fn declared_properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }
}

// ============================================================================
// Schema
// ============================================================================

/// A compiled, immutable namespace of descriptors.
#[derive(Debug)]
pub struct Schema {
    name: String,
    elements: Vec<Arc<SchemaInfo>>,
    index: HashMap<String, usize>,
}

impl Schema {
    pub(crate) fn new(name: String, elements: Vec<Arc<SchemaInfo>>) -> Self {
        let index = elements
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name().to_string(), i))
            .collect();
        Self { name, elements, index }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a descriptor by its local name.
    pub fn get(&self, name: &str) -> Option<Arc<SchemaInfo>> {
        self.index.get(name).map(|&i| self.elements[i].clone())
    }

    pub fn elements(&self) -> impl Iterator<Item = &Arc<SchemaInfo>> {
        self.elements.iter()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}
