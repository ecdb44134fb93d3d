//! Schema definitions and their compilation into descriptors.
//!
//! A `SchemaDefinition` is plain data (deserializable from JSON); compiling
//! it resolves supertypes and relationship ends, locally first and then
//! against an optional registry of already-loaded schemas.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    Cardinality, PropertyDescriptor, RelationshipSpec, Schema, SchemaInfo, SchemaKind,
    SchemaRegistry,
};
use crate::model::{Identity, Value};
use crate::{Error, Result};

fn cached_by_default() -> bool {
    true
}

// ============================================================================
// Definition DTOs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub name: String,
    #[serde(default)]
    pub default: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub name: String,
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
    #[serde(default = "cached_by_default")]
    pub cached: bool,
}

impl EntityDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), extends: None, properties: Vec::new(), cached: true }
    }

    pub fn extends(mut self, supertype: impl Into<String>) -> Self {
        self.extends = Some(supertype.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, default: impl Into<serde_json::Value>) -> Self {
        self.properties.push(PropertyDefinition { name: name.into(), default: default.into() });
        self
    }

    /// Elements of this type bypass the L1 cache.
    pub fn uncached(mut self) -> Self {
        self.cached = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDefinition {
    pub name: String,
    pub start: String,
    pub end: String,
    pub cardinality: Cardinality,
    #[serde(default)]
    pub embedded: bool,
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
    #[serde(default = "cached_by_default")]
    pub cached: bool,
}

impl RelationshipDefinition {
    pub fn new(
        name: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            name: name.into(),
            start: start.into(),
            end: end.into(),
            cardinality,
            embedded: false,
            extends: None,
            properties: Vec::new(),
            cached: true,
        }
    }

    pub fn embedded(mut self) -> Self {
        self.embedded = true;
        self
    }

    pub fn extends(mut self, supertype: impl Into<String>) -> Self {
        self.extends = Some(supertype.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, default: impl Into<serde_json::Value>) -> Self {
        self.properties.push(PropertyDefinition { name: name.into(), default: default.into() });
        self
    }

    pub fn uncached(mut self) -> Self {
        self.cached = false;
        self
    }
}

/// Serializable description of one schema.
///
/// ```json
/// {
///   "name": "lib",
///   "entities": [{ "name": "Book", "properties": [{ "name": "Title", "default": "" }] }],
///   "relationships": [{ "name": "LibraryHasBooks", "start": "Library", "end": "Book",
///                       "cardinality": "OneToMany", "embedded": true }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDefinition>,
}

impl SchemaDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), entities: Vec::new(), relationships: Vec::new() }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Normalized namespace (schema names are case-insensitive like domains).
    pub fn namespace(&self) -> String {
        self.name.to_lowercase()
    }

    /// Resolve every descriptor. `registry` supplies types referenced with a
    /// qualified `schema:Name` from other, already-loaded schemas.
    pub fn compile(&self, registry: Option<&SchemaRegistry>) -> Result<Schema> {
        Compiler::new(self, registry)?.run()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Fluent construction of a `SchemaDefinition`.
///
/// ```rust
/// use hyperstore::schema::{Cardinality, SchemaBuilder};
///
/// let definition = SchemaBuilder::new("lib")
///     .entity("Library", |e| e.property("Name", ""))
///     .entity("Book", |e| e.property("Title", ""))
///     .relationship("LibraryHasBooks", "Library", "Book", Cardinality::OneToMany, |r| r.embedded())
///     .build();
/// assert_eq!(definition.entities.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    definition: SchemaDefinition,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { definition: SchemaDefinition::new(name) }
    }

    pub fn entity(
        mut self,
        name: impl Into<String>,
        f: impl FnOnce(EntityDefinition) -> EntityDefinition,
    ) -> Self {
        self.definition.entities.push(f(EntityDefinition::new(name)));
        self
    }

    pub fn relationship(
        mut self,
        name: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
        cardinality: Cardinality,
        f: impl FnOnce(RelationshipDefinition) -> RelationshipDefinition,
    ) -> Self {
        let def = RelationshipDefinition::new(name, start, end, cardinality);
        self.definition.relationships.push(f(def));
        self
    }

    pub fn build(self) -> SchemaDefinition {
        self.definition
    }

    pub fn compile(self, registry: Option<&SchemaRegistry>) -> Result<Schema> {
        self.definition.compile(registry)
    }
}

// ============================================================================
// Compiler
// ============================================================================

#[derive(Clone, Copy)]
enum Def<'d> {
    Entity(&'d EntityDefinition),
    Relationship(&'d RelationshipDefinition),
}

impl<'d> Def<'d> {
    fn extends(&self) -> Option<&'d str> {
        match self {
            Def::Entity(e) => e.extends.as_deref(),
            Def::Relationship(r) => r.extends.as_deref(),
        }
    }

    fn properties(&self) -> &'d [PropertyDefinition] {
        match self {
            Def::Entity(e) => &e.properties,
            Def::Relationship(r) => &r.properties,
        }
    }

    fn cached(&self) -> bool {
        match self {
            Def::Entity(e) => e.cached,
            Def::Relationship(r) => r.cached,
        }
    }

    fn is_entity(&self) -> bool {
        matches!(self, Def::Entity(_))
    }
}

struct Compiler<'d> {
    namespace: String,
    registry: Option<&'d SchemaRegistry>,
    defs: HashMap<&'d str, Def<'d>>,
    order: Vec<&'d str>,
    compiled: HashMap<&'d str, Arc<SchemaInfo>>,
    visiting: HashSet<&'d str>,
}

impl<'d> Compiler<'d> {
    fn new(definition: &'d SchemaDefinition, registry: Option<&'d SchemaRegistry>) -> Result<Self> {
        if definition.name.is_empty() || definition.name.contains(':') {
            return Err(Error::ConstraintViolation(format!(
                "invalid schema name '{}'",
                definition.name
            )));
        }

        let mut defs = HashMap::new();
        let mut order = Vec::new();
        let all = definition
            .entities
            .iter()
            .map(|e| (e.name.as_str(), Def::Entity(e)))
            .chain(definition.relationships.iter().map(|r| (r.name.as_str(), Def::Relationship(r))));
        for (name, def) in all {
            if defs.insert(name, def).is_some() {
                return Err(Error::ConstraintViolation(format!(
                    "duplicate schema element '{}:{name}'",
                    definition.namespace()
                )));
            }
            order.push(name);
        }

        Ok(Self {
            namespace: definition.namespace(),
            registry,
            defs,
            order,
            compiled: HashMap::new(),
            visiting: HashSet::new(),
        })
    }

    fn run(mut self) -> Result<Schema> {
        let order = self.order.clone();
        let mut elements = Vec::with_capacity(order.len());
        for name in order {
            elements.push(self.compile_one(name)?);
        }
        Ok(Schema::new(self.namespace, elements))
    }

    fn compile_one(&mut self, name: &'d str) -> Result<Arc<SchemaInfo>> {
        if let Some(done) = self.compiled.get(name) {
            return Ok(done.clone());
        }
        let def = *self.defs.get(name).ok_or_else(|| {
            Error::MetadataNotFound(format!("{}:{name}", self.namespace))
        })?;
        if !self.visiting.insert(name) {
            return Err(Error::ConstraintViolation(format!(
                "circular supertype chain at '{}:{name}'",
                self.namespace
            )));
        }

        let supertype = match def.extends() {
            Some(parent) => Some(self.resolve_type(parent)?),
            None => None,
        };
        if let Some(parent) = &supertype {
            if parent.is_entity() != def.is_entity() {
                return Err(Error::SchemaMismatch {
                    expected: if def.is_entity() { "entity supertype" } else { "relationship supertype" }.into(),
                    got: parent.id().to_string(),
                });
            }
        }

        let kind = match def {
            Def::Entity(_) => SchemaKind::Entity,
            Def::Relationship(r) => SchemaKind::Relationship(RelationshipSpec {
                start: self.resolve_reference(&r.start)?,
                end: self.resolve_reference(&r.end)?,
                cardinality: r.cardinality,
                embedded: r.embedded,
            }),
        };

        let properties = def
            .properties()
            .iter()
            .map(|p| PropertyDescriptor { name: p.name.clone(), default: Value::from(p.default.clone()) })
            .collect();

        let info = Arc::new(SchemaInfo::new(
            Identity::new(&self.namespace, name),
            kind,
            supertype,
            properties,
            def.cached(),
        ));
        self.visiting.remove(name);
        self.compiled.insert(name, info.clone());
        Ok(info)
    }

    /// A supertype: local name or `schema:Name` from the registry.
    fn resolve_type(&mut self, reference: &'d str) -> Result<Arc<SchemaInfo>> {
        if self.defs.contains_key(reference) {
            return self.compile_one(reference);
        }
        let id = Identity::parse(reference)
            .map_err(|_| Error::MetadataNotFound(format!("{}:{reference}", self.namespace)))?;
        if id.domain() == self.namespace {
            if let Some(local) = self.defs.keys().copied().find(|k| *k == id.key()) {
                return self.compile_one(local);
            }
        }
        match self.registry {
            Some(registry) => registry.resolve(&id),
            None => Err(Error::MetadataNotFound(reference.to_string())),
        }
    }

    /// A relationship end: only its id is kept, but it must exist.
    fn resolve_reference(&self, reference: &str) -> Result<Identity> {
        if self.defs.contains_key(reference) {
            return Ok(Identity::new(&self.namespace, reference));
        }
        let id = Identity::parse(reference)
            .map_err(|_| Error::MetadataNotFound(format!("{}:{reference}", self.namespace)))?;
        if id.domain() == self.namespace && self.defs.contains_key(id.key()) {
            return Ok(id);
        }
        match self.registry {
            Some(registry) => registry.resolve(&id).map(|info| info.id().clone()),
            None => Err(Error::MetadataNotFound(reference.to_string())),
        }
    }
}
