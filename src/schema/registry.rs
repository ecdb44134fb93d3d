//! Registry of loaded schemas.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Schema, SchemaInfo};
use crate::model::Identity;
use crate::{Error, Result};

/// Loaded schemas by namespace. Schemas are never replaced once registered.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-if-absent; returns whichever instance ends up registered.
    pub fn register(&self, schema: Schema) -> Arc<Schema> {
        let mut schemas = self.schemas.write();
        schemas
            .entry(schema.name().to_string())
            .or_insert_with(|| Arc::new(schema))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Schema>> {
        self.schemas.read().get(&name.to_lowercase()).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.read().contains_key(&name.to_lowercase())
    }

    /// Resolve a `schema:Name` identity to its descriptor.
    pub fn resolve(&self, id: &Identity) -> Result<Arc<SchemaInfo>> {
        self.schemas
            .read()
            .get(id.domain())
            .and_then(|schema| schema.get(id.key()))
            .ok_or_else(|| Error::MetadataNotFound(id.to_string()))
    }

    /// Same as `resolve`, from the textual form.
    pub fn resolve_name(&self, name: &str) -> Result<Arc<SchemaInfo>> {
        let id = Identity::parse(name).map_err(|_| Error::MetadataNotFound(name.to_string()))?;
        self.resolve(&id)
    }

    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.read().is_empty()
    }
}
