//! Elements: graph nodes (entities) and typed edges (relationships).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use super::Identity;
use crate::schema::SchemaInfo;
use crate::{Error, Result};

// ============================================================================
// Storage records
// ============================================================================

/// Both ends of a relationship.
///
/// The end may live in another domain that is not loaded, so its schema id
/// is kept next to the reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeEnds {
    pub start: Identity,
    pub start_schema: Identity,
    pub end: Identity,
    pub end_schema: Identity,
}

/// What the hypergraph stores for one element.
#[derive(Debug, Clone)]
pub struct GraphElement {
    pub id: Identity,
    pub schema: Arc<SchemaInfo>,
    /// Creation order inside the owning storage.
    pub sequence: u64,
    /// `Some` for relationships.
    pub ends: Option<EdgeEnds>,
}

impl GraphElement {
    pub fn is_relationship(&self) -> bool {
        self.ends.is_some()
    }

    pub fn start(&self) -> Option<&Identity> {
        self.ends.as_ref().map(|e| &e.start)
    }

    pub fn end(&self) -> Option<&Identity> {
        self.ends.as_ref().map(|e| &e.end)
    }
}

// ============================================================================
// Domain link
// ============================================================================

/// An element's handle on its owning domain.
///
/// Cleared when the domain is unloaded; every element of that domain then
/// reports `UnloadedDomain`.
#[derive(Debug)]
pub struct DomainLink {
    name: String,
    loaded: AtomicBool,
}

impl DomainLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), loaded: AtomicBool::new(true) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub(crate) fn unload(&self) {
        self.loaded.store(false, Ordering::Release);
    }
}

// ============================================================================
// Materialized element
// ============================================================================

/// Lifecycle of a materialized element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElementStatus {
    /// Added by a session that has not committed yet.
    Created = 0,
    Active = 1,
    Removed = 2,
    /// Evicted from memory (domain unloaded).
    Disposed = 3,
}

impl ElementStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ElementStatus::Created,
            1 => ElementStatus::Active,
            2 => ElementStatus::Removed,
            _ => ElementStatus::Disposed,
        }
    }
}

/// Entity or relationship, fixed once from the schema kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    Entity,
    Relationship(EdgeEnds),
}

/// The single in-memory instance for one identity.
///
/// Handed out as `Arc<Element>`; the L1 cache guarantees that two lookups of
/// the same identity in the same domain yield the same `Arc`.
#[derive(Debug)]
pub struct Element {
    id: Identity,
    schema: Arc<SchemaInfo>,
    sequence: u64,
    kind: ElementKind,
    status: AtomicU8,
    domain: Arc<DomainLink>,
}

impl Element {
    pub fn from_record(record: GraphElement, domain: Arc<DomainLink>, status: ElementStatus) -> Self {
        let kind = match record.ends {
            Some(ends) => ElementKind::Relationship(ends),
            None => ElementKind::Entity,
        };
        Self {
            id: record.id,
            schema: record.schema,
            sequence: record.sequence,
            kind,
            status: AtomicU8::new(status as u8),
            domain,
        }
    }

    pub fn id(&self) -> &Identity {
        &self.id
    }

    pub fn schema(&self) -> &Arc<SchemaInfo> {
        &self.schema
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    pub fn is_relationship(&self) -> bool {
        matches!(self.kind, ElementKind::Relationship(_))
    }

    pub fn ends(&self) -> Option<&EdgeEnds> {
        match &self.kind {
            ElementKind::Relationship(ends) => Some(ends),
            ElementKind::Entity => None,
        }
    }

    pub fn start(&self) -> Option<&Identity> {
        self.ends().map(|e| &e.start)
    }

    pub fn end(&self) -> Option<&Identity> {
        self.ends().map(|e| &e.end)
    }

    pub fn status(&self) -> ElementStatus {
        ElementStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ElementStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn domain_name(&self) -> &str {
        self.domain.name()
    }

    /// Fails with `UnloadedDomain` once the owning domain is gone.
    pub fn ensure_loaded(&self) -> Result<()> {
        if self.domain.is_loaded() {
            Ok(())
        } else {
            Err(Error::UnloadedDomain(self.domain.name().to_string()))
        }
    }
}
