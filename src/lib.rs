//! # hyperstore: Typed In-Process Hypergraph Store
//!
//! Entities and relationships governed by a schema, mutated only inside
//! transactional sessions, with memoized calculated properties that
//! propagate changes safely across circular dependencies.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `HypergraphStorage` is the contract between the session engine and storage
//! 2. **Explicit sessions**: every mutation goes through a `Session`; dropping it aborts
//! 3. **One instance per identity**: the L1 cache hands out the same `Arc<Element>` per domain
//! 4. **Locks are RAII**: `LockHandle` and `Session` release on `Drop`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hyperstore::{Cardinality, SchemaBuilder, Store};
//!
//! # fn example() -> hyperstore::Result<()> {
//! let store = Store::open_memory();
//! let schema = store.load_schema(
//!     SchemaBuilder::new("lib")
//!         .entity("Library", |e| e.property("Name", "unnamed"))
//!         .entity("Book", |e| e)
//!         .relationship("LibraryHasBooks", "Library", "Book", Cardinality::OneToMany, |r| r.embedded())
//!         .build(),
//! )?;
//! store.create_domain_model("lib", None)?;
//!
//! let library = schema.get("Library").unwrap();
//! let mut session = store.begin_session(None)?;
//! let lib = session.create_entity(&library, None)?;
//! session.set_property_value(lib.id(), "Name", "Central")?;
//! session.accept_changes()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Layers
//!
//! | Layer | Module | Description |
//! |-------|--------|-------------|
//! | Identity & schema | `model`, `schema` | `domain:key` identities, typed descriptors |
//! | Locks | `lock` | Shared/exclusive named locks with upgrade |
//! | Storage | `storage` | Per-domain element store with write sets |
//! | Cache | `cache` | Per-domain identity map |
//! | Sessions | `tx` | Nesting, isolation, tracking, completion |
//! | Calculated | `calculated` | Memoized derived properties |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod schema;
pub mod lock;
pub mod storage;
pub mod cache;
pub mod calculated;
pub mod tx;
pub mod config;
pub mod domain;
pub mod store;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    DomainLink, EdgeEnds, Element, ElementKind, ElementStatus, GraphElement, Identity,
    PropertyChange, PropertyKey, PropertyValue, Value,
};

// ============================================================================
// Re-exports: Schema
// ============================================================================

pub use schema::{
    Cardinality, PropertyDescriptor, Schema, SchemaBuilder, SchemaDefinition, SchemaInfo,
    SchemaKind, SchemaRegistry,
};

// ============================================================================
// Re-exports: Storage, locks, cache
// ============================================================================

pub use storage::{HypergraphStorage, MemoryHypergraph, RelationshipQuery};
pub use lock::{LockHandle, LockId, LockManager, LockType};
pub use cache::{CacheStats, L1Cache};
pub use calculated::CalculatedGraph;

// ============================================================================
// Re-exports: Sessions & configuration
// ============================================================================

pub use tx::{
    Command, Diagnostic, DomainEvent, IsolationLevel, Session, SessionCompletion, SessionHooks,
    SessionState, StoreEvents, SubscriptionId, TrackingEntry, TrackingState, Transaction, TxId,
    TxMode,
};
pub use config::{DomainConfig, SessionConfig, SessionOptions, StoreConfig};
pub use domain::DomainModel;
pub use store::Store;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No active session: {0}")]
    SessionRequired(String),

    #[error("Lock timeout on {key} after {timeout:?}")]
    LockTimeout { key: String, timeout: std::time::Duration },

    #[error("Lock conflict on {key}: another session is already upgrading it")]
    LockConflict { key: String },

    #[error("Invalid cardinality: {0}")]
    InvalidCardinality(String),

    #[error("Schema mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: String, got: String },

    #[error("Metadata not found: {0}")]
    MetadataNotFound(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Domain not loaded: {0}")]
    UnloadedDomain(String),

    #[error("Read-only: {0}")]
    ReadOnly(String),

    #[error("Session {0} is closed")]
    SessionClosed(TxId),

    #[error("Session {0} was aborted by a nested session")]
    TransactionAborted(TxId),

    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict { key: String, expected: u64, actual: u64 },

    #[error("Duplicate element: {0}")]
    DuplicateElement(Identity),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Transaction error: {0}")]
    TxError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
