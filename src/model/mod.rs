//! # Hypergraph Model
//!
//! Plain data shared by every layer: identities, values, property versions
//! and the materialized `Element`.
//!
//! Design rule: nothing here talks to storage or sessions.

pub mod identity;
pub mod value;
pub mod property;
pub mod element;

pub use identity::{Identity, PropertyKey};
pub use value::Value;
pub use property::{PropertyChange, PropertyValue};
pub use element::{DomainLink, EdgeEnds, Element, ElementKind, ElementStatus, GraphElement};
