//! PropertyValue: a versioned value in one property slot.

use serde::{Deserialize, Serialize};

use super::Value;
use crate::schema::PropertyDescriptor;

/// A stored attribute value together with its version.
///
/// Version 0 is the sentinel for "never set": the value is the schema
/// default. Every write bumps the version by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    pub value: Value,
    pub version: u64,
}

impl PropertyValue {
    pub fn new(value: impl Into<Value>, version: u64) -> Self {
        Self { value: value.into(), version }
    }

    /// The version-0 sentinel carrying the descriptor's default.
    pub fn default_for(descriptor: &PropertyDescriptor) -> Self {
        Self { value: descriptor.default.clone(), version: 0 }
    }

    pub fn is_default(&self) -> bool {
        self.version == 0
    }
}

/// Old and new value of one applied property write.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub old: PropertyValue,
    pub new: PropertyValue,
}
