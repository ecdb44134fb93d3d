//! Identity: the `domain:key` address of every element.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Globally unique address of an element.
///
/// The domain name is normalized to lowercase, so `Lib:1` and `lib:1`
/// address the same element. The key is kept verbatim and may itself
/// contain `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    domain: String,
    key: String,
}

impl Identity {
    pub fn new(domain: impl AsRef<str>, key: impl Into<String>) -> Self {
        Self {
            domain: domain.as_ref().to_lowercase(),
            key: key.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Parse the external `"<domain>:<key>"` form.
    pub fn parse(text: &str) -> Result<Self> {
        match text.split_once(':') {
            Some((domain, key)) if !domain.is_empty() && !key.is_empty() => {
                Ok(Self::new(domain, key))
            }
            _ => Err(Error::InvalidIdentity(text.to_string())),
        }
    }

    /// A lock resource key for one property of this element.
    pub fn property_key(&self, property: &str) -> String {
        format!("{self}.{property}")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.key)
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Identity::parse(s)
    }
}

/// `(owner, property)`: addresses one property slot of one element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyKey {
    pub owner: Identity,
    pub name: String,
}

impl PropertyKey {
    pub fn new(owner: Identity, name: impl Into<String>) -> Self {
        Self { owner, name: name.into() }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.name)
    }
}
