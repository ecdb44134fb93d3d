//! Store configuration.
//!
//! ```json
//! {
//!   "session": { "isolation": "serializable", "timeout_ms": 5000 },
//!   "domain": { "cache_enabled": true }
//! }
//! ```
//!
//! Every field has a default, so `{}` is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tx::IsolationLevel;
use crate::{Error, Result};

/// Top-level configuration for a `Store`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub session: SessionConfig,
    pub domain: DomainConfig,
}

impl StoreConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.timeout.is_zero() {
            return Err(Error::Config("session.timeout_ms must be greater than 0".into()));
        }
        if self.session.default_domain.as_deref().is_some_and(str::is_empty) {
            return Err(Error::Config("session.default_domain must not be empty".into()));
        }
        Ok(())
    }
}

/// Session defaults. `SessionOptions` override them per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub isolation: IsolationLevel,
    /// Lock acquisition timeout.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    pub read_only: bool,
    /// Domain used for generated identities when none is named.
    pub default_domain: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            timeout: Duration::from_secs(60),
            read_only: false,
            default_domain: None,
        }
    }
}

/// Per-domain settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub cache_enabled: bool,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self { cache_enabled: true }
    }
}

/// Per-session overrides; unset fields fall back to `SessionConfig`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub isolation: Option<IsolationLevel>,
    pub timeout: Option<Duration>,
    pub read_only: Option<bool>,
    pub default_domain: Option<String>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = Some(true);
        self
    }

    pub fn default_domain(mut self, domain: impl Into<String>) -> Self {
        self.default_domain = Some(domain.into());
        self
    }

    /// Merge over `defaults`.
    pub fn resolve(&self, defaults: &SessionConfig) -> SessionConfig {
        SessionConfig {
            isolation: self.isolation.unwrap_or(defaults.isolation),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            read_only: self.read_only.unwrap_or(defaults.read_only),
            default_domain: self.default_domain.clone().or_else(|| defaults.default_domain.clone()),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(StoreConfig::from_json("{}").unwrap(), StoreConfig::default());
    }

    #[test]
    fn test_from_json() {
        let config = StoreConfig::from_json(
            r#"{"session": {"isolation": "serializable", "timeout_ms": 250}, "domain": {"cache_enabled": false}}"#,
        )
        .unwrap();
        assert_eq!(config.session.isolation, IsolationLevel::Serializable);
        assert_eq!(config.session.timeout, Duration::from_millis(250));
        assert!(!config.domain.cache_enabled);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(matches!(
            StoreConfig::from_json(r#"{"session": {"timeout_ms": 0}}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(StoreConfig::from_json("{"), Err(Error::Json(_))));
    }

    #[test]
    fn test_options_resolve() {
        let defaults = SessionConfig { default_domain: Some("lib".into()), ..Default::default() };
        let resolved = SessionOptions::new()
            .timeout(Duration::from_millis(10))
            .read_only()
            .resolve(&defaults);
        assert_eq!(resolved.timeout, Duration::from_millis(10));
        assert!(resolved.read_only);
        assert_eq!(resolved.isolation, IsolationLevel::ReadCommitted);
        assert_eq!(resolved.default_domain.as_deref(), Some("lib"));
    }
}
