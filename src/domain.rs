//! Domain models.
//!
//! A domain is a named partition of the graph: one storage, one L1 cache,
//! one identity sequence. Elements of a domain carry a `DomainLink` that is
//! cleared when the domain is unloaded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::L1Cache;
use crate::config::DomainConfig;
use crate::model::{DomainLink, Identity};
use crate::storage::{HypergraphStorage, MemoryHypergraph};
use crate::tx::{SessionCompletion, SessionHooks, StoreEvents, SubscriptionId};
use crate::Result;

pub struct DomainModel<B: HypergraphStorage = MemoryHypergraph> {
    name: String,
    config: DomainConfig,
    storage: B,
    cache: L1Cache,
    link: Arc<DomainLink>,
    next_id: AtomicU64,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl<B: HypergraphStorage> std::fmt::Debug for DomainModel<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainModel")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl<B: HypergraphStorage> DomainModel<B> {
    pub(crate) fn new(name: &str, config: DomainConfig) -> Result<Self> {
        let name = name.to_lowercase();
        Ok(Self {
            storage: B::create(&name)?,
            cache: L1Cache::new(config.cache_enabled),
            link: Arc::new(DomainLink::new(name.clone())),
            next_id: AtomicU64::new(1),
            subscription: Mutex::new(None),
            config,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub fn storage(&self) -> &B {
        &self.storage
    }

    pub fn cache(&self) -> &L1Cache {
        &self.cache
    }

    pub fn link(&self) -> &Arc<DomainLink> {
        &self.link
    }

    pub fn is_loaded(&self) -> bool {
        self.link.is_loaded()
    }

    /// A fresh identity in this domain.
    pub fn new_id(&self) -> Identity {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        Identity::new(&self.name, n.to_string())
    }

    /// Keep generated ids clear of numeric keys chosen by callers.
    pub(crate) fn observe_id(&self, id: &Identity) {
        if let Ok(n) = id.key().parse::<u64>() {
            self.next_id.fetch_max(n.saturating_add(1), Ordering::Relaxed);
        }
    }

    /// Hook this domain's cache into every new session.
    pub(crate) fn attach(self: &Arc<Self>, events: &StoreEvents) {
        let domain: Weak<Self> = Arc::downgrade(self);
        let id = events.session_created.subscribe(Arc::new(move |hooks: &SessionHooks| {
            let domain = domain.clone();
            hooks.on_completing(Arc::new(move |completion: &SessionCompletion<'_>| {
                match domain.upgrade() {
                    Some(domain) => domain.cache.on_session_completed(
                        &domain.storage,
                        completion.aborted,
                        completion.tracking,
                    ),
                    None => Ok(()),
                }
            }));
            Ok(())
        }));
        *self.subscription.lock() = Some(id);
        debug!(domain = %self.name, "domain attached");
    }

    /// Unsubscribe, unload the link and dispose every cached element.
    pub(crate) fn detach(&self, events: &StoreEvents) {
        if let Some(id) = self.subscription.lock().take() {
            events.session_created.unsubscribe(id);
        }
        self.link.unload();
        let disposed = self.cache.dispose_all();
        info!(domain = %self.name, disposed, "domain unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_skip_observed_keys() {
        let domain = DomainModel::<MemoryHypergraph>::new("Lib", DomainConfig::default()).unwrap();
        assert_eq!(domain.name(), "lib");
        assert_eq!(domain.new_id(), Identity::new("lib", "1"));
        domain.observe_id(&Identity::new("lib", "41"));
        domain.observe_id(&Identity::new("lib", "named"));
        assert_eq!(domain.new_id(), Identity::new("lib", "42"));
    }

    #[test]
    fn test_attach_and_detach() {
        let events = StoreEvents::new();
        let domain = Arc::new(DomainModel::<MemoryHypergraph>::new("lib", DomainConfig::default()).unwrap());
        domain.attach(&events);
        assert_eq!(events.session_created.len(), 1);
        domain.detach(&events);
        assert!(events.session_created.is_empty());
        assert!(!domain.is_loaded());
    }
}
