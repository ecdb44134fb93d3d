//! # L1 Cache
//!
//! Per-domain identity map of materialized elements. Every lookup of an
//! identity in a domain yields the same `Arc<Element>` until the element is
//! evicted.
//!
//! The cache is shared by all sessions, so a hit is checked against the
//! reading session before it is returned:
//!
//! - an identity the session removed reads as absent;
//! - an element still in `Created` status is only visible to a reader whose
//!   storage view contains that exact record. Anything else is another
//!   session's uncommitted insert (absent) or a leftover from an aborted
//!   session that has since been replaced (re-materialized);
//! - an identity the session removed and added again is checked the same
//!   way, so the session sees the new record's instance.
//!
//! A committed instance displaced by a session's re-added element is parked
//! until that session completes. Other readers keep seeing it meanwhile.
//!
//! Invalidation runs from the session completing hook: committed removals
//! are evicted, committed inserts become `Active` and displaced instances
//! become `Removed`. An abort puts displaced instances back.

use std::sync::Arc;

use hashbrown::hash_map::Entry;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace};

use crate::model::{DomainLink, Element, ElementStatus, GraphElement, Identity};
use crate::schema::SchemaInfo;
use crate::storage::HypergraphStorage;
use crate::tx::{TrackingSet, TrackingState};
use crate::{Error, Result};

// ============================================================================
// Stats
// ============================================================================

/// Cache hit/miss/eviction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate in `0.0..=1.0`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ============================================================================
// Read view
// ============================================================================

/// What one reader can see: its storage write set and its change tracking.
/// Both `None` means a reader outside any session.
pub struct ReadView<'a, T> {
    pub tx: Option<&'a T>,
    pub tracking: Option<&'a TrackingSet>,
}

impl<T> ReadView<'_, T> {
    pub fn committed() -> Self {
        Self { tx: None, tracking: None }
    }

    fn tracked(&self, id: &Identity) -> Option<TrackingState> {
        self.tracking.and_then(|t| t.state_of(id))
    }
}

impl<T> Clone for ReadView<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ReadView<'_, T> {}

// ============================================================================
// L1Cache
// ============================================================================

#[derive(Debug)]
pub struct L1Cache {
    enabled: bool,
    elements: RwLock<hashbrown::HashMap<Identity, Arc<Element>>>,
    /// Committed instances displaced by an uncommitted re-add.
    displaced: Mutex<hashbrown::HashMap<Identity, Arc<Element>>>,
    stats: Mutex<CacheStats>,
}

impl L1Cache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            elements: RwLock::new(hashbrown::HashMap::new()),
            displaced: Mutex::new(hashbrown::HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Insert-if-absent. Returns the instance that ends up cached: the
    /// argument if the slot was free, the earlier instance otherwise.
    pub fn add_element(&self, element: Arc<Element>) -> Arc<Element> {
        if !self.enabled || !element.schema().cached() {
            return element;
        }
        self.elements
            .write()
            .entry(element.id().clone())
            .or_insert(element)
            .clone()
    }

    /// Cached instance without any visibility check.
    pub fn peek(&self, id: &Identity) -> Option<Arc<Element>> {
        self.elements.read().get(id).cloned()
    }

    /// Resolve `id` for a reader.
    ///
    /// `schema`, when given, must be a supertype of the element's schema
    /// (`SchemaMismatch` otherwise); an uncached schema bypasses the cache.
    /// With `local_only`, a cache miss is not read through to storage.
    pub fn get_element<B: HypergraphStorage>(
        &self,
        storage: &B,
        link: &Arc<DomainLink>,
        view: ReadView<'_, B::Tx>,
        id: &Identity,
        schema: Option<&SchemaInfo>,
        local_only: bool,
    ) -> Result<Option<Arc<Element>>> {
        if view.tracked(id) == Some(TrackingState::Removed) {
            self.stats.lock().misses += 1;
            return Ok(None);
        }

        let bypass = !self.enabled || schema.is_some_and(|s| !s.cached());
        if !bypass {
            let hit = self.elements.read().get(id).cloned();
            if let Some(mut element) = hit {
                let readded = view.tracked(id) == Some(TrackingState::Added);
                if element.status() == ElementStatus::Created || readded {
                    match storage.get_element(view.tx, id)? {
                        None => {
                            self.stats.lock().misses += 1;
                            return Ok(None);
                        }
                        Some(record) if record.sequence != element.sequence() => {
                            match self.displaced_for(id, record.sequence) {
                                Some(committed) => element = committed,
                                None => {
                                    trace!(%id, "replacing stale cached instance");
                                    let fresh = self.materialize(record, link, view, schema)?;
                                    self.stats.lock().misses += 1;
                                    return Ok(Some(self.replace(id, &element, fresh)));
                                }
                            }
                        }
                        Some(_) => {}
                    }
                }
                check_schema(element.schema(), schema)?;
                self.stats.lock().hits += 1;
                return Ok(Some(element));
            }
        }

        self.stats.lock().misses += 1;
        if local_only {
            return Ok(None);
        }
        let Some(record) = storage.get_element(view.tx, id)? else {
            return Ok(None);
        };
        let element = self.materialize(record, link, view, schema)?;
        if bypass {
            return Ok(Some(element));
        }
        Ok(Some(self.add_element(element)))
    }

    /// The parked committed instance of `id`, if it matches `sequence`.
    fn displaced_for(&self, id: &Identity, sequence: u64) -> Option<Arc<Element>> {
        self.displaced
            .lock()
            .get(id)
            .filter(|element| element.sequence() == sequence)
            .cloned()
    }

    /// Swap `stale` out of the slot for `fresh`. If another reader already
    /// put an instance of the same record there, that one is kept.
    fn replace(&self, id: &Identity, stale: &Arc<Element>, fresh: Arc<Element>) -> Arc<Element> {
        let mut elements = self.elements.write();
        match elements.entry(id.clone()) {
            Entry::Occupied(slot) if slot.get().sequence() == fresh.sequence() => slot.get().clone(),
            Entry::Occupied(mut slot) => {
                let previous = slot.insert(fresh.clone());
                trace!(%id, replaced = Arc::ptr_eq(&previous, stale), "cache slot swapped");
                if previous.status() == ElementStatus::Active {
                    self.displaced.lock().insert(id.clone(), previous);
                }
                fresh
            }
            Entry::Vacant(slot) => slot.insert(fresh).clone(),
        }
    }

    fn materialize<T>(
        &self,
        record: GraphElement,
        link: &Arc<DomainLink>,
        view: ReadView<'_, T>,
        schema: Option<&SchemaInfo>,
    ) -> Result<Arc<Element>> {
        check_schema(&record.schema, schema)?;
        let status = match view.tracked(&record.id) {
            Some(TrackingState::Added) => ElementStatus::Created,
            _ => ElementStatus::Active,
        };
        Ok(Arc::new(Element::from_record(record, link.clone(), status)))
    }

    /// Apply a completed session's changes. `storage` already holds the
    /// outcome.
    pub fn on_session_completed<B: HypergraphStorage>(
        &self,
        storage: &B,
        aborted: bool,
        tracking: &TrackingSet,
    ) -> Result<()> {
        let mut elements = self.elements.write();
        let mut displaced = self.displaced.lock();
        if aborted {
            for entry in tracking.entries() {
                if let Some(committed) = displaced.remove(&entry.id) {
                    trace!(id = %entry.id, "restoring displaced instance");
                    elements.insert(entry.id.clone(), committed);
                }
            }
            return Ok(());
        }

        let mut evicted = 0;
        for id in tracking.removed() {
            if let Some(element) = displaced.remove(id) {
                element.set_status(ElementStatus::Removed);
            }
            if let Some(element) = elements.remove(id) {
                element.set_status(ElementStatus::Removed);
                evicted += 1;
            }
        }
        for id in tracking.added() {
            if let Some(element) = displaced.remove(id) {
                element.set_status(ElementStatus::Removed);
                evicted += 1;
            }
            let Some(element) = elements.get(id).cloned() else {
                continue;
            };
            let current = storage.get_element(None, id)?.map(|record| record.sequence);
            if current != Some(element.sequence()) {
                // Removed and added again without being read in between.
                elements.remove(id);
                element.set_status(ElementStatus::Removed);
                evicted += 1;
            } else if element.status() == ElementStatus::Created {
                element.set_status(ElementStatus::Active);
            }
        }
        drop(displaced);
        drop(elements);
        if evicted > 0 {
            self.stats.lock().evictions += evicted;
            debug!(evicted, "cache evicted removed elements");
        }
        Ok(())
    }

    /// Drop every cached element, marking each `Disposed`.
    pub fn dispose_all(&self) -> usize {
        self.displaced.lock().clear();
        let drained: Vec<Arc<Element>> = self.elements.write().drain().map(|(_, e)| e).collect();
        for element in &drained {
            element.set_status(ElementStatus::Disposed);
        }
        self.stats.lock().evictions += drained.len() as u64;
        drained.len()
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    pub fn len(&self) -> usize {
        self.elements.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.read().is_empty()
    }
}

fn check_schema(actual: &SchemaInfo, expected: Option<&SchemaInfo>) -> Result<()> {
    match expected {
        Some(expected) if !actual.is_a(expected) => Err(Error::SchemaMismatch {
            expected: expected.id().to_string(),
            got: actual.id().to_string(),
        }),
        _ => Ok(()),
    }
}
