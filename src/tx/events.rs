//! Store and session events.
//!
//! Publishers own explicit subscriber lists. Subscribing returns a
//! `SubscriptionId`; whoever subscribed is responsible for unsubscribing.
//! Handlers run on the publishing thread, outside the list's lock, so a
//! handler may itself subscribe or unsubscribe.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::{TrackingSet, TxId};
use crate::model::{Identity, PropertyKey, PropertyValue};
use crate::Result;

// ============================================================================
// Subscribers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// An ordered list of handlers of one kind.
pub struct Subscribers<H: ?Sized> {
    next: AtomicU64,
    handlers: RwLock<Vec<(SubscriptionId, Arc<H>)>>,
}

impl<H: ?Sized> Default for Subscribers<H> {
    fn default() -> Self {
        Self { next: AtomicU64::new(1), handlers: RwLock::new(Vec::new()) }
    }
}

impl<H: ?Sized> Subscribers<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Arc<H>) -> SubscriptionId {
        let id = SubscriptionId(self.next.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        handlers.len() != before
    }

    /// Current handlers in subscription order.
    pub fn snapshot(&self) -> Vec<Arc<H>> {
        self.handlers.read().iter().map(|(_, h)| h.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl<H: ?Sized> fmt::Debug for Subscribers<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers").field("len", &self.len()).finish()
    }
}

// ============================================================================
// Handler types
// ============================================================================

pub type SessionCreatedHandler = dyn Fn(&SessionHooks) -> Result<()> + Send + Sync;
pub type CompletingHandler = dyn Fn(&SessionCompletion<'_>) -> Result<()> + Send + Sync;
pub type DomainHandler = dyn Fn(&str) + Send + Sync;
pub type PropertyChangedHandler = dyn Fn(&PropertyKey) + Send + Sync;
pub type ErrorHandler = dyn Fn(&Diagnostic) + Send + Sync;

// ============================================================================
// Payloads
// ============================================================================

/// One applied change, queued by the session and delivered on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomainEvent {
    EntityAdded { id: Identity, schema: Identity },
    EntityRemoved { id: Identity, schema: Identity },
    RelationshipAdded { id: Identity, schema: Identity, start: Identity, end: Identity },
    RelationshipRemoved { id: Identity, schema: Identity },
    PropertyChanged { owner: Identity, property: String, old: PropertyValue, new: PropertyValue },
}

impl DomainEvent {
    /// The element the event is about.
    pub fn target(&self) -> &Identity {
        match self {
            DomainEvent::EntityAdded { id, .. }
            | DomainEvent::EntityRemoved { id, .. }
            | DomainEvent::RelationshipAdded { id, .. }
            | DomainEvent::RelationshipRemoved { id, .. } => id,
            DomainEvent::PropertyChanged { owner, .. } => owner,
        }
    }
}

/// What completing hooks and pre-commit validators see.
#[derive(Debug, Clone, Copy)]
pub struct SessionCompletion<'a> {
    pub session: TxId,
    pub aborted: bool,
    pub tracking: &'a TrackingSet,
    pub events: &'a [DomainEvent],
}

/// An error caught while completing a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub session: Option<TxId>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(session: Option<TxId>, message: impl Into<String>) -> Self {
        Self { session, message: message.into() }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.session {
            Some(session) => write!(f, "[{session}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

// ============================================================================
// Session hooks
// ============================================================================

/// Per-session subscription point handed to `SessionCreated` handlers.
#[derive(Debug)]
pub struct SessionHooks {
    session: TxId,
    completing: Subscribers<CompletingHandler>,
}

impl SessionHooks {
    pub(crate) fn new(session: TxId) -> Self {
        Self { session, completing: Subscribers::new() }
    }

    pub fn session(&self) -> TxId {
        self.session
    }

    /// Run `handler` once when the session commits or aborts.
    pub fn on_completing(&self, handler: Arc<CompletingHandler>) -> SubscriptionId {
        self.completing.subscribe(handler)
    }

    pub(crate) fn completing(&self) -> Vec<Arc<CompletingHandler>> {
        self.completing.snapshot()
    }
}

// ============================================================================
// Store events
// ============================================================================

/// Every store-wide subscriber list.
#[derive(Debug, Default)]
pub struct StoreEvents {
    pub session_created: Subscribers<SessionCreatedHandler>,
    /// Pre-commit validators. An error aborts the session.
    pub before_commit: Subscribers<CompletingHandler>,
    pub domain_loaded: Subscribers<DomainHandler>,
    pub domain_unloaded: Subscribers<DomainHandler>,
    pub property_changed: Subscribers<PropertyChangedHandler>,
    pub errors: Subscribers<ErrorHandler>,
}

impl StoreEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish_property_changed(&self, key: &PropertyKey) {
        for handler in self.property_changed.snapshot() {
            handler(key);
        }
    }

    pub(crate) fn publish_domain_loaded(&self, name: &str) {
        for handler in self.domain_loaded.snapshot() {
            handler(name);
        }
    }

    pub(crate) fn publish_domain_unloaded(&self, name: &str) {
        for handler in self.domain_unloaded.snapshot() {
            handler(name);
        }
    }

    /// Log a diagnostic and hand it to every error notifier.
    pub fn report(&self, diagnostic: Diagnostic) {
        error!(session = ?diagnostic.session, "{}", diagnostic.message);
        for handler in self.errors.snapshot() {
            handler(&diagnostic);
        }
    }
}
