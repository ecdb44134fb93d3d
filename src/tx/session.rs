//! # Sessions
//!
//! A `Session` is a thread-bound handle on a root transaction (`SessionTx`).
//! Opening a session while another is active on the same thread yields a
//! nested session sharing the outer one's write sets, tracking and locks.
//!
//! ```text
//!   begin_session ──► Created ──► Active ──► Completing ──┬──► Committed
//!                                                         └──► Aborted
//! ```
//!
//! Only the root completes. A nested session either accepts (a no-op for
//! storage) or is dropped, which dooms the whole chain: the root's
//! `accept_changes` then aborts and returns `TransactionAborted`.
//!
//! Completing a root:
//! 1. run the store's pre-commit validators (an error aborts);
//! 2. commit or roll back every domain write set;
//! 3. run the session's completing hooks, catching errors and panics and
//!    reporting them as diagnostics;
//! 4. release every lock of the chain.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::{
    Command, Diagnostic, DomainEvent, IsolationLevel, SessionCompletion, SessionHooks,
    TrackingEntry, TrackingSet, TrackingState, TxId, TxMode,
};
use crate::cache::ReadView;
use crate::config::SessionConfig;
use crate::domain::DomainModel;
use crate::lock::{LockHandle, LockType};
use crate::model::{EdgeEnds, Element, Identity, PropertyKey, PropertyValue, Value};
use crate::schema::{PropertyDescriptor, SchemaInfo};
use crate::storage::{HypergraphStorage, MemoryHypergraph, RelationshipQuery};
use crate::store::Store;
use crate::{Error, Result};

/// Lifecycle of a session chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Active,
    Completing,
    Committed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Committed | SessionState::Aborted)
    }
}

// ============================================================================
// Root transaction
// ============================================================================

pub(crate) struct SessionTx<B: HypergraphStorage> {
    id: TxId,
    config: SessionConfig,
    thread: ThreadId,
    hooks: SessionHooks,
    state: Mutex<TxState<B>>,
}

struct TxState<B: HypergraphStorage> {
    state: SessionState,
    depth: usize,
    aborted: bool,
    /// Storage write set per domain name.
    writes: HashMap<String, B::Tx>,
    tracking: TrackingSet,
    events: Vec<DomainEvent>,
    exclusive: HashSet<String>,
    shared: HashSet<String>,
    /// Elements already being removed by the current top-level command.
    removing: HashSet<Identity>,
}

impl<B: HypergraphStorage> SessionTx<B> {
    pub(crate) fn new(id: TxId, config: SessionConfig) -> Self {
        Self {
            id,
            config,
            thread: thread::current().id(),
            hooks: SessionHooks::new(id),
            state: Mutex::new(TxState {
                state: SessionState::Created,
                depth: 1,
                aborted: false,
                writes: HashMap::new(),
                tracking: TrackingSet::new(),
                events: Vec::new(),
                exclusive: HashSet::new(),
                shared: HashSet::new(),
                removing: HashSet::new(),
            }),
        }
    }

    pub(crate) fn id(&self) -> TxId {
        self.id
    }

    pub(crate) fn thread(&self) -> ThreadId {
        self.thread
    }

    pub(crate) fn hooks(&self) -> &SessionHooks {
        &self.hooks
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state.lock().state
    }

    pub(crate) fn activate(&self) {
        self.state.lock().state = SessionState::Active;
    }

    /// True once the chain has changed anything.
    pub(crate) fn has_writes(&self) -> bool {
        !self.state.lock().tracking.is_empty()
    }

    /// Open one more nesting level. Returns the new depth.
    pub(crate) fn enter(&self) -> usize {
        let mut state = self.state.lock();
        state.depth += 1;
        state.depth
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state.lock().state {
            SessionState::Created | SessionState::Active => Ok(()),
            _ => Err(Error::SessionClosed(self.id)),
        }
    }

    // ========================================================================
    // Locks
    // ========================================================================

    fn lock_exclusive(&self, store: &Store<B>, state: &mut TxState<B>, key: &str) -> Result<()> {
        if state.exclusive.contains(key) {
            return Ok(());
        }
        store.locks().acquire(self.id, key, LockType::Exclusive, self.config.timeout)?;
        state.exclusive.insert(key.to_string());
        Ok(())
    }

    /// Serializable reads hold a Shared lock on every identity they touch.
    fn lock_read(&self, store: &Store<B>, id: &Identity) -> Result<()> {
        if self.config.isolation != IsolationLevel::Serializable {
            return Ok(());
        }
        let key = id.to_string();
        {
            let state = self.state.lock();
            if state.shared.contains(&key) || state.exclusive.contains(&key) {
                return Ok(());
            }
        }
        store.locks().acquire(self.id, &key, LockType::Shared, self.config.timeout)?;
        self.state.lock().shared.insert(key);
        Ok(())
    }

    // ========================================================================
    // Execute
    // ========================================================================

    pub(crate) fn execute(
        &self,
        store: &Store<B>,
        commands: impl IntoIterator<Item = Command>,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.config.read_only {
            return Err(Error::ReadOnly(format!("session {}", self.id)));
        }
        let mut state = self.state.lock();
        for command in commands {
            trace!(session = %self.id, command = command.name(), target = %command.target(), "execute");
            let result = self.apply(store, &mut state, command);
            state.removing.clear();
            result?;
        }
        Ok(())
    }

    fn apply(&self, store: &Store<B>, state: &mut TxState<B>, command: Command) -> Result<()> {
        for key in command.lock_keys() {
            self.lock_exclusive(store, state, &key)?;
        }
        match command {
            Command::AddEntity { id, schema } => self.add_entity(store, state, id, schema),
            Command::RemoveEntity { id, throw_if_not_exists } => {
                self.remove_entity(store, state, id, throw_if_not_exists)
            }
            Command::AddRelationship { id, schema, start, start_schema, end, end_schema } => {
                self.add_relationship(store, state, id, schema, start, start_schema, end, end_schema)
            }
            Command::RemoveRelationship { id, throw_if_not_exists } => {
                self.remove_relationship(store, state, id, throw_if_not_exists)
            }
            Command::ChangePropertyValue { owner, property, value, expected_version } => {
                self.change_property(store, state, owner, property, value, expected_version)
            }
        }
    }

    /// The domain owning `id` and this transaction's write set on it.
    fn write_set<'a>(
        &self,
        store: &Store<B>,
        state: &'a mut TxState<B>,
        id: &Identity,
    ) -> Result<(Arc<DomainModel<B>>, &'a mut B::Tx)> {
        let domain = store.domain(id.domain())?;
        let tx = match state.writes.entry(domain.name().to_string()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(domain.storage().begin_tx(self.id, TxMode::ReadWrite)?)
            }
        };
        Ok((domain, tx))
    }

    fn add_entity(
        &self,
        store: &Store<B>,
        state: &mut TxState<B>,
        id: Identity,
        schema: Arc<SchemaInfo>,
    ) -> Result<()> {
        if !schema.is_entity() {
            return Err(Error::SchemaMismatch {
                expected: "entity schema".into(),
                got: schema.id().to_string(),
            });
        }
        let (domain, tx) = self.write_set(store, state, &id)?;
        domain.storage().add_entity(tx, id.clone(), schema.clone())?;
        domain.observe_id(&id);

        state.tracking.record(&id, schema.id(), TrackingState::Added);
        state.events.push(DomainEvent::EntityAdded { id, schema: schema.id().clone() });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn add_relationship(
        &self,
        store: &Store<B>,
        state: &mut TxState<B>,
        id: Identity,
        schema: Arc<SchemaInfo>,
        start: Identity,
        start_schema: Arc<SchemaInfo>,
        end: Identity,
        end_schema: Arc<SchemaInfo>,
    ) -> Result<()> {
        let spec = schema.relationship().ok_or_else(|| Error::SchemaMismatch {
            expected: "relationship schema".into(),
            got: schema.id().to_string(),
        })?;
        if id.domain() != start.domain() {
            return Err(Error::ConstraintViolation(format!(
                "relationship {id} must live in the domain of its start {start}"
            )));
        }
        for (declared, actual) in [(&spec.start, &start_schema), (&spec.end, &end_schema)] {
            if !actual.is_a_id(declared) {
                return Err(Error::SchemaMismatch {
                    expected: declared.to_string(),
                    got: actual.id().to_string(),
                });
            }
        }

        // Ends in another loaded domain are checked here; storage only sees
        // its own domain.
        if end.domain() != start.domain() {
            if let Some(end_domain) = store.find_domain(end.domain()) {
                let view = state.writes.get(end_domain.name());
                if end_domain.storage().get_element(view, &end)?.is_none() {
                    return Err(Error::InvalidReference(format!("end {end} of {id}")));
                }
            }
        }

        let ends = EdgeEnds {
            start: start.clone(),
            start_schema: start_schema.id().clone(),
            end: end.clone(),
            end_schema: end_schema.id().clone(),
        };
        let (domain, tx) = self.write_set(store, state, &id)?;
        domain.storage().add_relationship(tx, id.clone(), schema.clone(), ends)?;
        domain.observe_id(&id);

        state.tracking.record(&id, schema.id(), TrackingState::Added);
        state.events.push(DomainEvent::RelationshipAdded {
            id,
            schema: schema.id().clone(),
            start,
            end,
        });
        Ok(())
    }

    fn remove_entity(
        &self,
        store: &Store<B>,
        state: &mut TxState<B>,
        id: Identity,
        throw_if_not_exists: bool,
    ) -> Result<()> {
        if state.removing.contains(&id) {
            return Ok(());
        }
        let (domain, tx) = self.write_set(store, state, &id)?;
        let Some(record) = domain.storage().get_element(Some(&*tx), &id)? else {
            if throw_if_not_exists {
                return Err(Error::InvalidReference(id.to_string()));
            }
            return Ok(());
        };
        if record.is_relationship() {
            return Err(Error::SchemaMismatch { expected: "entity".into(), got: id.to_string() });
        }
        state.removing.insert(id.clone());

        // Detach first: outgoing (cascading through embedded ends), then incoming.
        let storage = domain.storage();
        let tx = state.writes.get(domain.name());
        let mut attached = storage.get_relationships(tx, &RelationshipQuery::new().start(id.clone()))?;
        attached.extend(storage.get_relationships(tx, &RelationshipQuery::new().end(id.clone()))?);
        for relationship in attached {
            self.apply(
                store,
                state,
                Command::RemoveRelationship { id: relationship.id, throw_if_not_exists: false },
            )?;
        }

        let (domain, tx) = self.write_set(store, state, &id)?;
        domain.storage().remove_entity(tx, &id, throw_if_not_exists)?;
        debug!(session = %self.id, %id, "entity removed");

        state.tracking.record(&id, record.schema.id(), TrackingState::Removed);
        state.events.push(DomainEvent::EntityRemoved { id, schema: record.schema.id().clone() });
        Ok(())
    }

    fn remove_relationship(
        &self,
        store: &Store<B>,
        state: &mut TxState<B>,
        id: Identity,
        throw_if_not_exists: bool,
    ) -> Result<()> {
        if state.removing.contains(&id) {
            return Ok(());
        }
        let (domain, tx) = self.write_set(store, state, &id)?;
        let Some(record) = domain.storage().remove_relationship(tx, &id, throw_if_not_exists)? else {
            return Ok(());
        };
        state.removing.insert(id.clone());
        state.tracking.record(&id, record.schema.id(), TrackingState::Removed);
        state.events.push(DomainEvent::RelationshipRemoved {
            id: id.clone(),
            schema: record.schema.id().clone(),
        });

        let embedded = record.schema.relationship().is_some_and(|spec| spec.embedded);
        if let (true, Some(end)) = (embedded, record.end()) {
            // An end in an unloaded domain is left alone.
            if store.find_domain(end.domain()).is_some() && !state.removing.contains(end) {
                trace!(session = %self.id, relationship = %id, %end, "embedded cascade");
                self.apply(
                    store,
                    state,
                    Command::RemoveEntity { id: end.clone(), throw_if_not_exists: false },
                )?;
            }
        }
        Ok(())
    }

    fn change_property(
        &self,
        store: &Store<B>,
        state: &mut TxState<B>,
        owner: Identity,
        property: String,
        value: Value,
        expected_version: Option<u64>,
    ) -> Result<()> {
        let (domain, tx) = self.write_set(store, state, &owner)?;
        let record = domain
            .storage()
            .get_element(Some(&*tx), &owner)?
            .ok_or_else(|| Error::InvalidReference(owner.to_string()))?;
        let descriptor = describe(&record.schema, &property)?;
        let change = domain
            .storage()
            .set_property_value(tx, &owner, descriptor, value, expected_version)?;

        state.tracking.record(&owner, record.schema.id(), TrackingState::Modified);
        store
            .calculated()
            .invalidate_scoped(self.id, &PropertyKey::new(owner.clone(), property.as_str()));
        state.events.push(DomainEvent::PropertyChanged {
            owner,
            property,
            old: change.old,
            new: change.new,
        });
        Ok(())
    }

    // ========================================================================
    // Element helpers
    // ========================================================================

    fn default_domain(&self, store: &Store<B>) -> Result<String> {
        self.config
            .default_domain
            .clone()
            .or_else(|| store.default_domain_name())
            .ok_or_else(|| Error::UnloadedDomain("no default domain".into()))
    }

    pub(crate) fn create_entity(
        &self,
        store: &Store<B>,
        schema: &Arc<SchemaInfo>,
        id: Option<Identity>,
    ) -> Result<Arc<Element>> {
        if !schema.is_entity() {
            return Err(Error::SchemaMismatch {
                expected: "entity schema".into(),
                got: schema.id().to_string(),
            });
        }
        let id = match id {
            Some(id) => id,
            None => store.domain(&self.default_domain(store)?)?.new_id(),
        };
        self.execute(store, [Command::AddEntity { id: id.clone(), schema: schema.clone() }])?;
        self.get_element(store, &id, None, false)?
            .ok_or_else(|| Error::InvalidReference(id.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_relationship(
        &self,
        store: &Store<B>,
        schema: &Arc<SchemaInfo>,
        start: &Identity,
        start_schema: &Arc<SchemaInfo>,
        end: &Identity,
        end_schema: &Arc<SchemaInfo>,
        id: Option<Identity>,
    ) -> Result<Arc<Element>> {
        let id = match id {
            Some(id) => id,
            None => store.domain(start.domain())?.new_id(),
        };
        self.execute(
            store,
            [Command::AddRelationship {
                id: id.clone(),
                schema: schema.clone(),
                start: start.clone(),
                start_schema: start_schema.clone(),
                end: end.clone(),
                end_schema: end_schema.clone(),
            }],
        )?;
        self.get_element(store, &id, None, false)?
            .ok_or_else(|| Error::InvalidReference(id.to_string()))
    }

    /// Pick the remove command from what `id` currently is.
    pub(crate) fn remove_element(
        &self,
        store: &Store<B>,
        id: &Identity,
        throw_if_not_exists: bool,
    ) -> Result<()> {
        let domain = store.domain(id.domain())?;
        let is_relationship = {
            let state = self.state.lock();
            domain
                .storage()
                .get_element(state.writes.get(domain.name()), id)?
                .map(|r| r.is_relationship())
        };
        let command = match is_relationship {
            Some(true) => Command::RemoveRelationship { id: id.clone(), throw_if_not_exists },
            Some(false) => Command::RemoveEntity { id: id.clone(), throw_if_not_exists },
            None if throw_if_not_exists => return Err(Error::InvalidReference(id.to_string())),
            None => return Ok(()),
        };
        self.execute(store, [command])
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub(crate) fn get_element(
        &self,
        store: &Store<B>,
        id: &Identity,
        schema: Option<&SchemaInfo>,
        local_only: bool,
    ) -> Result<Option<Arc<Element>>> {
        let domain = store.domain(id.domain())?;
        self.lock_read(store, id)?;
        let state = self.state.lock();
        let view = ReadView { tx: state.writes.get(domain.name()), tracking: Some(&state.tracking) };
        domain.cache().get_element(domain.storage(), domain.link(), view, id, schema, local_only)
    }

    pub(crate) fn get_property_value(
        &self,
        store: &Store<B>,
        owner: &Identity,
        property: &str,
    ) -> Result<PropertyValue> {
        let domain = store.domain(owner.domain())?;
        self.lock_read(store, owner)?;
        store.calculated().record_read(&PropertyKey::new(owner.clone(), property));
        let state = self.state.lock();
        let tx = state.writes.get(domain.name());
        let record = domain
            .storage()
            .get_element(tx, owner)?
            .ok_or_else(|| Error::InvalidReference(owner.to_string()))?;
        domain.storage().get_property_value(tx, owner, describe(&record.schema, property)?)
    }

    pub(crate) fn get_elements(
        &self,
        store: &Store<B>,
        domain: &str,
        schema: Option<&SchemaInfo>,
        skip: usize,
    ) -> Result<Vec<Arc<Element>>> {
        let domain = store.domain(domain)?;
        let state = self.state.lock();
        let tx = state.writes.get(domain.name());
        let records = domain.storage().get_elements(tx, schema, skip)?;
        self.materialize(&domain, &state, records.into_iter().map(|r| r.id))
    }

    pub(crate) fn get_relationships(
        &self,
        store: &Store<B>,
        domain: &str,
        query: &RelationshipQuery,
    ) -> Result<Vec<Arc<Element>>> {
        let domain = store.domain(domain)?;
        let state = self.state.lock();
        let tx = state.writes.get(domain.name());
        let records = domain.storage().get_relationships(tx, query)?;
        self.materialize(&domain, &state, records.into_iter().map(|r| r.id))
    }

    fn materialize(
        &self,
        domain: &DomainModel<B>,
        state: &TxState<B>,
        ids: impl Iterator<Item = Identity>,
    ) -> Result<Vec<Arc<Element>>> {
        let view = ReadView { tx: state.writes.get(domain.name()), tracking: Some(&state.tracking) };
        let mut out = Vec::new();
        for id in ids {
            if let Some(element) =
                domain.cache().get_element(domain.storage(), domain.link(), view, &id, None, false)?
            {
                out.push(element);
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Run the completing pipeline. `commit` false forces an abort.
    pub(crate) fn complete(&self, store: &Store<B>, commit: bool) -> Result<()> {
        let (writes, tracking, events, chain_aborted) = {
            let mut state = self.state.lock();
            if state.state.is_terminal() || state.state == SessionState::Completing {
                return Err(Error::SessionClosed(self.id));
            }
            state.state = SessionState::Completing;
            (
                std::mem::take(&mut state.writes),
                std::mem::take(&mut state.tracking),
                std::mem::take(&mut state.events),
                state.aborted,
            )
        };

        let mut outcome = Ok(());
        let mut aborted = !commit;
        if commit && chain_aborted {
            aborted = true;
            outcome = Err(Error::TransactionAborted(self.id));
        }
        if !aborted {
            let completion =
                SessionCompletion { session: self.id, aborted: false, tracking: &tracking, events: &events };
            for validator in store.events().before_commit.snapshot() {
                if let Err(e) = validator(&completion) {
                    warn!(session = %self.id, error = %e, "pre-commit validation failed");
                    aborted = true;
                    outcome = Err(e);
                    break;
                }
            }
        }

        for (name, tx) in writes {
            let Some(domain) = store.find_domain(&name) else {
                warn!(session = %self.id, domain = %name, "domain unloaded before completion, writes dropped");
                continue;
            };
            let applied = if aborted {
                domain.storage().rollback_tx(tx)
            } else {
                domain.storage().commit_tx(tx)
            };
            if let Err(e) = applied {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        self.state.lock().state = if aborted { SessionState::Aborted } else { SessionState::Committed };
        store.unregister(self);

        let completion = SessionCompletion { session: self.id, aborted, tracking: &tracking, events: &events };
        for hook in self.hooks.completing() {
            match panic::catch_unwind(AssertUnwindSafe(|| hook(&completion))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => store.report(Diagnostic::new(Some(self.id), e.to_string())),
                Err(payload) => store.report(Diagnostic::new(Some(self.id), panic_message(payload.as_ref()))),
            }
        }

        let released = store.locks().release_owner(self.id);
        if aborted {
            info!(session = %self.id, changes = tracking.len(), released, "session aborted");
        } else {
            info!(session = %self.id, changes = tracking.len(), released, "session committed");
        }
        outcome
    }
}

fn describe<'s>(schema: &'s SchemaInfo, property: &str) -> Result<&'s PropertyDescriptor> {
    schema
        .property(property)
        .ok_or_else(|| Error::MetadataNotFound(format!("{}.{property}", schema.id())))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("completing hook panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("completing hook panicked: {s}")
    } else {
        "completing hook panicked".to_string()
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work bound to the thread that opened it.
///
/// Dropping a session without `accept_changes` aborts it. Sessions are not
/// `Send`.
pub struct Session<'s, B: HypergraphStorage = MemoryHypergraph> {
    store: &'s Store<B>,
    tx: Arc<SessionTx<B>>,
    depth: usize,
    accepted: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl<B: HypergraphStorage> std::fmt::Debug for Session<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.tx.id)
            .field("depth", &self.depth)
            .field("accepted", &self.accepted)
            .finish()
    }
}

impl<'s, B: HypergraphStorage> Session<'s, B> {
    pub(crate) fn new(store: &'s Store<B>, tx: Arc<SessionTx<B>>, depth: usize) -> Self {
        Self { store, tx, depth, accepted: false, _thread_bound: PhantomData }
    }

    pub fn id(&self) -> TxId {
        self.tx.id
    }

    /// 1 for a root session.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_nested(&self) -> bool {
        self.depth > 1
    }

    pub fn config(&self) -> &SessionConfig {
        &self.tx.config
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.tx.config.isolation
    }

    pub fn timeout(&self) -> Duration {
        self.tx.config.timeout
    }

    pub fn state(&self) -> SessionState {
        self.tx.state()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.accepted {
            return Err(Error::SessionClosed(self.tx.id));
        }
        self.tx.ensure_open()
    }

    // ========================================================================
    // Locks & commands
    // ========================================================================

    /// Take a lock for this session's transaction. Dropping the handle
    /// releases this lock only; everything left is released on completion.
    pub fn acquire_lock(&self, lock_type: LockType, key: &str) -> Result<LockHandle> {
        self.ensure_open()?;
        if self.tx.config.read_only && lock_type != LockType::Shared {
            return Err(Error::ReadOnly(format!("{lock_type:?} lock on {key}")));
        }
        let locks = self.store.locks();
        let id = locks.acquire(self.tx.id, key, lock_type, self.tx.config.timeout)?;
        Ok(LockHandle::new(locks.clone(), id, key.to_string(), lock_type))
    }

    pub fn execute(&self, commands: impl IntoIterator<Item = Command>) -> Result<()> {
        self.ensure_open()?;
        self.tx.execute(self.store, commands)
    }

    /// Commit (root) or mark this level accepted (nested). Accepting a
    /// nested session again is a no-op.
    pub fn accept_changes(&mut self) -> Result<()> {
        if self.accepted && self.is_nested() {
            return Ok(());
        }
        self.ensure_open()?;
        if self.is_nested() {
            self.accepted = true;
            trace!(session = %self.tx.id, depth = self.depth, "nested session accepted");
            return Ok(());
        }
        let open = self.tx.state.lock().depth;
        if open > 1 {
            return Err(Error::TxError(format!(
                "session {} still has {} nested sessions open",
                self.tx.id,
                open - 1
            )));
        }
        self.accepted = true;
        self.tx.complete(self.store, true)
    }

    // ========================================================================
    // Element helpers
    // ========================================================================

    /// Add an entity. Without `id`, one is generated in the session's
    /// default domain.
    pub fn create_entity(&self, schema: &Arc<SchemaInfo>, id: Option<Identity>) -> Result<Arc<Element>> {
        self.ensure_open()?;
        self.tx.create_entity(self.store, schema, id)
    }

    /// Add a relationship. Without `id`, one is generated in the start's
    /// domain.
    pub fn create_relationship(
        &self,
        schema: &Arc<SchemaInfo>,
        start: &Identity,
        start_schema: &Arc<SchemaInfo>,
        end: &Identity,
        end_schema: &Arc<SchemaInfo>,
        id: Option<Identity>,
    ) -> Result<Arc<Element>> {
        self.ensure_open()?;
        self.tx
            .create_relationship(self.store, schema, start, start_schema, end, end_schema, id)
    }

    /// Remove an entity or relationship, cascading as needed.
    pub fn remove_element(&self, id: &Identity, throw_if_not_exists: bool) -> Result<()> {
        self.ensure_open()?;
        self.tx.remove_element(self.store, id, throw_if_not_exists)
    }

    pub fn set_property_value(&self, owner: &Identity, property: &str, value: impl Into<Value>) -> Result<()> {
        self.execute([Command::ChangePropertyValue {
            owner: owner.clone(),
            property: property.to_string(),
            value: value.into(),
            expected_version: None,
        }])
    }

    /// Like `set_property_value`, failing with `VersionConflict` unless the
    /// stored version equals `expected_version`.
    pub fn set_property_value_checked(
        &self,
        owner: &Identity,
        property: &str,
        value: impl Into<Value>,
        expected_version: u64,
    ) -> Result<()> {
        self.execute([Command::ChangePropertyValue {
            owner: owner.clone(),
            property: property.to_string(),
            value: value.into(),
            expected_version: Some(expected_version),
        }])
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get_property_value(&self, owner: &Identity, property: &str) -> Result<PropertyValue> {
        self.ensure_open()?;
        self.tx.get_property_value(self.store, owner, property)
    }

    pub fn get_element(&self, id: &Identity) -> Result<Option<Arc<Element>>> {
        self.get_element_with(id, None, false)
    }

    /// See `L1Cache::get_element` for `schema` and `local_only`.
    pub fn get_element_with(
        &self,
        id: &Identity,
        schema: Option<&SchemaInfo>,
        local_only: bool,
    ) -> Result<Option<Arc<Element>>> {
        self.ensure_open()?;
        self.tx.get_element(self.store, id, schema, local_only)
    }

    /// Elements of `domain` whose schema `is_a` the filter, in creation order.
    pub fn get_elements(&self, domain: &str, schema: Option<&SchemaInfo>, skip: usize) -> Result<Vec<Arc<Element>>> {
        self.ensure_open()?;
        self.tx.get_elements(self.store, domain, schema, skip)
    }

    pub fn get_relationships(&self, domain: &str, query: &RelationshipQuery) -> Result<Vec<Arc<Element>>> {
        self.ensure_open()?;
        self.tx.get_relationships(self.store, domain, query)
    }

    /// Memoized calculated property; reads made by `compute` become its
    /// dependencies.
    pub fn calculated_value(
        &self,
        owner: &Identity,
        property: &str,
        compute: impl FnOnce() -> Result<Value>,
    ) -> Result<Value> {
        self.ensure_open()?;
        self.store.calculated_value(owner, property, compute)
    }

    pub fn tracking_state(&self, id: &Identity) -> Option<TrackingState> {
        self.tx.state.lock().tracking.state_of(id)
    }

    /// Everything this session chain has touched, in first-touch order.
    pub fn tracked(&self) -> Vec<TrackingEntry> {
        self.tx.state.lock().tracking.entries().cloned().collect()
    }
}

impl<B: HypergraphStorage> Drop for Session<'_, B> {
    fn drop(&mut self) {
        if self.is_nested() {
            let mut state = self.tx.state.lock();
            if !self.accepted && !state.state.is_terminal() {
                debug!(session = %self.tx.id, depth = self.depth, "nested session dropped without accept");
                state.aborted = true;
            }
            state.depth = state.depth.saturating_sub(1);
            return;
        }
        if !self.accepted {
            if let Err(e) = self.tx.complete(self.store, false) {
                if !matches!(e, Error::SessionClosed(_)) {
                    warn!(session = %self.tx.id, error = %e, "abort on drop failed");
                }
            }
        }
    }
}
