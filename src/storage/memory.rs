//! In-memory hypergraph storage.
//!
//! This is the reference implementation of `HypergraphStorage`.
//! The committed graph lives behind one `RwLock`; every transaction carries
//! its own write set which is merged over the committed state on read and
//! applied under the write lock on commit.
//!
//! ## Limitations
//!
//! - **No conflict detection at commit**: two write sets touching the same
//!   identity are applied in commit order. The session engine serializes
//!   writers with exclusive locks before anything reaches storage.
//! - **No durability**: dropping the storage drops the graph.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::{HypergraphStorage, RelationshipQuery};
use crate::model::{EdgeEnds, GraphElement, Identity, PropertyChange, PropertyValue, Value};
use crate::schema::{PropertyDescriptor, SchemaInfo};
use crate::tx::{Transaction, TxId, TxMode};
use crate::{Error, Result};

type EdgeList = SmallVec<[Identity; 4]>;

// ============================================================================
// MemoryHypergraph
// ============================================================================

/// In-memory element store for one domain.
pub struct MemoryHypergraph {
    domain: String,
    state: RwLock<GraphState>,
    next_sequence: AtomicU64,
}

#[derive(Default)]
struct GraphState {
    elements: hashbrown::HashMap<Identity, GraphElement>,
    properties: hashbrown::HashMap<Identity, HashMap<String, PropertyValue>>,
    /// start id → relationship ids
    outgoing: hashbrown::HashMap<Identity, EdgeList>,
    /// end id → relationship ids
    incoming: hashbrown::HashMap<Identity, EdgeList>,
}

impl GraphState {
    fn index(&mut self, record: &GraphElement) {
        if let Some(ends) = &record.ends {
            self.outgoing.entry(ends.start.clone()).or_default().push(record.id.clone());
            self.incoming.entry(ends.end.clone()).or_default().push(record.id.clone());
        }
    }

    fn unindex(&mut self, record: &GraphElement) {
        if let Some(ends) = &record.ends {
            for (map, key) in [(&mut self.outgoing, &ends.start), (&mut self.incoming, &ends.end)] {
                if let Some(list) = map.get_mut(key) {
                    list.retain(|r| r != &record.id);
                    if list.is_empty() {
                        map.remove(key);
                    }
                }
            }
        }
    }
}

impl MemoryHypergraph {
    pub fn new(domain: impl AsRef<str>) -> Self {
        Self {
            domain: domain.as_ref().to_lowercase(),
            state: RwLock::new(GraphState::default()),
            next_sequence: AtomicU64::new(1),
        }
    }

    fn check_writable(&self, tx: &MemoryTx) -> Result<()> {
        match tx.mode {
            TxMode::ReadWrite => Ok(()),
            TxMode::ReadOnly => Err(Error::ReadOnly(format!(
                "transaction {} on domain {}",
                tx.id, self.domain
            ))),
        }
    }

    fn lookup(&self, state: &GraphState, tx: Option<&MemoryTx>, id: &Identity) -> Option<GraphElement> {
        if let Some(change) = tx.and_then(|tx| tx.elements.get(id)) {
            return change.clone();
        }
        state.elements.get(id).cloned()
    }

    /// Every visible record for which `keep` holds, in creation order.
    fn collect(
        &self,
        state: &GraphState,
        tx: Option<&MemoryTx>,
        keep: impl Fn(&GraphElement) -> bool,
    ) -> Vec<GraphElement> {
        let mut out: Vec<GraphElement> = state
            .elements
            .values()
            .filter(|r| tx.is_none_or(|tx| !tx.elements.contains_key(&r.id)))
            .filter(|r| keep(*r))
            .cloned()
            .collect();
        if let Some(tx) = tx {
            out.extend(tx.elements.values().flatten().filter(|r| keep(*r)).cloned());
        }
        out.sort_by_key(|r| r.sequence);
        out
    }

    /// Visible relationships leaving (`outgoing`) or entering `id`.
    fn incident(
        &self,
        state: &GraphState,
        tx: Option<&MemoryTx>,
        id: &Identity,
        outgoing: bool,
    ) -> Vec<GraphElement> {
        let index = if outgoing { &state.outgoing } else { &state.incoming };
        let mut out: Vec<GraphElement> = index
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|rel| self.lookup(state, tx, rel))
            .filter(|r| r.ends.as_ref().is_some_and(|e| if outgoing { &e.start == id } else { &e.end == id }))
            .collect();
        if let Some(tx) = tx {
            let seen: HashSet<Identity> = out.iter().map(|r| r.id.clone()).collect();
            out.extend(
                tx.elements
                    .values()
                    .flatten()
                    .filter(|r| !seen.contains(&r.id))
                    .filter(|r| {
                        r.ends
                            .as_ref()
                            .is_some_and(|e| if outgoing { &e.start == id } else { &e.end == id })
                    })
                    .cloned(),
            );
        }
        out.sort_by_key(|r| r.sequence);
        out
    }

    fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryHypergraph {
    fn default() -> Self {
        Self::new("default")
    }
}

// ============================================================================
// MemoryTx
// ============================================================================

/// Write set of one transaction on one domain.
#[derive(Debug)]
pub struct MemoryTx {
    id: TxId,
    mode: TxMode,
    /// `None` marks a removal of a committed element.
    elements: HashMap<Identity, Option<GraphElement>>,
    properties: HashMap<Identity, HashMap<String, PropertyValue>>,
    /// Owners whose committed properties are dropped on commit.
    cleared: HashSet<Identity>,
}

impl MemoryTx {
    /// Number of identities touched by this write set.
    pub fn len(&self) -> usize {
        self.elements.len() + self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.properties.is_empty() && self.cleared.is_empty()
    }
}

impl Transaction for MemoryTx {
    fn mode(&self) -> TxMode { self.mode }
    fn id(&self) -> TxId { self.id }
}

// ============================================================================
// HypergraphStorage impl
// ============================================================================

impl HypergraphStorage for MemoryHypergraph {
    type Tx = MemoryTx;

    fn create(domain: &str) -> Result<Self> {
        Ok(Self::new(domain))
    }

    fn domain(&self) -> &str {
        &self.domain
    }

    fn begin_tx(&self, id: TxId, mode: TxMode) -> Result<MemoryTx> {
        Ok(MemoryTx {
            id,
            mode,
            elements: HashMap::new(),
            properties: HashMap::new(),
            cleared: HashSet::new(),
        })
    }

    fn commit_tx(&self, tx: MemoryTx) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write();
        for (id, change) in tx.elements {
            if let Some(old) = state.elements.remove(&id) {
                state.unindex(&old);
            }
            if let Some(record) = change {
                state.index(&record);
                state.elements.insert(id, record);
            }
        }
        for owner in &tx.cleared {
            state.properties.remove(owner);
        }
        for (owner, props) in tx.properties {
            state.properties.entry(owner).or_default().extend(props);
        }
        debug!(domain = %self.domain, tx = %tx.id, elements = state.elements.len(), "write set committed");
        Ok(())
    }

    fn rollback_tx(&self, tx: MemoryTx) -> Result<()> {
        trace!(domain = %self.domain, tx = %tx.id, "write set discarded");
        Ok(())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    fn add_entity(
        &self,
        tx: &mut MemoryTx,
        id: Identity,
        schema: Arc<SchemaInfo>,
    ) -> Result<GraphElement> {
        self.check_writable(tx)?;
        let state = self.state.read();
        if self.lookup(&state, Some(tx), &id).is_some() {
            return Err(Error::DuplicateElement(id));
        }
        drop(state);

        let record = GraphElement { id: id.clone(), schema, sequence: self.next_sequence(), ends: None };
        tx.elements.insert(id, Some(record.clone()));
        Ok(record)
    }

    fn add_relationship(
        &self,
        tx: &mut MemoryTx,
        id: Identity,
        schema: Arc<SchemaInfo>,
        ends: EdgeEnds,
    ) -> Result<GraphElement> {
        self.check_writable(tx)?;
        let spec = schema.relationship().ok_or_else(|| Error::SchemaMismatch {
            expected: "relationship schema".into(),
            got: schema.id().to_string(),
        })?;

        let state = self.state.read();
        if self.lookup(&state, Some(tx), &id).is_some() {
            return Err(Error::DuplicateElement(id));
        }

        let start = self
            .lookup(&state, Some(tx), &ends.start)
            .ok_or_else(|| Error::InvalidReference(format!("start {} of {id}", ends.start)))?;
        if !start.schema.is_a_id(&spec.start) {
            return Err(Error::SchemaMismatch {
                expected: spec.start.to_string(),
                got: start.schema.id().to_string(),
            });
        }
        if ends.end.domain() == self.domain {
            let end = self
                .lookup(&state, Some(tx), &ends.end)
                .ok_or_else(|| Error::InvalidReference(format!("end {} of {id}", ends.end)))?;
            if !end.schema.is_a_id(&spec.end) {
                return Err(Error::SchemaMismatch {
                    expected: spec.end.to_string(),
                    got: end.schema.id().to_string(),
                });
            }
        }

        let same_schema = |r: &GraphElement| r.schema.id() == schema.id();
        if spec.cardinality.single_start()
            && self.incident(&state, Some(tx), &ends.start, true).iter().any(same_schema)
        {
            return Err(Error::InvalidCardinality(format!(
                "{} already has an outgoing {} ({:?})",
                ends.start,
                schema.id(),
                spec.cardinality
            )));
        }
        if spec.cardinality.single_end()
            && self.incident(&state, Some(tx), &ends.end, false).iter().any(same_schema)
        {
            return Err(Error::InvalidCardinality(format!(
                "{} already has an incoming {} ({:?})",
                ends.end,
                schema.id(),
                spec.cardinality
            )));
        }
        drop(state);

        let record = GraphElement {
            id: id.clone(),
            schema,
            sequence: self.next_sequence(),
            ends: Some(ends),
        };
        tx.elements.insert(id, Some(record.clone()));
        Ok(record)
    }

    fn remove_entity(
        &self,
        tx: &mut MemoryTx,
        id: &Identity,
        throw_if_not_exists: bool,
    ) -> Result<Option<GraphElement>> {
        self.check_writable(tx)?;
        let state = self.state.read();
        let record = match self.lookup(&state, Some(tx), id) {
            Some(r) if !r.is_relationship() => r,
            Some(_) => {
                return Err(Error::SchemaMismatch { expected: "entity".into(), got: id.to_string() });
            }
            None if throw_if_not_exists => return Err(Error::InvalidReference(id.to_string())),
            None => return Ok(None),
        };

        let attached = self.incident(&state, Some(tx), id, true).len()
            + self.incident(&state, Some(tx), id, false).len();
        if attached > 0 {
            return Err(Error::ConstraintViolation(format!(
                "cannot remove {id} with {attached} relationships"
            )));
        }
        let committed = state.elements.contains_key(id);
        drop(state);

        self.forget(tx, id, committed);
        Ok(Some(record))
    }

    fn remove_relationship(
        &self,
        tx: &mut MemoryTx,
        id: &Identity,
        throw_if_not_exists: bool,
    ) -> Result<Option<GraphElement>> {
        self.check_writable(tx)?;
        let state = self.state.read();
        let record = match self.lookup(&state, Some(tx), id) {
            Some(r) if r.is_relationship() => r,
            Some(_) => {
                return Err(Error::SchemaMismatch { expected: "relationship".into(), got: id.to_string() });
            }
            None if throw_if_not_exists => return Err(Error::InvalidReference(id.to_string())),
            None => return Ok(None),
        };
        let committed = state.elements.contains_key(id);
        drop(state);

        self.forget(tx, id, committed);
        Ok(Some(record))
    }

    fn set_property_value(
        &self,
        tx: &mut MemoryTx,
        owner: &Identity,
        property: &PropertyDescriptor,
        value: Value,
        expected_version: Option<u64>,
    ) -> Result<PropertyChange> {
        self.check_writable(tx)?;
        let old = self.get_property_value(Some(tx), owner, property)?;
        if let Some(expected) = expected_version {
            if expected != old.version {
                return Err(Error::VersionConflict {
                    key: owner.property_key(&property.name),
                    expected,
                    actual: old.version,
                });
            }
        }

        let new = PropertyValue { value, version: old.version + 1 };
        tx.properties
            .entry(owner.clone())
            .or_default()
            .insert(property.name.clone(), new.clone());
        Ok(PropertyChange { old, new })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn get_element(&self, tx: Option<&MemoryTx>, id: &Identity) -> Result<Option<GraphElement>> {
        let state = self.state.read();
        Ok(self.lookup(&state, tx, id))
    }

    fn get_property_value(
        &self,
        tx: Option<&MemoryTx>,
        owner: &Identity,
        property: &PropertyDescriptor,
    ) -> Result<PropertyValue> {
        let state = self.state.read();
        if self.lookup(&state, tx, owner).is_none() {
            return Err(Error::InvalidReference(owner.to_string()));
        }

        if let Some(tx) = tx {
            if let Some(value) = tx.properties.get(owner).and_then(|p| p.get(&property.name)) {
                return Ok(value.clone());
            }
            if tx.cleared.contains(owner) {
                return Ok(PropertyValue::default_for(property));
            }
        }
        Ok(state
            .properties
            .get(owner)
            .and_then(|p| p.get(&property.name))
            .cloned()
            .unwrap_or_else(|| PropertyValue::default_for(property)))
    }

    fn get_elements(
        &self,
        tx: Option<&MemoryTx>,
        schema: Option<&SchemaInfo>,
        skip: usize,
    ) -> Result<Vec<GraphElement>> {
        let state = self.state.read();
        let mut out = self.collect(&state, tx, |r| schema.is_none_or(|s| r.schema.is_a(s)));
        Ok(out.split_off(skip.min(out.len())))
    }

    fn get_relationships(
        &self,
        tx: Option<&MemoryTx>,
        query: &RelationshipQuery,
    ) -> Result<Vec<GraphElement>> {
        let state = self.state.read();
        let mut out = match (&query.start, &query.end) {
            (Some(start), _) => self.incident(&state, tx, start, true),
            (None, Some(end)) => self.incident(&state, tx, end, false),
            (None, None) => self.collect(&state, tx, |r| r.is_relationship()),
        };
        out.retain(|r| query.matches(r));
        Ok(out.split_off(query.skip.min(out.len())))
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    fn element_count(&self, tx: Option<&MemoryTx>) -> usize {
        let state = self.state.read();
        self.collect(&state, tx, |_| true).len()
    }

    fn relationship_count(&self, tx: Option<&MemoryTx>) -> usize {
        let state = self.state.read();
        self.collect(&state, tx, |r| r.is_relationship()).len()
    }
}

impl MemoryHypergraph {
    /// Record a removal in the write set and drop the element's properties.
    fn forget(&self, tx: &mut MemoryTx, id: &Identity, committed: bool) {
        if committed {
            tx.elements.insert(id.clone(), None);
        } else {
            tx.elements.remove(id);
        }
        tx.properties.remove(id);
        tx.cleared.insert(id.clone());
    }
}
